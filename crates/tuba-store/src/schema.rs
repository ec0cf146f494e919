//! Database schema.

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
pub fn initialize(conn: &Connection) -> Result<()> {
    let version = get_schema_version(conn)?;

    if version == 0 {
        create_schema_v1(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    }

    Ok(())
}

/// Get the current schema version (0 for a fresh database).
pub(crate) fn get_schema_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: i32 =
        conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))?;

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?)",
        [version],
    )?;
    Ok(())
}

/// Create the initial schema (version 1).
///
/// Calendar dates are stored as `YYYY-MM-DD` text so they sort
/// chronologically; instants are unix seconds.
fn create_schema_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        );

        -- Fermentation batches; id is the sequential batch number
        CREATE TABLE IF NOT EXISTS batches (
            id INTEGER PRIMARY KEY CHECK (id > 0),
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            brix REAL,
            alcohol REAL,
            temperature REAL,
            produced_liters REAL,
            original_gravity REAL,
            created_at INTEGER NOT NULL
        );

        -- Per-day production totals feeding the charts
        CREATE TABLE IF NOT EXISTS production (
            date TEXT PRIMARY KEY,
            liters REAL NOT NULL DEFAULT 0,
            sales REAL NOT NULL DEFAULT 0
        );

        -- Completed monitoring sessions
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            batch_id INTEGER NOT NULL,
            start_time INTEGER NOT NULL,
            end_time INTEGER NOT NULL,
            duration_seconds INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_end ON sessions(end_time);

        -- Autosaved form state and cached chart series
        CREATE TABLE IF NOT EXISTS drafts (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Raw hydrometer samples
        CREATE TABLE IF NOT EXISTS telemetry (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            batch_id INTEGER NOT NULL,
            received_at INTEGER NOT NULL,
            angle REAL NOT NULL,
            gravity REAL NOT NULL,
            temperature REAL NOT NULL,
            battery REAL NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_telemetry_batch_time
            ON telemetry(batch_id, received_at);
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_fresh_database() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 0);

        initialize(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);

        for table in ["batches", "production", "sessions", "drafts", "telemetry"] {
            let exists: bool = conn
                .query_row(
                    "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert!(exists, "missing table {table}");
        }
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        initialize(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_initialize_keeps_existing_rows() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        conn.execute(
            "INSERT INTO production (date, liters, sales) VALUES ('2025-05-20', 40.0, 0.0)",
            [],
        )
        .unwrap();

        initialize(&conn).unwrap();
        let liters: f64 = conn
            .query_row("SELECT liters FROM production", [], |row| row.get(0))
            .unwrap();
        assert_eq!(liters, 40.0);
    }
}
