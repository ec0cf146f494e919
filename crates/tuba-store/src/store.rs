//! Main store implementation.

use std::path::Path;

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use time::macros::format_description;
use time::{Date, OffsetDateTime};
use tracing::{debug, info};
use uuid::Uuid;

use tuba_types::{Batch, BatchId, ChartPoint, Session, day_label};

use crate::error::{Error, Result};
use crate::models::{
    MeasurementUpdate, NewBatch, ProductionDay, RawTelemetry, StoredDraft, StoredTelemetry,
};
use crate::queries::ProductionQuery;
use crate::schema;

const BATCH_COLUMNS: &str = "id, start_date, end_date, brix, alcohol, temperature, \
                             produced_liters, original_gravity, created_at";

const TELEMETRY_COLUMNS: &str = "id, batch_id, received_at, angle, gravity, temperature, battery";

/// SQLite-based store for batches, production totals, sessions, drafts and
/// hydrometer telemetry.
pub struct Store {
    conn: Connection,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.conn.path())
            .finish()
    }
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self { conn })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }
}

// Batch operations
impl Store {
    /// Create a batch with the next sequential id.
    ///
    /// Produced liters, if given, are added to the production total of the
    /// start date.
    pub fn create_batch(&self, new: &NewBatch) -> Result<Batch> {
        if new.end_date < new.start_date {
            return Err(Error::InvalidValue(format!(
                "end date {} is before start date {}",
                new.end_date, new.start_date
            )));
        }
        for (name, value) in [
            ("brix", new.brix),
            ("alcohol", new.alcohol),
            ("temperature", new.temperature),
            ("produced_liters", new.produced_liters),
            ("original_gravity", new.original_gravity),
        ] {
            check_finite(name, value)?;
        }

        let tx = self.conn.unchecked_transaction()?;
        let next: i64 = tx.query_row("SELECT COALESCE(MAX(id), 0) + 1 FROM batches", [], |row| {
            row.get(0)
        })?;
        let id = u32::try_from(next)
            .ok()
            .and_then(|n| BatchId::new(n).ok())
            .ok_or_else(|| Error::InvalidValue(format!("batch id {next} out of range")))?;

        tx.execute(
            &format!("INSERT INTO batches ({BATCH_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
            rusqlite::params![
                next,
                format_date(new.start_date),
                format_date(new.end_date),
                new.brix,
                new.alcohol,
                new.temperature,
                new.produced_liters,
                new.original_gravity,
                OffsetDateTime::now_utc().unix_timestamp(),
            ],
        )?;

        if let Some(liters) = new.produced_liters {
            add_production(&tx, new.start_date, liters, 0.0)?;
        }
        tx.commit()?;

        info!("Created batch {} starting {}", id, new.start_date);
        query_batch(&self.conn, id)?.ok_or(Error::BatchNotFound(id))
    }

    /// Get a batch by id.
    pub fn get_batch(&self, id: BatchId) -> Result<Option<Batch>> {
        query_batch(&self.conn, id)
    }

    /// List all batches ordered by id.
    pub fn list_batches(&self) -> Result<Vec<Batch>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {BATCH_COLUMNS} FROM batches ORDER BY id ASC"))?;
        let batches = stmt
            .query_map([], batch_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(batches)
    }

    /// Count stored batches.
    pub fn count_batches(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM batches", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Replace a batch's measurements.
    ///
    /// A change to produced liters books the difference on `log_date` (the
    /// start date when absent) so production totals stay consistent.
    pub fn update_measurements(&self, id: BatchId, update: &MeasurementUpdate) -> Result<Batch> {
        for (name, value) in [
            ("brix", update.brix),
            ("alcohol", update.alcohol),
            ("temperature", update.temperature),
            ("produced_liters", update.produced_liters),
            ("original_gravity", update.original_gravity),
        ] {
            check_finite(name, value)?;
        }

        let tx = self.conn.unchecked_transaction()?;
        let current = query_batch(&tx, id)?.ok_or(Error::BatchNotFound(id))?;

        tx.execute(
            "UPDATE batches SET
                brix = COALESCE(?2, brix),
                alcohol = COALESCE(?3, alcohol),
                temperature = COALESCE(?4, temperature),
                produced_liters = COALESCE(?5, produced_liters),
                original_gravity = COALESCE(?6, original_gravity)
             WHERE id = ?1",
            rusqlite::params![
                id.get(),
                update.brix,
                update.alcohol,
                update.temperature,
                update.produced_liters,
                update.original_gravity,
            ],
        )?;

        if let Some(liters) = update.produced_liters {
            let delta = liters - current.produced_liters.unwrap_or(0.0);
            if delta != 0.0 {
                let date = update.log_date.unwrap_or(current.start_date);
                add_production(&tx, date, delta, 0.0)?;
            }
        }
        tx.commit()?;

        debug!("Updated measurements of batch {}", id);
        query_batch(&self.conn, id)?.ok_or(Error::BatchNotFound(id))
    }

    /// Delete every batch and production total.
    ///
    /// Sessions, drafts and telemetry are kept. Returns the number of
    /// batches removed.
    pub fn clear_batches(&self) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let removed = tx.execute("DELETE FROM batches", [])?;
        tx.execute("DELETE FROM production", [])?;
        tx.commit()?;
        info!("Cleared {} batch(es) and production totals", removed);
        Ok(removed)
    }
}

// Production operations
impl Store {
    /// Add to the production totals of a day.
    pub fn record_production(&self, date: Date, liters: f64, sales: f64) -> Result<ProductionDay> {
        check_finite("liters", Some(liters))?;
        check_finite("sales", Some(sales))?;
        add_production(&self.conn, date, liters, sales)?;
        self.production_day(date)?
            .ok_or_else(|| Error::InvalidValue(format!("no production recorded for {date}")))
    }

    /// Totals of a single day.
    pub fn production_day(&self, date: Date) -> Result<Option<ProductionDay>> {
        let day = self
            .conn
            .query_row(
                "SELECT date, liters, sales FROM production WHERE date = ?",
                [format_date(date)],
                |row| {
                    Ok(ProductionDay {
                        date: date_col(row, 0)?,
                        liters: row.get(1)?,
                        sales: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(day)
    }

    /// Most recent year with a non-zero production total.
    pub fn latest_production_year(&self) -> Result<Option<i32>> {
        let date = self
            .conn
            .query_row(
                "SELECT date FROM production WHERE liters <> 0 OR sales <> 0
                 ORDER BY date DESC LIMIT 1",
                [],
                |row| date_col(row, 0),
            )
            .optional()?;
        Ok(date.map(|d| d.year()))
    }

    /// Daily chart points of a production series, oldest first.
    ///
    /// Labels use the `"May-20"` form. Without a year filter, days from
    /// different years share labels; chart callers pin a year.
    pub fn production_series(&self, query: &ProductionQuery) -> Result<Vec<ChartPoint>> {
        let sql = query.build_sql();
        let (_, params) = query.build_where();

        debug!("Executing query: {}", sql);

        let mut stmt = self.conn.prepare(&sql)?;
        let points = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                Ok(ChartPoint::new(day_label(date_col(row, 0)?), row.get(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(points)
    }
}

// Session operations
impl Store {
    /// Persist a completed session.
    pub fn insert_session(&self, session: &Session) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sessions (id, batch_id, start_time, end_time, duration_seconds)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                session.id.to_string(),
                session.batch_id.get(),
                session.start_time.unix_timestamp(),
                session.end_time.unix_timestamp(),
                i64::try_from(session.duration_seconds).unwrap_or(i64::MAX),
            ],
        )?;
        Ok(())
    }

    /// Most recent sessions, newest first.
    pub fn recent_sessions(&self, limit: u32) -> Result<Vec<Session>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, batch_id, start_time, end_time, duration_seconds
             FROM sessions ORDER BY end_time DESC, start_time DESC LIMIT ?",
        )?;
        let sessions = stmt
            .query_map([limit], |row| {
                let id: String = row.get(0)?;
                let duration: i64 = row.get(4)?;
                Ok(Session {
                    id: Uuid::parse_str(&id).map_err(|e| conversion_error(0, Type::Text, e))?,
                    batch_id: batch_id_col(row, 1)?,
                    start_time: timestamp_col(row, 2)?,
                    end_time: timestamp_col(row, 3)?,
                    duration_seconds: u64::try_from(duration)
                        .map_err(|e| conversion_error(4, Type::Integer, e))?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sessions)
    }
}

// Draft operations
impl Store {
    /// Save a draft under `key`, replacing any previous value.
    pub fn put_draft(&self, key: &str, value: &serde_json::Value) -> Result<StoredDraft> {
        if key.trim().is_empty() {
            return Err(Error::InvalidValue("draft key must not be empty".to_string()));
        }
        let now = OffsetDateTime::now_utc();
        self.conn.execute(
            "INSERT INTO drafts (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            rusqlite::params![key, serde_json::to_string(value)?, now.unix_timestamp()],
        )?;
        self.get_draft(key)?
            .ok_or_else(|| Error::InvalidValue(format!("draft '{key}' vanished after save")))
    }

    /// Load a draft.
    pub fn get_draft(&self, key: &str) -> Result<Option<StoredDraft>> {
        let row = self
            .conn
            .query_row(
                "SELECT key, value, updated_at FROM drafts WHERE key = ?",
                [key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        timestamp_col(row, 2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(key, value, updated_at)| {
            Ok(StoredDraft {
                key,
                value: serde_json::from_str(&value)?,
                updated_at,
            })
        })
        .transpose()
    }

    /// Delete a draft. Returns whether it existed.
    pub fn delete_draft(&self, key: &str) -> Result<bool> {
        let removed = self.conn.execute("DELETE FROM drafts WHERE key = ?", [key])?;
        Ok(removed > 0)
    }

    /// Keys of all saved drafts, sorted.
    pub fn list_drafts(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT key FROM drafts ORDER BY key ASC")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }
}

// Telemetry operations
impl Store {
    /// Store a raw hydrometer sample for a batch.
    pub fn insert_telemetry(&self, batch_id: BatchId, sample: &RawTelemetry) -> Result<i64> {
        for (name, value) in [
            ("angle", sample.angle),
            ("gravity", sample.gravity),
            ("temperature", sample.temperature),
            ("battery", sample.battery),
        ] {
            check_finite(name, Some(value))?;
        }

        let received_at = sample
            .received_at
            .unwrap_or_else(OffsetDateTime::now_utc)
            .unix_timestamp();

        self.conn.execute(
            "INSERT INTO telemetry (batch_id, received_at, angle, gravity, temperature, battery)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                batch_id.get(),
                received_at,
                sample.angle,
                sample.gravity,
                sample.temperature,
                sample.battery,
            ],
        )?;

        Ok(self.conn.last_insert_rowid())
    }

    /// Samples of a batch, oldest first.
    pub fn telemetry_for_batch(&self, batch_id: BatchId) -> Result<Vec<StoredTelemetry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TELEMETRY_COLUMNS} FROM telemetry WHERE batch_id = ?
             ORDER BY received_at ASC, id ASC"
        ))?;
        let samples = stmt
            .query_map([batch_id.get()], telemetry_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(samples)
    }

    /// The most recent sample across all batches.
    pub fn latest_telemetry(&self) -> Result<Option<StoredTelemetry>> {
        let sample = self
            .conn
            .query_row(
                &format!(
                    "SELECT {TELEMETRY_COLUMNS} FROM telemetry
                     ORDER BY received_at DESC, id DESC LIMIT 1"
                ),
                [],
                telemetry_from_row,
            )
            .optional()?;
        Ok(sample)
    }
}

/// Format a date as stored (`YYYY-MM-DD`).
pub(crate) fn format_date(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

fn check_finite(name: &str, value: Option<f64>) -> Result<()> {
    match value {
        Some(v) if !v.is_finite() => Err(Error::InvalidValue(format!(
            "{name} must be a finite number, got {v}"
        ))),
        _ => Ok(()),
    }
}

fn add_production(conn: &Connection, date: Date, liters: f64, sales: f64) -> Result<()> {
    conn.execute(
        "INSERT INTO production (date, liters, sales) VALUES (?1, ?2, ?3)
         ON CONFLICT(date) DO UPDATE SET
            liters = liters + excluded.liters,
            sales = sales + excluded.sales",
        rusqlite::params![format_date(date), liters, sales],
    )?;
    Ok(())
}

fn query_batch(conn: &Connection, id: BatchId) -> Result<Option<Batch>> {
    let batch = conn
        .query_row(
            &format!("SELECT {BATCH_COLUMNS} FROM batches WHERE id = ?"),
            [id.get()],
            batch_from_row,
        )
        .optional()?;
    Ok(batch)
}

fn batch_from_row(row: &Row<'_>) -> rusqlite::Result<Batch> {
    Ok(Batch {
        id: batch_id_col(row, 0)?,
        start_date: date_col(row, 1)?,
        end_date: date_col(row, 2)?,
        brix: row.get(3)?,
        alcohol: row.get(4)?,
        temperature: row.get(5)?,
        produced_liters: row.get(6)?,
        original_gravity: row.get(7)?,
        created_at: timestamp_col(row, 8)?,
    })
}

fn telemetry_from_row(row: &Row<'_>) -> rusqlite::Result<StoredTelemetry> {
    Ok(StoredTelemetry {
        id: row.get(0)?,
        batch_id: batch_id_col(row, 1)?,
        received_at: timestamp_col(row, 2)?,
        angle: row.get(3)?,
        gravity: row.get(4)?,
        temperature: row.get(5)?,
        battery: row.get(6)?,
    })
}

fn conversion_error<E>(idx: usize, ty: Type, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

fn date_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Date> {
    let text: String = row.get(idx)?;
    Date::parse(&text, format_description!("[year]-[month]-[day]"))
        .map_err(|e| conversion_error(idx, Type::Text, e))
}

fn timestamp_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let secs: i64 = row.get(idx)?;
    OffsetDateTime::from_unix_timestamp(secs).map_err(|e| conversion_error(idx, Type::Integer, e))
}

fn batch_id_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<BatchId> {
    let raw: i64 = row.get(idx)?;
    let n = u32::try_from(raw).map_err(|e| conversion_error(idx, Type::Integer, e))?;
    BatchId::new(n).map_err(|e| conversion_error(idx, Type::Integer, e))
}
