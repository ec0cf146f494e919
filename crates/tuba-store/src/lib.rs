//! Local data persistence for the tuba fermentation monitor.
//!
//! This crate provides SQLite-based storage behind the dashboard: batch
//! records, per-day production totals for the charts, completed monitoring
//! sessions, autosaved form drafts, and raw hydrometer samples.
//!
//! # Features
//!
//! - Sequentially numbered batches with partial measurement updates
//! - Production totals that accumulate per day, queried as chart series
//! - Session history, newest first
//! - String-keyed JSON drafts
//! - Raw iSpindel samples per batch
//!
//! # Example
//!
//! ```no_run
//! use tuba_store::{ProductionQuery, SeriesKind, Store};
//!
//! let store = Store::open_default()?;
//!
//! let liters = store.production_series(&ProductionQuery::new(SeriesKind::Liters).year(2025))?;
//! for point in liters {
//!     println!("{}: {} L", point.label, point.value);
//! }
//! # Ok::<(), tuba_store::Error>(())
//! ```

mod error;
mod models;
mod queries;
mod schema;
mod store;

pub use error::{Error, Result};
pub use models::{
    MeasurementUpdate, NewBatch, ProductionDay, RawTelemetry, StoredDraft, StoredTelemetry,
};
pub use queries::{ProductionQuery, SeriesKind};
pub use schema::SCHEMA_VERSION;
pub use store::Store;

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/tuba/data.db`
/// - macOS: `~/Library/Application Support/tuba/data.db`
/// - Windows: `C:\Users\<user>\AppData\Local\tuba\data.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("tuba")
        .join("data.db")
}
