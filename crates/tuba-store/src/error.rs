//! Error types for tuba-store.

use std::path::PathBuf;

use tuba_types::BatchId;

/// Result type for tuba-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tuba-store.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Batch not found in database.
    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    /// A stored or supplied value is out of range.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
