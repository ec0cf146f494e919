//! Error types for data parsing in tuba-types.

use thiserror::Error;

/// Errors that can occur when parsing tuba data values.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// A batch identifier was empty, non-numeric, or zero.
    #[error("Invalid batch id: {0:?}")]
    InvalidBatchId(String),

    /// Any other malformed value.
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type alias using tuba-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
