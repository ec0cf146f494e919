//! Error types for tuba-core.
//!
//! # Recovery
//!
//! | Error | Where it surfaces | Recovery |
//! |-------|-------------------|----------|
//! | [`Error::SourceUnavailable`] | telemetry fetches | Absorbed by the poller's fallback policy; never returned from a poll tick |
//! | [`Error::Api`] | telemetry fetches, remote ABV | Same as above for fetches; reported to the operator for ABV |
//! | [`Error::AlreadyPolling`] | [`TelemetryPoller::start`](crate::TelemetryPoller::start) | Stop the running session first |
//! | [`Error::NotPolling`] | [`TelemetryPoller::stop`](crate::TelemetryPoller::stop) | Nothing to do |
//! | [`Error::Abv`] | ABV refresh | See [`AbvError`] |
//! | [`Error::InvalidConfig`] | option validation | Fix configuration and restart |

use std::time::Duration;

use thiserror::Error;
use tuba_types::{BatchId, ParseError};

/// Errors that can occur in the monitoring core.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The telemetry source could not be reached.
    #[error("Telemetry source unavailable: {0}")]
    SourceUnavailable(String),

    /// The telemetry source answered with an error payload.
    #[error("Telemetry API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The telemetry source returned data that could not be decoded.
    #[error("Invalid telemetry data: {0}")]
    InvalidData(String),

    /// A monitoring session is already running.
    #[error("Already polling batch {0}")]
    AlreadyPolling(BatchId),

    /// No monitoring session is running.
    #[error("No monitoring session is active")]
    NotPolling,

    /// Session bookkeeping failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// ABV derivation failed.
    #[error(transparent)]
    Abv(#[from] AbvError),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::InvalidData(err.to_string())
    }
}

/// Session bookkeeping errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// `on_start` was called while a session was still open.
    #[error("A session for batch {0} is already active")]
    AlreadyActive(BatchId),

    /// `on_stop` was called without a matching `on_start`.
    #[error("No active session to stop")]
    NotActive,
}

/// ABV derivation errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AbvError {
    /// The batch has no recorded original gravity.
    #[error("Cannot compute ABV: no baseline gravity recorded for batch {0}")]
    MissingBaseline(BatchId),

    /// A gravity value is missing, not finite, or outside the plausible range.
    #[error("Invalid specific gravity: {0}")]
    InvalidGravity(f64),

    /// The batch was refreshed too recently.
    #[error("ABV for batch {batch_id} was refreshed recently; retry in {retry_after:?}")]
    RateLimited {
        batch_id: BatchId,
        retry_after: Duration,
    },
}

/// Result type alias using tuba-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
