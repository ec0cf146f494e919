//! Platform-agnostic types for the tuba fermentation monitor.
//!
//! This crate provides the data model shared by the core pipeline
//! (tuba-core), the record store (tuba-store) and the HTTP service
//! (tuba-service).
//!
//! # Features
//!
//! - Batch records with sequential, zero-padded identifiers
//! - Telemetry readings tagged with their provenance
//! - Chart points, completed sessions and ABV results
//! - Error types for value parsing
//!
//! # Example
//!
//! ```
//! use tuba_types::{BatchId, Readiness};
//!
//! let id: BatchId = "008".parse().unwrap();
//! assert_eq!(id.next().to_string(), "009");
//! assert_eq!(Readiness::NotReady.to_string(), "N/A");
//! ```

pub mod error;
pub mod types;

pub use error::{ParseError, ParseResult};
pub use types::{
    AbvResult, Batch, BatchId, ChartPoint, MONTH_ABBREVIATIONS, RawSample, Readiness, Reading,
    Session, SourcedReading, day_label,
};
