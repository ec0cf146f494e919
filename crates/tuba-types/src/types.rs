//! Core types for fermentation batches and telemetry.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::{Date, Duration, Month, OffsetDateTime};
use uuid::Uuid;

use crate::error::ParseError;

#[cfg(feature = "serde")]
time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

/// Three-letter month tokens in calendar order.
///
/// Chart labels embed one of these tokens (`"May-20"`); the aggregator keys
/// monthly buckets on them.
pub const MONTH_ABBREVIATIONS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Format a date as a daily chart label (`"May-20"`).
///
/// ```
/// use time::macros::date;
/// use tuba_types::day_label;
///
/// assert_eq!(day_label(date!(2025 - 05 - 20)), "May-20");
/// assert_eq!(day_label(date!(2025 - 06 - 02)), "Jun-02");
/// ```
#[must_use]
pub fn day_label(date: Date) -> String {
    let month = MONTH_ABBREVIATIONS[usize::from(u8::from(date.month())) - 1];
    format!("{}-{:02}", month, date.day())
}

/// Identifier of a fermentation batch.
///
/// Batches are numbered sequentially from 1 and displayed zero-padded to
/// three digits (`"007"`). Parsing accepts both the padded and the bare form.
///
/// ```
/// use tuba_types::BatchId;
///
/// let id: BatchId = "007".parse().unwrap();
/// assert_eq!(id.get(), 7);
/// assert_eq!(id.to_string(), "007");
/// assert_eq!("12".parse::<BatchId>().unwrap().to_string(), "012");
/// assert!("000".parse::<BatchId>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct BatchId(u32);

impl BatchId {
    /// The first batch (`"001"`).
    pub const FIRST: BatchId = BatchId(1);

    /// Create a batch id from its sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidBatchId`] for zero, which is never assigned.
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if value == 0 {
            return Err(ParseError::InvalidBatchId("0".to_string()));
        }
        Ok(Self(value))
    }

    /// The underlying sequence number.
    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// The id that follows this one in creation order.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

impl FromStr for BatchId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::InvalidBatchId(s.to_string()));
        }
        let value = trimmed
            .parse::<u32>()
            .map_err(|_| ParseError::InvalidBatchId(s.to_string()))?;
        Self::new(value).map_err(|_| ParseError::InvalidBatchId(s.to_string()))
    }
}

impl TryFrom<String> for BatchId {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BatchId> for String {
    fn from(id: BatchId) -> Self {
        id.to_string()
    }
}

/// Readiness of a batch for distillation.
///
/// Always derived from the batch's current measurements; never stored.
///
/// # Display vs Serialization
///
/// `Display` uses the dashboard labels ("Ready", "N/A"), while serde uses the
/// variant names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Readiness {
    /// Every threshold holds.
    Ready,
    /// At least one threshold fails or a measurement is missing.
    NotReady,
}

impl Readiness {
    /// Whether this is [`Readiness::Ready`].
    #[must_use]
    pub fn is_ready(self) -> bool {
        self == Readiness::Ready
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Ready => write!(f, "Ready"),
            Readiness::NotReady => write!(f, "N/A"),
        }
    }
}

/// A fermentation run.
///
/// Scalar measurements are `None` until an operator records them. The
/// readiness status is not a field: compute it from the measurements each
/// time it is needed.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Batch {
    /// Sequential identifier.
    pub id: BatchId,
    /// Day the batch was started.
    #[cfg_attr(feature = "serde", serde(with = "iso_date"))]
    pub start_date: Date,
    /// Estimated completion day (3-5 days after the start).
    #[cfg_attr(feature = "serde", serde(with = "iso_date"))]
    pub end_date: Date,
    /// Dissolved sugar in °Bx.
    pub brix: Option<f64>,
    /// Alcohol content in percent.
    pub alcohol: Option<f64>,
    /// Temperature in °C.
    pub temperature: Option<f64>,
    /// Volume produced in liters.
    pub produced_liters: Option<f64>,
    /// Specific gravity recorded when the batch was confirmed (ABV baseline).
    pub original_gravity: Option<f64>,
    /// When the record was created.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub created_at: OffsetDateTime,
}

impl Batch {
    /// Estimated end date for a batch started on `start_date`.
    ///
    /// ```
    /// use time::macros::date;
    /// use tuba_types::Batch;
    ///
    /// assert_eq!(Batch::estimated_end(date!(2025 - 05 - 30), 3), date!(2025 - 06 - 02));
    /// ```
    #[must_use]
    pub fn estimated_end(start_date: Date, duration_days: u8) -> Date {
        start_date.saturating_add(Duration::days(i64::from(duration_days)))
    }

    /// Month in which the batch started.
    #[must_use]
    pub fn start_month(&self) -> Month {
        self.start_date.month()
    }
}

/// One telemetry sample taken during a monitoring session.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Reading {
    /// Sample label (wall-clock time or sequence index).
    pub time: String,
    /// Dissolved sugar in °Bx.
    pub brix: f64,
    /// Specific gravity.
    pub gravity: f64,
    /// Temperature in °C.
    pub temperature: f64,
}

/// A reading tagged with where it came from.
///
/// The poller keeps live telemetry and fallback values apart so consumers
/// never have to guess the provenance of a point.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "source", rename_all = "snake_case"))]
pub enum SourcedReading {
    /// Fetched from the telemetry source.
    Live(Reading),
    /// Derived locally from the last known reading while the source was unavailable.
    Simulated(Reading),
}

impl SourcedReading {
    /// The underlying reading.
    #[must_use]
    pub fn reading(&self) -> &Reading {
        match self {
            SourcedReading::Live(r) | SourcedReading::Simulated(r) => r,
        }
    }

    /// Consume the tag and return the reading.
    #[must_use]
    pub fn into_reading(self) -> Reading {
        match self {
            SourcedReading::Live(r) | SourcedReading::Simulated(r) => r,
        }
    }

    /// Whether the reading was produced by the fallback policy.
    #[must_use]
    pub fn is_simulated(&self) -> bool {
        matches!(self, SourcedReading::Simulated(_))
    }
}

/// The latest raw sample reported by the hydrometer.
///
/// Gravity and brix are derived from the tilt angle by the source.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RawSample {
    /// Tilt angle in degrees.
    pub angle: f64,
    /// Specific gravity.
    pub gravity: f64,
    /// Dissolved sugar in °Bx.
    pub brix: f64,
    /// Temperature in °C.
    pub temperature: f64,
    /// Battery voltage.
    pub battery: f64,
    /// When the sample was received.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
}

/// A labelled numeric point handed to the chart renderer.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChartPoint {
    /// Bucket label (`"May-20"`, `"May"`).
    pub label: String,
    /// Bucket value.
    pub value: f64,
}

impl ChartPoint {
    /// Create a new chart point.
    pub fn new(label: impl Into<String>, value: f64) -> Self {
        Self {
            label: label.into(),
            value,
        }
    }
}

/// One completed monitoring session.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Session {
    /// Unique identifier.
    pub id: Uuid,
    /// Batch that was monitored.
    pub batch_id: BatchId,
    /// When polling started.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub start_time: OffsetDateTime,
    /// When polling stopped (never before `start_time`).
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub end_time: OffsetDateTime,
    /// Whole seconds between start and end.
    pub duration_seconds: u64,
}

/// Result of an alcohol-by-volume derivation.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AbvResult {
    /// Alcohol by volume in percent.
    pub current_abv: f64,
    /// Baseline gravity the ABV was derived from.
    pub original_gravity: f64,
    /// Gravity the ABV was derived at, when reported.
    #[cfg_attr(feature = "serde", serde(default))]
    pub current_gravity: Option<f64>,
}
