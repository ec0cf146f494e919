//! Data models for stored data.

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use tuba_types::BatchId;

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

/// Input for creating a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBatch {
    /// Day the batch was started.
    #[serde(with = "iso_date")]
    pub start_date: Date,
    /// Estimated completion day.
    #[serde(with = "iso_date")]
    pub end_date: Date,
    #[serde(default)]
    pub brix: Option<f64>,
    #[serde(default)]
    pub alcohol: Option<f64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub produced_liters: Option<f64>,
    #[serde(default)]
    pub original_gravity: Option<f64>,
}

/// Partial update of a batch's measurements.
///
/// `None` leaves the stored value unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementUpdate {
    pub brix: Option<f64>,
    pub alcohol: Option<f64>,
    pub temperature: Option<f64>,
    pub produced_liters: Option<f64>,
    pub original_gravity: Option<f64>,
    /// Day the production change is booked on; defaults to the batch start.
    #[serde(with = "iso_date::option")]
    pub log_date: Option<Date>,
}

impl MeasurementUpdate {
    /// Whether the update changes nothing.
    pub fn is_empty(&self) -> bool {
        self.brix.is_none()
            && self.alcohol.is_none()
            && self.temperature.is_none()
            && self.produced_liters.is_none()
            && self.original_gravity.is_none()
    }
}

/// Production totals for one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionDay {
    #[serde(with = "iso_date")]
    pub date: Date,
    pub liters: f64,
    pub sales: f64,
}

/// A raw hydrometer sample as posted by the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTelemetry {
    pub angle: f64,
    pub gravity: f64,
    pub temperature: f64,
    pub battery: f64,
    /// When the sample was taken; the store uses the insert time if absent.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub received_at: Option<OffsetDateTime>,
}

/// A hydrometer sample stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTelemetry {
    /// Database row ID.
    pub id: i64,
    pub batch_id: BatchId,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    pub angle: f64,
    pub gravity: f64,
    pub temperature: f64,
    pub battery: f64,
}

/// An autosaved draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDraft {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}
