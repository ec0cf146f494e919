//! Trait abstraction over telemetry sources.
//!
//! The poller talks to the hydrometer backend only through
//! [`TelemetrySource`], so the same polling logic runs against the HTTP
//! backend, the store-backed source inside the service, or a
//! [`MockTelemetrySource`](crate::mock::MockTelemetrySource) in tests.

use std::sync::Arc;

use async_trait::async_trait;

use tuba_types::{AbvResult, BatchId, RawSample, Reading};

use crate::error::Result;

/// A source of hydrometer telemetry.
///
/// # Example
///
/// ```ignore
/// use tuba_core::{TelemetrySource, Result};
/// use tuba_types::BatchId;
///
/// async fn latest_brix<S: TelemetrySource>(source: &S, batch: BatchId) -> Result<Option<f64>> {
///     let readings = source.fetch_readings(batch).await?;
///     Ok(readings.last().map(|r| r.brix))
/// }
/// ```
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Ordered readings recorded for a batch, oldest first.
    async fn fetch_readings(&self, batch_id: BatchId) -> Result<Vec<Reading>>;

    /// The single latest raw sample reported by the hydrometer.
    async fn preview_reading(&self) -> Result<RawSample>;

    /// Ask the source to derive the current ABV of a batch.
    async fn update_abv(&self, batch_id: BatchId) -> Result<AbvResult>;

    /// Short human-readable name used in logs.
    fn name(&self) -> &str {
        "telemetry"
    }
}

#[async_trait]
impl<T: TelemetrySource + ?Sized> TelemetrySource for Arc<T> {
    async fn fetch_readings(&self, batch_id: BatchId) -> Result<Vec<Reading>> {
        (**self).fetch_readings(batch_id).await
    }

    async fn preview_reading(&self) -> Result<RawSample> {
        (**self).preview_reading().await
    }

    async fn update_abv(&self, batch_id: BatchId) -> Result<AbvResult> {
        (**self).update_abv(batch_id).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
