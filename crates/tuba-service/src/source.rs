//! Telemetry source backed by the local store.
//!
//! Serves the samples posted to `/ispindel` to the poller, so the service
//! can run without a separate bridge.

use std::sync::Arc;

use async_trait::async_trait;
use time::macros::format_description;
use tokio::sync::Mutex;
use tracing::debug;

use tuba_core::{Error, Result, TelemetrySource, derive_abv, gravity_to_brix};
use tuba_store::{StoredTelemetry, Store};
use tuba_types::{AbvResult, BatchId, RawSample, Reading};

/// Reads telemetry straight from the service database.
#[derive(Clone)]
pub struct LocalTelemetrySource {
    store: Arc<Mutex<Store>>,
}

impl std::fmt::Debug for LocalTelemetrySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTelemetrySource").finish_non_exhaustive()
    }
}

impl LocalTelemetrySource {
    /// Create a source sharing `store` with the rest of the service.
    pub fn new(store: Arc<Mutex<Store>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TelemetrySource for LocalTelemetrySource {
    async fn fetch_readings(&self, batch_id: BatchId) -> Result<Vec<Reading>> {
        let rows = {
            let store = self.store.lock().await;
            store.telemetry_for_batch(batch_id).map_err(unavailable)?
        };
        debug!("Loaded {} stored samples for batch {}", rows.len(), batch_id);
        Ok(rows.iter().map(to_reading).collect())
    }

    async fn preview_reading(&self) -> Result<RawSample> {
        let store = self.store.lock().await;
        let row = store.latest_telemetry().map_err(unavailable)?;
        row.as_ref().map(to_raw_sample).ok_or_else(|| Error::Api {
            status: 404,
            message: "no hydrometer readings received yet".to_string(),
        })
    }

    async fn update_abv(&self, batch_id: BatchId) -> Result<AbvResult> {
        let store = self.store.lock().await;
        let batch = store
            .get_batch(batch_id)
            .map_err(unavailable)?
            .ok_or_else(|| Error::Api {
                status: 404,
                message: format!("batch {batch_id} not found"),
            })?;
        let current = store
            .telemetry_for_batch(batch_id)
            .map_err(unavailable)?
            .last()
            .map(|row| row.gravity)
            .ok_or_else(|| Error::Api {
                status: 404,
                message: format!("no hydrometer readings for batch {batch_id}"),
            })?;

        let abv = derive_abv(batch_id, batch.original_gravity, current)?;
        Ok(AbvResult {
            current_abv: abv,
            original_gravity: batch.original_gravity.unwrap_or_default(),
            current_gravity: Some(current),
        })
    }

    fn name(&self) -> &str {
        "local"
    }
}

fn unavailable(err: tuba_store::Error) -> Error {
    Error::SourceUnavailable(format!("database: {err}"))
}

/// Convert a stored sample into a chart reading labelled by wall-clock time.
pub fn to_reading(row: &StoredTelemetry) -> Reading {
    Reading {
        time: row
            .received_at
            .format(format_description!("[hour]:[minute]:[second]"))
            .unwrap_or_else(|_| row.received_at.unix_timestamp().to_string()),
        brix: gravity_to_brix(row.gravity),
        gravity: row.gravity,
        temperature: row.temperature,
    }
}

/// Convert a stored sample into a preview sample.
pub fn to_raw_sample(row: &StoredTelemetry) -> RawSample {
    RawSample {
        angle: row.angle,
        gravity: row.gravity,
        brix: gravity_to_brix(row.gravity),
        temperature: row.temperature,
        battery: row.battery,
        timestamp: row.received_at,
    }
}
