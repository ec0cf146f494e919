//! Hydrometer ingestion and the telemetry-source endpoints.
//!
//! An iSpindel posts its samples to `/ispindel`. The remaining routes serve
//! those samples in the shape `HttpTelemetrySource` consumes, so one
//! tuba-service can act as the telemetry bridge of another.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};

use tuba_core::TelemetrySource;
use tuba_store::RawTelemetry;
use tuba_types::{AbvResult, BatchId, RawSample, Reading};

use crate::api::{AppError, refresh_with};
use crate::source::LocalTelemetrySource;
use crate::state::AppState;

/// Create the ingestion router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ispindel", post(ingest_sample))
        .route("/readings/{batch_id}", get(readings))
        .route("/preview_reading", get(preview_reading))
        .route("/update_abv/{batch_id}", post(update_abv))
}

/// Sample posted by the hydrometer.
///
/// Extra fields sent by the device firmware (name, interval, RSSI) are
/// ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct IspindelPayload {
    /// Batch the hydrometer is floating in; devices that do not send one
    /// report into the first batch.
    #[serde(default = "first_batch")]
    pub batch_id: BatchId,
    pub angle: f64,
    pub temperature: f64,
    pub battery: f64,
    pub gravity: f64,
}

fn first_batch() -> BatchId {
    BatchId::FIRST
}

/// Acknowledgement for an ingested sample.
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub status: &'static str,
}

async fn ingest_sample(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<IspindelPayload>,
) -> Result<Json<IngestResponse>, AppError> {
    let values = [
        ("angle", payload.angle),
        ("temperature", payload.temperature),
        ("battery", payload.battery),
        ("gravity", payload.gravity),
    ];
    if let Some((field, value)) = values.iter().find(|(_, v)| !v.is_finite()) {
        return Err(AppError::BadRequest(format!(
            "{field} must be a finite number, got {value}"
        )));
    }

    let row = state.store.lock().await.insert_telemetry(
        payload.batch_id,
        &RawTelemetry {
            angle: payload.angle,
            gravity: payload.gravity,
            temperature: payload.temperature,
            battery: payload.battery,
            received_at: Some(OffsetDateTime::now_utc()),
        },
    )?;
    debug!(
        "Stored sample {} for batch {} (SG {:.4})",
        row, payload.batch_id, payload.gravity
    );
    Ok(Json(IngestResponse { status: "saved" }))
}

fn local_source(state: &AppState) -> LocalTelemetrySource {
    LocalTelemetrySource::new(Arc::clone(&state.store))
}

fn parse_batch_id(raw: &str) -> Result<BatchId, AppError> {
    raw.parse()
        .map_err(|e: tuba_types::ParseError| AppError::BadRequest(e.to_string()))
}

async fn readings(
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<String>,
) -> Result<Json<Vec<Reading>>, AppError> {
    let batch_id = parse_batch_id(&batch_id)?;
    Ok(Json(local_source(&state).fetch_readings(batch_id).await?))
}

async fn preview_reading(State(state): State<Arc<AppState>>) -> Result<Json<RawSample>, AppError> {
    Ok(Json(local_source(&state).preview_reading().await?))
}

/// Derive ABV from the stored samples and persist it.
///
/// Shares the per-batch rate limit with `POST /api/batches/{id}/abv`.
async fn update_abv(
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<String>,
) -> Result<Json<AbvResult>, AppError> {
    let batch_id = parse_batch_id(&batch_id)?;
    let source = local_source(&state);
    let result = refresh_with(&state, batch_id, source.update_abv(batch_id)).await?;
    info!("Served ABV update for batch {}", batch_id);
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use time::macros::date;
    use tower::ServiceExt;

    use tuba_core::MockTelemetrySource;
    use tuba_store::{NewBatch, Store};

    use crate::config::Config;

    fn create_test_state() -> Arc<AppState> {
        AppState::with_source(
            Store::open_in_memory().unwrap(),
            Config::default(),
            Arc::new(MockTelemetrySource::new()),
        )
        .unwrap()
    }

    async fn send(
        state: &Arc<AppState>,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router()
            .with_state(Arc::clone(state))
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_ingest_defaults_to_first_batch() {
        let state = create_test_state();
        let (status, json) = send(
            &state,
            "POST",
            "/ispindel",
            Some(serde_json::json!({
                "name": "iSpindel001",
                "angle": 52.1,
                "temperature": 30.4,
                "battery": 4.02,
                "gravity": 1.062,
                "RSSI": -71
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "saved");

        let rows = state
            .store
            .lock()
            .await
            .telemetry_for_batch(BatchId::FIRST)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].gravity, 1.062);
    }

    #[tokio::test]
    async fn test_ingest_rejects_incomplete_payload() {
        let state = create_test_state();
        let (status, _) = send(
            &state,
            "POST",
            "/ispindel",
            Some(serde_json::json!({"angle": 50.0, "temperature": 30.0, "battery": 4.0})),
        )
        .await;
        assert!(status.is_client_error());
        assert!(state.store.lock().await.latest_telemetry().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_readings_and_preview() {
        let state = create_test_state();

        let (status, _) = send(&state, "GET", "/preview_reading", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        for (batch, gravity) in [("002", 1.060), ("002", 1.055), ("003", 1.070)] {
            let (status, _) = send(
                &state,
                "POST",
                "/ispindel",
                Some(serde_json::json!({
                    "batch_id": batch,
                    "angle": 50.0,
                    "temperature": 30.0,
                    "battery": 4.0,
                    "gravity": gravity
                })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, json) = send(&state, "GET", "/readings/002", None).await;
        assert_eq!(status, StatusCode::OK);
        let readings: Vec<Reading> = serde_json::from_value(json).unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[1].gravity, 1.055);

        let (_, json) = send(&state, "GET", "/readings/009", None).await;
        assert_eq!(json, serde_json::json!([]));

        let (status, json) = send(&state, "GET", "/preview_reading", None).await;
        assert_eq!(status, StatusCode::OK);
        let preview: RawSample = serde_json::from_value(json).unwrap();
        assert_eq!(preview.gravity, 1.070);
    }

    #[tokio::test]
    async fn test_update_abv_persists_alcohol() {
        let state = create_test_state();
        state
            .store
            .lock()
            .await
            .create_batch(&NewBatch {
                start_date: date!(2025 - 05 - 20),
                end_date: date!(2025 - 05 - 23),
                brix: Some(16.0),
                alcohol: None,
                temperature: Some(30.0),
                produced_liters: None,
                original_gravity: Some(1.060),
            })
            .unwrap();
        send(
            &state,
            "POST",
            "/ispindel",
            Some(serde_json::json!({
                "angle": 40.0, "temperature": 30.0, "battery": 4.0, "gravity": 1.020
            })),
        )
        .await;

        let (status, json) = send(&state, "POST", "/update_abv/001", None).await;
        assert_eq!(status, StatusCode::OK);
        let result: AbvResult = serde_json::from_value(json).unwrap();
        assert!((result.current_abv - 5.25).abs() < 1e-9);

        let batch = state
            .store
            .lock()
            .await
            .get_batch(BatchId::FIRST)
            .unwrap()
            .unwrap();
        assert!((batch.alcohol.unwrap() - 5.25).abs() < 1e-9);

        let (status, json) = send(&state, "POST", "/update_abv/001", None).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json["retryable"], true);
    }
}
