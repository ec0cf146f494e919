//! Hydrometer-to-dashboard flow through the full router.
//!
//! Samples are posted to `/ispindel`, a batch is confirmed from the latest
//! one, and the local telemetry source feeds a monitoring session. Tokio time
//! is paused so poll ticks fire instantly:
//! `cargo test --package tuba-service --test ingest_flow`

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use tuba_service::{AppState, Config, app};
use tuba_store::Store;
use tuba_types::BatchId;

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

async fn post_sample(app: &Router, gravity: f64) {
    let (status, json) = send(
        app,
        "POST",
        "/ispindel",
        Some(json!({
            "name": "iSpindel001",
            "angle": 45.0,
            "temperature": 30.5,
            "battery": 4.1,
            "gravity": gravity
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "saved");
}

#[tokio::test(start_paused = true)]
async fn test_hydrometer_feeds_monitoring_session() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("data.db");

    let mut config = Config::default();
    config.storage.path = db_path.clone();
    config.telemetry.poll_interval = 5;

    let state = AppState::new(Store::open(&db_path).unwrap(), config).unwrap();
    assert_eq!(state.source.name(), "local");
    let app = app(Arc::clone(&state));

    for gravity in [1.060, 1.050, 1.040] {
        post_sample(&app, gravity).await;
    }

    // Confirm the batch from the latest sample.
    let (status, batch) = send(
        &app,
        "POST",
        "/api/batches/confirm",
        Some(json!({"produced_liters": 40.0, "start_date": "2025-05-20"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(batch["id"], "001");
    assert_eq!(batch["original_gravity"], 1.040);
    assert_eq!(batch["end_date"], "2025-05-23");

    let (_, chart) = send(&app, "GET", "/api/charts/liters", None).await;
    assert_eq!(chart["points"], json!([{"label": "May-20", "value": 40.0}]));

    // Monitoring picks up the stored samples on the first fetch.
    let (status, snapshot) = send(&app, "POST", "/api/monitoring/001/start", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["state"], "polling");

    tokio::time::sleep(Duration::from_millis(10)).await;
    let (_, snapshot) = send(&app, "GET", "/api/monitoring", None).await;
    assert_eq!(snapshot["connectivity"], "online");
    let readings = snapshot["readings"].as_array().unwrap();
    assert_eq!(readings.len(), 3);
    assert!(readings.iter().all(|r| r["source"] == "live"));

    // A new sample shows up on the next tick.
    post_sample(&app, 1.030).await;
    tokio::time::sleep(Duration::from_secs(6)).await;
    let (_, snapshot) = send(&app, "GET", "/api/monitoring", None).await;
    assert_eq!(snapshot["readings"].as_array().unwrap().len(), 4);

    let (status, abv) = send(&app, "POST", "/api/batches/001/abv", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!((abv["current_abv"].as_f64().unwrap() - 1.3125).abs() < 1e-9);

    let (_, snapshot) = send(&app, "GET", "/api/monitoring", None).await;
    assert!((snapshot["last_abv"].as_f64().unwrap() - 1.3125).abs() < 1e-9);

    let (status, session) = send(&app, "POST", "/api/monitoring/stop", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["batch_id"], "001");

    // Everything survives a reopen of the database file.
    drop(app);
    drop(state);
    let store = Store::open(&db_path).unwrap();
    let sessions = store.recent_sessions(10).unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].batch_id, BatchId::FIRST);

    let batch = store.get_batch(BatchId::FIRST).unwrap().unwrap();
    assert!((batch.alcohol.unwrap() - 1.3125).abs() < 1e-9);
    assert_eq!(store.telemetry_for_batch(BatchId::FIRST).unwrap().len(), 4);
}

#[tokio::test]
async fn test_history_is_restored_on_startup() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("data.db");

    {
        let state = AppState::new(Store::open(&db_path).unwrap(), Config::default()).unwrap();
        let app = app(Arc::clone(&state));
        send(&app, "POST", "/api/batches", Some(json!({"start_date": "2025-05-20"}))).await;
        send(&app, "POST", "/api/monitoring/001/start", None).await;
        let (status, _) = send(&app, "POST", "/api/monitoring/stop", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    let state = AppState::new(Store::open(&db_path).unwrap(), Config::default()).unwrap();
    assert_eq!(state.load_history().await.unwrap(), 1);
    assert_eq!(state.poller.history().await[0].batch_id, BatchId::FIRST);
}
