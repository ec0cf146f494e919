//! REST API endpoints for the tuba-service.
//!
//! # Concurrency and Lock Acquisition
//!
//! - **`state.store`** (Mutex): held briefly for database operations, never
//!   across a call to the telemetry source.
//! - **`state.config`** (RwLock): read at the top of a handler and released
//!   before the store is locked.
//! - **`state.abv`** (Mutex): held only to claim or release a batch's refresh
//!   slot, never across the refresh itself.
//!
//! When several are needed they are taken in the order `config`, `abv`,
//! `store`.
//!
//! ## Error Handling
//!
//! All endpoints return structured JSON errors via [`AppError`]:
//! `{ "error": "..." }`, plus `"retryable": true` for 429 and 503 responses.
//! Persistence failures surface as 503 so a client can resubmit the same form.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use tracing::{debug, error, info, warn};

use tuba_core::{
    AbvError, BucketUnit, MergedPoint, MonitorSnapshot, ReadinessPolicy, ReadinessSummary,
    TelemetrySource, aggregate, merge_series,
};
use tuba_store::{MeasurementUpdate, NewBatch, ProductionQuery, SeriesKind, StoredDraft};
use tuba_types::{AbvResult, Batch, BatchId, ChartPoint, Readiness, Session};

use crate::config::{AbvMode, MAX_DURATION_DAYS, MIN_DURATION_DAYS};
use crate::source::LocalTelemetrySource;
use crate::state::AppState;

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

/// Create the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/health", get(health))
        // Batch records
        .route(
            "/api/batches",
            get(list_batches).post(create_batch).delete(clear_batches),
        )
        .route("/api/batches/summary", get(batch_summary))
        .route("/api/batches/confirm", post(confirm_batch))
        .route("/api/batches/{id}", get(get_batch))
        .route("/api/batches/{id}/measurements", put(update_measurements))
        .route("/api/batches/{id}/abv", post(refresh_abv))
        // Charts
        .route("/api/charts", get(merged_chart))
        .route("/api/charts/{series}", get(chart))
        // Monitoring
        .route("/api/monitoring", get(monitoring_status))
        .route("/api/monitoring/stop", post(stop_monitoring))
        .route("/api/monitoring/{id}/start", post(start_monitoring))
        .route("/api/sessions", get(list_sessions))
        // Drafts
        .route("/api/drafts", get(list_drafts))
        .route(
            "/api/drafts/{key}",
            get(get_draft).put(put_draft).delete(delete_draft),
        )
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Health check endpoint.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: OffsetDateTime::now_utc(),
    })
}

// ==========================================================================
// Batch Endpoints
// ==========================================================================

/// A batch together with its computed readiness.
#[derive(Debug, Serialize)]
pub struct BatchResponse {
    #[serde(flatten)]
    pub batch: Batch,
    pub status: Readiness,
}

impl BatchResponse {
    fn new(batch: Batch, policy: &ReadinessPolicy) -> Self {
        let status = policy.classify_batch(&batch);
        Self { batch, status }
    }
}

fn parse_batch_id(raw: &str) -> Result<BatchId, AppError> {
    raw.parse()
        .map_err(|e: tuba_types::ParseError| AppError::BadRequest(e.to_string()))
}

/// List all batches with their status.
async fn list_batches(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<BatchResponse>>, AppError> {
    let policy = state.config.read().await.readiness;
    let batches = state.store.lock().await.list_batches()?;
    Ok(Json(
        batches
            .into_iter()
            .map(|b| BatchResponse::new(b, &policy))
            .collect(),
    ))
}

/// Get one batch.
async fn get_batch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BatchResponse>, AppError> {
    let id = parse_batch_id(&id)?;
    let policy = state.config.read().await.readiness;
    let batch = state
        .store
        .lock()
        .await
        .get_batch(id)?
        .ok_or_else(|| AppError::NotFound(format!("Batch not found: {}", id)))?;
    Ok(Json(BatchResponse::new(batch, &policy)))
}

/// Dashboard counts of ready and not-ready batches.
async fn batch_summary(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReadinessSummary>, AppError> {
    let policy = state.config.read().await.readiness;
    let batches = state.store.lock().await.list_batches()?;
    Ok(Json(policy.summarize(&batches)))
}

/// Request body for creating a batch.
#[derive(Debug, Deserialize)]
pub struct CreateBatchRequest {
    #[serde(with = "iso_date")]
    pub start_date: Date,
    /// Defaults to the start date plus the configured duration.
    #[serde(default, with = "iso_date::option")]
    pub end_date: Option<Date>,
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

fn check_duration(start: Date, end: Date) -> Result<(), AppError> {
    let days = (end - start).whole_days();
    if !(i64::from(MIN_DURATION_DAYS)..=i64::from(MAX_DURATION_DAYS)).contains(&days) {
        return Err(AppError::BadRequest(format!(
            "end date must be {} to {} days after the start date, got {} days",
            MIN_DURATION_DAYS, MAX_DURATION_DAYS, days
        )));
    }
    Ok(())
}

/// Create a batch with the next sequential id.
async fn create_batch(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateBatchRequest>,
) -> Result<(StatusCode, Json<BatchResponse>), AppError> {
    let (policy, duration) = {
        let config = state.config.read().await;
        (config.readiness, config.batches.estimated_duration_days)
    };

    let end_date = match request.end_date {
        Some(end) => {
            check_duration(request.start_date, end)?;
            end
        }
        None => Batch::estimated_end(request.start_date, duration),
    };

    let batch = state.store.lock().await.create_batch(&NewBatch {
        start_date: request.start_date,
        end_date,
        brix: request.brix,
        alcohol: request.alcohol,
        temperature: request.temperature,
        produced_liters: request.produced_liters,
        original_gravity: request.original_gravity,
    })?;

    Ok((StatusCode::CREATED, Json(BatchResponse::new(batch, &policy))))
}

/// Request body for confirming a batch from the hydrometer.
#[derive(Debug, Deserialize)]
pub struct ConfirmBatchRequest {
    /// Liters entered by the operator.
    pub produced_liters: f64,
    /// Defaults to today (UTC).
    #[serde(default, with = "iso_date::option")]
    pub start_date: Option<Date>,
}

/// Start a batch from the latest hydrometer sample.
///
/// The sample's gravity becomes the batch's original gravity.
async fn confirm_batch(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ConfirmBatchRequest>,
) -> Result<(StatusCode, Json<BatchResponse>), AppError> {
    if !request.produced_liters.is_finite() || request.produced_liters < 0.0 {
        return Err(AppError::BadRequest(format!(
            "produced_liters must be a non-negative number, got {}",
            request.produced_liters
        )));
    }

    let (policy, duration) = {
        let config = state.config.read().await;
        (config.readiness, config.batches.estimated_duration_days)
    };

    let preview = state.source.preview_reading().await?;
    let start_date = request
        .start_date
        .unwrap_or_else(|| OffsetDateTime::now_utc().date());

    let batch = state.store.lock().await.create_batch(&NewBatch {
        start_date,
        end_date: Batch::estimated_end(start_date, duration),
        brix: Some(preview.brix),
        alcohol: None,
        temperature: Some(preview.temperature),
        produced_liters: Some(request.produced_liters),
        original_gravity: Some(preview.gravity),
    })?;

    info!(
        "Confirmed batch {} at OG {:.4} with {} L",
        batch.id, preview.gravity, request.produced_liters
    );
    Ok((StatusCode::CREATED, Json(BatchResponse::new(batch, &policy))))
}

/// Replace some of a batch's measurements.
async fn update_measurements(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<MeasurementUpdate>,
) -> Result<Json<BatchResponse>, AppError> {
    let id = parse_batch_id(&id)?;
    if update.is_empty() {
        return Err(AppError::BadRequest(
            "no measurements in update".to_string(),
        ));
    }

    let policy = state.config.read().await.readiness;
    let batch = state.store.lock().await.update_measurements(id, &update)?;

    if let Some(alcohol) = update.alcohol {
        state.poller.set_alcohol(id, alcohol).await;
    }
    Ok(Json(BatchResponse::new(batch, &policy)))
}

/// Response for the reset endpoint.
#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub removed: usize,
}

/// Delete every batch and production total.
async fn clear_batches(State(state): State<Arc<AppState>>) -> Result<Json<ClearResponse>, AppError> {
    let removed = state.store.lock().await.clear_batches()?;
    state.abv.lock().await.reset();
    state.poller.clear_alcohol().await;
    warn!("Batch records reset ({} removed)", removed);
    Ok(Json(ClearResponse { removed }))
}

/// Refresh a batch's ABV and store it as the batch's alcohol.
///
/// Local mode derives from the stored samples; remote mode asks the
/// telemetry source. Either way a batch may only be refreshed once per
/// `abv.min_refresh_interval`.
async fn refresh_abv(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<AbvResult>, AppError> {
    let id = parse_batch_id(&id)?;
    let mode = state.config.read().await.abv.mode;

    let result = refresh_with(&state, id, async {
        match mode {
            AbvMode::Local => {
                LocalTelemetrySource::new(Arc::clone(&state.store))
                    .update_abv(id)
                    .await
            }
            AbvMode::Remote => state.source.update_abv(id).await,
        }
    })
    .await?;
    Ok(Json(result))
}

/// Run `refresh` holding the batch's refresh slot, then record the result.
///
/// The limiter lock is only taken to claim and release the slot, so a slow
/// source does not hold up refreshes of other batches.
pub(crate) async fn refresh_with<F>(
    state: &AppState,
    id: BatchId,
    refresh: F,
) -> Result<AbvResult, AppError>
where
    F: Future<Output = tuba_core::Result<AbvResult>>,
{
    let reservation = state.abv.lock().await.reserve(id, OffsetDateTime::now_utc())?;
    match refresh.await {
        Ok(result) => {
            record_abv(state, id, &result).await?;
            Ok(result)
        }
        Err(e) => {
            state.abv.lock().await.release(reservation);
            Err(e.into())
        }
    }
}

/// Persist a derived ABV as the batch's alcohol and feed the live indicator.
async fn record_abv(
    state: &AppState,
    id: BatchId,
    result: &AbvResult,
) -> Result<(), AppError> {
    let update = MeasurementUpdate {
        alcohol: Some(result.current_abv),
        ..Default::default()
    };
    match state.store.lock().await.update_measurements(id, &update) {
        Ok(_) => {}
        Err(tuba_store::Error::BatchNotFound(_)) => {
            debug!("ABV for unknown batch {} not persisted", id);
        }
        Err(e) => return Err(e.into()),
    }
    state.poller.set_alcohol(id, result.current_abv).await;
    info!("Batch {} ABV is now {:.2}%", id, result.current_abv);
    Ok(())
}

// ==========================================================================
// Chart Endpoints
// ==========================================================================

/// Query parameters for chart endpoints.
///
/// Day labels carry no year, so every chart covers a single calendar year:
/// `year` when given, otherwise the latest year with production.
#[derive(Debug, Deserialize, Default)]
pub struct ChartQuery {
    #[serde(default)]
    pub unit: BucketUnit,
    pub year: Option<i32>,
}

/// One aggregated production series.
#[derive(Debug, Serialize)]
pub struct ChartResponse {
    pub series: SeriesKind,
    pub unit: BucketUnit,
    /// Year shown; `None` when nothing has been produced yet.
    pub year: Option<i32>,
    pub points: Vec<ChartPoint>,
}

/// Liters and sales merged by label.
#[derive(Debug, Serialize)]
pub struct MergedChartResponse {
    pub unit: BucketUnit,
    pub year: Option<i32>,
    pub points: Vec<MergedPoint>,
}

fn chart_year(store: &tuba_store::Store, params: &ChartQuery) -> Result<Option<i32>, AppError> {
    match params.year {
        Some(year) => Ok(Some(year)),
        None => Ok(store.latest_production_year()?),
    }
}

fn load_series(
    store: &tuba_store::Store,
    kind: SeriesKind,
    unit: BucketUnit,
    year: Option<i32>,
) -> Result<Vec<ChartPoint>, AppError> {
    let mut query = ProductionQuery::new(kind);
    if let Some(year) = year {
        query = query.year(year);
    }
    let points = store.production_series(&query)?;
    Ok(aggregate(&points, unit))
}

/// Aggregated production series (`liters` or `sales`).
async fn chart(
    State(state): State<Arc<AppState>>,
    Path(series): Path<String>,
    Query(params): Query<ChartQuery>,
) -> Result<Json<ChartResponse>, AppError> {
    let kind: SeriesKind = series
        .parse()
        .map_err(|e: tuba_store::Error| AppError::BadRequest(e.to_string()))?;
    let (year, points) = {
        let store = state.store.lock().await;
        let year = chart_year(&store, &params)?;
        (year, load_series(&store, kind, params.unit, year)?)
    };
    Ok(Json(ChartResponse {
        series: kind,
        unit: params.unit,
        year,
        points,
    }))
}

/// Liters (primary) and sales (secondary) merged into one chart.
async fn merged_chart(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ChartQuery>,
) -> Result<Json<MergedChartResponse>, AppError> {
    let (year, liters, sales) = {
        let store = state.store.lock().await;
        let year = chart_year(&store, &params)?;
        (
            year,
            load_series(&store, SeriesKind::Liters, params.unit, year)?,
            load_series(&store, SeriesKind::Sales, params.unit, year)?,
        )
    };
    Ok(Json(MergedChartResponse {
        unit: params.unit,
        year,
        points: merge_series(&liters, &sales),
    }))
}

// ==========================================================================
// Monitoring Endpoints
// ==========================================================================

/// Start monitoring a batch.
async fn start_monitoring(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<MonitorSnapshot>, AppError> {
    let id = parse_batch_id(&id)?;
    let batch = state
        .store
        .lock()
        .await
        .get_batch(id)?
        .ok_or_else(|| AppError::NotFound(format!("Batch not found: {}", id)))?;

    // The stored record is the source of truth for a fresh session.
    match batch.alcohol {
        Some(alcohol) => state.poller.set_alcohol(id, alcohol).await,
        None => state.poller.forget_alcohol(id).await,
    }
    state.poller.start(id).await?;
    Ok(Json(state.poller.snapshot().await))
}

/// Stop monitoring and record the session.
///
/// The session is returned even if it could not be persisted.
async fn stop_monitoring(State(state): State<Arc<AppState>>) -> Result<Json<Session>, AppError> {
    let session = state.poller.stop().await?;
    if let Err(e) = state.store.lock().await.insert_session(&session) {
        error!("Failed to persist session {}: {}", session.id, e);
    }
    Ok(Json(session))
}

/// Current monitoring state.
async fn monitoring_status(State(state): State<Arc<AppState>>) -> Json<MonitorSnapshot> {
    Json(state.poller.snapshot().await)
}

/// Query parameters for the session list.
#[derive(Debug, Deserialize, Default)]
pub struct SessionsQuery {
    pub limit: Option<u32>,
}

/// Recent completed sessions, newest first.
async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SessionsQuery>,
) -> Result<Json<Vec<Session>>, AppError> {
    let limit = match params.limit {
        Some(limit) => limit,
        None => {
            let default = state.config.read().await.sessions.history_limit;
            u32::try_from(default).unwrap_or(u32::MAX)
        }
    };
    let sessions = state.store.lock().await.recent_sessions(limit)?;
    Ok(Json(sessions))
}

// ==========================================================================
// Draft Endpoints
// ==========================================================================

async fn list_drafts(State(state): State<Arc<AppState>>) -> Result<Json<Vec<String>>, AppError> {
    Ok(Json(state.store.lock().await.list_drafts()?))
}

async fn get_draft(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<StoredDraft>, AppError> {
    let draft = state
        .store
        .lock()
        .await
        .get_draft(&key)?
        .ok_or_else(|| AppError::NotFound(format!("Draft not found: {}", key)))?;
    Ok(Json(draft))
}

async fn put_draft(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(value): Json<serde_json::Value>,
) -> Result<Json<StoredDraft>, AppError> {
    Ok(Json(state.store.lock().await.put_draft(&key, &value)?))
}

async fn delete_draft(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<StatusCode, AppError> {
    if state.store.lock().await.delete_draft(&key)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("Draft not found: {}", key)))
    }
}

// ==========================================================================
// Errors
// ==========================================================================

/// Application error type.
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    RateLimited {
        message: String,
        retry_after: Duration,
    },
    /// The telemetry source could not be reached.
    Unavailable(String),
    /// The telemetry source answered with something unusable.
    BadGateway(String),
    Store(tuba_store::Error),
    Internal(String),
}

impl From<tuba_store::Error> for AppError {
    fn from(e: tuba_store::Error) -> Self {
        match e {
            tuba_store::Error::BatchNotFound(_) => AppError::NotFound(e.to_string()),
            tuba_store::Error::InvalidValue(msg) => AppError::BadRequest(msg),
            other => AppError::Store(other),
        }
    }
}

impl From<AbvError> for AppError {
    fn from(e: AbvError) -> Self {
        match e {
            AbvError::MissingBaseline(_) => AppError::Conflict(e.to_string()),
            AbvError::InvalidGravity(_) => AppError::BadRequest(e.to_string()),
            AbvError::RateLimited { retry_after, .. } => AppError::RateLimited {
                message: e.to_string(),
                retry_after,
            },
        }
    }
}

impl From<tuba_core::Error> for AppError {
    fn from(e: tuba_core::Error) -> Self {
        use tuba_core::Error;

        match e {
            Error::AlreadyPolling(_) | Error::NotPolling | Error::Session(_) => {
                AppError::Conflict(e.to_string())
            }
            Error::Abv(abv) => abv.into(),
            Error::SourceUnavailable(_) | Error::Timeout { .. } => {
                AppError::Unavailable(e.to_string())
            }
            Error::Api { status: 404, message } => AppError::NotFound(message),
            Error::Api { status, message } if (400..500).contains(&status) => {
                AppError::BadRequest(message)
            }
            Error::Api { .. } | Error::InvalidData(_) => AppError::BadGateway(e.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut retry_after = None;
        let (status, message, retryable) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, false),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, false),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg, false),
            AppError::RateLimited {
                message,
                retry_after: wait,
            } => {
                retry_after = Some(wait);
                (StatusCode::TOO_MANY_REQUESTS, message, true)
            }
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg, true),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg, false),
            AppError::Store(e) => {
                warn!("Database error: {}", e);
                (StatusCode::SERVICE_UNAVAILABLE, e.to_string(), true)
            }
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, false),
        };

        let mut body = serde_json::json!({
            "error": message,
        });
        if retryable {
            body["retryable"] = serde_json::Value::Bool(true);
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(wait) = retry_after {
            let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
