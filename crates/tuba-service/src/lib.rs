//! HTTP service for the tuba fermentation monitor.
//!
//! This crate provides a service that:
//! - Keeps batch records, production totals and form drafts in SQLite
//! - Exposes a REST API for the dashboard, charts and monitoring sessions
//! - Ingests iSpindel hydrometer samples
//! - Streams live monitoring events over a WebSocket
//!
//! # REST API Endpoints
//!
//! - `GET /api/health` - Service health check
//! - `GET|POST|DELETE /api/batches` - List, create or reset batch records
//! - `GET /api/batches/summary` - Ready / not-ready counts
//! - `POST /api/batches/confirm` - Start a batch from the latest hydrometer sample
//! - `GET /api/batches/{id}` - One batch with its readiness
//! - `PUT /api/batches/{id}/measurements` - Partial measurement update
//! - `POST /api/batches/{id}/abv` - Refresh a batch's ABV
//! - `GET /api/charts/{series}` - Liters or sales, bucketed by `unit`
//! - `GET /api/charts` - Liters and sales merged by label
//! - `POST /api/monitoring/{id}/start`, `POST /api/monitoring/stop`, `GET /api/monitoring`
//! - `GET /api/sessions` - Completed monitoring sessions
//! - `GET|PUT|DELETE /api/drafts/{key}` - Autosaved form drafts
//! - `WS /api/ws` - Live poller events
//!
//! # Telemetry Endpoints
//!
//! - `POST /ispindel` - Hydrometer sample
//! - `GET /readings/{batch_id}`, `GET /preview_reading`, `POST /update_abv/{batch_id}`
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/tuba/server.toml`:
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8080"
//!
//! [storage]
//! path = "~/.local/share/tuba/data.db"
//!
//! [telemetry]
//! source = "http"
//! base_url = "http://raspberrypi.local:5000"
//! poll_interval = 5
//! fallback = "perturb"
//! smoothing_window = 3
//!
//! [readiness]
//! brix_min = 15.0
//! alcohol_min = 20.0
//! temperature_min = 28.0
//! temperature_max = 35.0
//! ```

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod api;
pub mod config;
pub mod ingest;
pub mod source;
pub mod state;
pub mod ws;

pub use api::AppError;
pub use config::{
    AbvConfig, AbvMode, BatchesConfig, Config, ConfigError, ServerConfig, SessionsConfig,
    SourceKind, StorageConfig, TelemetryConfig, ValidationError,
};
pub use source::LocalTelemetrySource;
pub use state::AppState;

/// Build the full application: REST API, ingestion routes and WebSocket.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(api::router())
        .merge(ingest::router())
        .merge(ws::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
