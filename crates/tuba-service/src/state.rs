//! Application state shared across handlers.
//!
//! # Live events
//!
//! The poller owns a broadcast channel of [`PollerEvent`](tuba_core::PollerEvent)s
//! sized by `server.broadcast_buffer`. WebSocket clients that fall behind
//! skip the events they missed; senders never block.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::info;

use tuba_core::{AbvDeriver, Error, HttpTelemetrySource, TelemetryPoller, TelemetrySource};
use tuba_store::Store;

use crate::config::{Config, SourceKind};
use crate::source::LocalTelemetrySource;

/// Shared application state.
pub struct AppState {
    /// The data store, shared with the local telemetry source.
    pub store: Arc<Mutex<Store>>,
    /// Configuration (RwLock for runtime updates).
    pub config: RwLock<Config>,
    /// Source of live readings and remote ABV refreshes.
    pub source: Arc<dyn TelemetrySource>,
    /// Monitoring session driver.
    pub poller: TelemetryPoller,
    /// Per-batch ABV refresh limiter.
    pub abv: Mutex<AbvDeriver>,
}

impl AppState {
    /// Create application state with the telemetry source named in `config`.
    pub fn new(store: Store, config: Config) -> tuba_core::Result<Arc<Self>> {
        let store = Arc::new(Mutex::new(store));
        let source: Arc<dyn TelemetrySource> = match config.telemetry.source {
            SourceKind::Local => Arc::new(LocalTelemetrySource::new(Arc::clone(&store))),
            SourceKind::Http => {
                let url = config.telemetry.base_url.as_deref().ok_or_else(|| {
                    Error::InvalidConfig("telemetry.base_url is required for http".to_string())
                })?;
                Arc::new(HttpTelemetrySource::with_timeout(
                    url,
                    Duration::from_secs(config.telemetry.request_timeout),
                )?)
            }
        };
        Self::assemble(store, config, source)
    }

    /// Create application state with an explicit telemetry source.
    pub fn with_source(
        store: Store,
        config: Config,
        source: Arc<dyn TelemetrySource>,
    ) -> tuba_core::Result<Arc<Self>> {
        Self::assemble(Arc::new(Mutex::new(store)), config, source)
    }

    fn assemble(
        store: Arc<Mutex<Store>>,
        config: Config,
        source: Arc<dyn TelemetrySource>,
    ) -> tuba_core::Result<Arc<Self>> {
        let poller = TelemetryPoller::new(Arc::clone(&source), config.poller_options())?;
        let abv = AbvDeriver::new(Duration::from_secs(config.abv.min_refresh_interval));
        info!("Using {} telemetry source", source.name());
        Ok(Arc::new(Self {
            store,
            config: RwLock::new(config),
            source,
            poller,
            abv: Mutex::new(abv),
        }))
    }

    /// Seed the poller's session history from the database.
    ///
    /// Returns the number of sessions loaded.
    pub async fn load_history(&self) -> tuba_store::Result<usize> {
        let limit = self.config.read().await.sessions.history_limit;
        let sessions = {
            let store = self.store.lock().await;
            store.recent_sessions(u32::try_from(limit).unwrap_or(u32::MAX))?
        };
        let count = sessions.len();
        self.poller.restore_history(sessions).await;
        Ok(count)
    }
}
