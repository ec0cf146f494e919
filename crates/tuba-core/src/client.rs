//! HTTP client for a remote telemetry backend.
//!
//! Talks to the iSpindel bridge endpoints:
//!
//! | Method | Path | Response |
//! |--------|------|----------|
//! | GET | `/readings/{batch_id}` | `[{time, brix, gravity, temperature}]` |
//! | GET | `/preview_reading` | `{angle, gravity, brix, temperature, battery, timestamp}` |
//! | POST | `/update_abv/{batch_id}` | `{current_abv, original_gravity}` or `{error}` |
//!
//! # Example
//!
//! ```no_run
//! use tuba_core::client::HttpTelemetrySource;
//! use tuba_core::TelemetrySource;
//! use tuba_types::BatchId;
//!
//! # async fn example() -> tuba_core::Result<()> {
//! let source = HttpTelemetrySource::new("http://localhost:5000")?;
//! let readings = source.fetch_readings(BatchId::new(8)?).await?;
//! println!("{} readings", readings.len());
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::debug;

use tuba_types::{AbvResult, BatchId, RawSample, Reading};

use crate::error::{Error, Result};
use crate::source::TelemetrySource;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Telemetry source backed by a remote HTTP service.
#[derive(Debug, Clone)]
pub struct HttpTelemetrySource {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpTelemetrySource {
    /// Create a client with the default request timeout.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Root URL of the backend (e.g., "http://localhost:5000")
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a client with a custom request timeout.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("failed to build HTTP client: {e}")))?;
        Self::with_client(base_url, client, timeout)
    }

    /// Create a source with a custom reqwest Client.
    pub fn with_client(base_url: &str, client: Client, timeout: Duration) -> Result<Self> {
        let base_url = normalize_base_url(base_url)?;
        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = request.send().await.map_err(|e| self.transport_error(operation, e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
                .unwrap_or_else(|| status.to_string());
            return Err(Error::Api {
                status: status.as_u16(),
                message,
            });
        }

        response.json::<T>().await.map_err(|e| {
            if e.is_timeout() {
                self.transport_error(operation, e)
            } else {
                Error::InvalidData(format!("{operation}: {e}"))
            }
        })
    }

    fn transport_error(&self, operation: &str, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout {
                operation: operation.to_string(),
                duration: self.timeout,
            }
        } else {
            Error::SourceUnavailable(format!("{} at {}: {e}", operation, self.base_url))
        }
    }
}

#[async_trait]
impl TelemetrySource for HttpTelemetrySource {
    async fn fetch_readings(&self, batch_id: BatchId) -> Result<Vec<Reading>> {
        let url = format!("{}/readings/{}", self.base_url, batch_id);
        debug!("GET {}", url);
        self.send("fetch_readings", self.client.get(&url)).await
    }

    async fn preview_reading(&self) -> Result<RawSample> {
        let url = format!("{}/preview_reading", self.base_url);
        debug!("GET {}", url);
        self.send("preview_reading", self.client.get(&url)).await
    }

    async fn update_abv(&self, batch_id: BatchId) -> Result<AbvResult> {
        let url = format!("{}/update_abv/{}", self.base_url, batch_id);
        debug!("POST {}", url);
        self.send("update_abv", self.client.post(&url)).await
    }

    fn name(&self) -> &str {
        "http"
    }
}

fn normalize_base_url(base_url: &str) -> Result<String> {
    let base_url = base_url.trim().trim_end_matches('/');
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(Error::InvalidConfig(format!(
            "telemetry URL must start with http:// or https://, got: {base_url}"
        )));
    }
    Ok(base_url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let source = HttpTelemetrySource::new("http://localhost:5000").unwrap();
        assert_eq!(source.base_url(), "http://localhost:5000");
        assert_eq!(source.name(), "http");
    }

    #[test]
    fn test_client_normalizes_url() {
        let source = HttpTelemetrySource::new(" https://bridge.local/ ").unwrap();
        assert_eq!(source.base_url(), "https://bridge.local");
    }

    #[test]
    fn test_client_invalid_url() {
        let result = HttpTelemetrySource::new("localhost:5000");
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_source_unavailable() {
        // Port 9 (discard) on localhost is closed in test environments.
        let source =
            HttpTelemetrySource::with_timeout("http://127.0.0.1:9", Duration::from_secs(2))
                .unwrap();
        let err = source
            .fetch_readings(BatchId::new(1).unwrap())
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::SourceUnavailable(_) | Error::Timeout { .. }),
            "unexpected error: {err}"
        );
    }
}
