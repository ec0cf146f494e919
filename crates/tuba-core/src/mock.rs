//! Mock telemetry source and clock for testing.
//!
//! [`MockTelemetrySource`] implements [`TelemetrySource`] without any
//! network access, and [`ManualClock`] lets tests move time forward by hand.
//!
//! # Features
//!
//! - **Failure injection**: fail every request, or only the next `n`
//! - **Latency simulation**: delay responses to exercise in-flight cancellation
//! - **Per-batch data**: separate reading series for each batch

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use time::macros::datetime;
use tokio::sync::RwLock;

use tuba_types::{AbvResult, BatchId, RawSample, Reading};

use crate::error::{Error, Result};
use crate::session::Clock;
use crate::source::TelemetrySource;

/// An in-memory telemetry source for tests.
///
/// # Example
///
/// ```
/// use tuba_core::mock::MockTelemetrySource;
/// use tuba_core::TelemetrySource;
/// use tuba_types::BatchId;
///
/// #[tokio::main]
/// async fn main() {
///     let source = MockTelemetrySource::new();
///     let batch = BatchId::new(8).unwrap();
///     source.set_readings(batch, MockTelemetrySource::sample_series(3)).await;
///
///     assert_eq!(source.fetch_readings(batch).await.unwrap().len(), 3);
///
///     source.set_should_fail(true, Some("bridge down")).await;
///     assert!(source.fetch_readings(batch).await.is_err());
/// }
/// ```
pub struct MockTelemetrySource {
    readings: RwLock<HashMap<BatchId, Vec<Reading>>>,
    preview: RwLock<Option<RawSample>>,
    abv: RwLock<HashMap<BatchId, AbvResult>>,
    should_fail: AtomicBool,
    fail_message: RwLock<String>,
    /// Number of upcoming requests that fail before succeeding again.
    remaining_failures: AtomicU32,
    /// Simulated response latency in milliseconds (0 = no delay).
    latency_ms: AtomicU64,
    fetch_count: AtomicU32,
}

impl std::fmt::Debug for MockTelemetrySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTelemetrySource")
            .field("should_fail", &self.should_fail.load(Ordering::Relaxed))
            .field("fetch_count", &self.fetch_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for MockTelemetrySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTelemetrySource {
    /// Create an empty source: no readings, a default preview sample.
    pub fn new() -> Self {
        Self {
            readings: RwLock::new(HashMap::new()),
            preview: RwLock::new(Some(Self::default_preview())),
            abv: RwLock::new(HashMap::new()),
            should_fail: AtomicBool::new(false),
            fail_message: RwLock::new("Mock failure".to_string()),
            remaining_failures: AtomicU32::new(0),
            latency_ms: AtomicU64::new(0),
            fetch_count: AtomicU32::new(0),
        }
    }

    fn default_preview() -> RawSample {
        RawSample {
            angle: 52.3,
            gravity: 1.064,
            brix: 15.7,
            temperature: 30.2,
            battery: 3.9,
            timestamp: datetime!(2025-05-20 08:00 UTC),
        }
    }

    /// A plausible series of `len` readings with slowly falling sugar.
    pub fn sample_series(len: usize) -> Vec<Reading> {
        (0..len)
            .map(|i| {
                let step = i as f64;
                Reading {
                    time: format!("{:02}:00", i % 24),
                    brix: 16.0 - step * 0.1,
                    gravity: 1.065 - step * 0.0005,
                    temperature: 30.0 + (step * 0.1) % 1.0,
                }
            })
            .collect()
    }

    /// Replace the series returned for a batch.
    pub async fn set_readings(&self, batch_id: BatchId, readings: Vec<Reading>) {
        self.readings.write().await.insert(batch_id, readings);
    }

    /// Set or clear the preview sample.
    pub async fn set_preview(&self, sample: Option<RawSample>) {
        *self.preview.write().await = sample;
    }

    /// Set the ABV returned for a batch.
    pub async fn set_abv(&self, batch_id: BatchId, result: AbvResult) {
        self.abv.write().await.insert(batch_id, result);
    }

    /// Make every request fail (or succeed again).
    pub async fn set_should_fail(&self, fail: bool, message: Option<&str>) {
        self.should_fail.store(fail, Ordering::Relaxed);
        if let Some(msg) = message {
            *self.fail_message.write().await = msg.to_string();
        }
    }

    /// Fail the next `count` requests, then recover.
    pub fn set_transient_failures(&self, count: u32) {
        self.remaining_failures.store(count, Ordering::Relaxed);
    }

    /// Delay every response by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::Relaxed);
    }

    /// Number of `fetch_readings` calls made, including failed ones.
    pub fn fetch_count(&self) -> u32 {
        self.fetch_count.load(Ordering::Relaxed)
    }

    async fn check_should_fail(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.remaining_failures.load(Ordering::Relaxed) > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(Error::SourceUnavailable(self.fail_message.read().await.clone()));
        }

        if self.should_fail.load(Ordering::Relaxed) {
            Err(Error::SourceUnavailable(self.fail_message.read().await.clone()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TelemetrySource for MockTelemetrySource {
    async fn fetch_readings(&self, batch_id: BatchId) -> Result<Vec<Reading>> {
        self.fetch_count.fetch_add(1, Ordering::Relaxed);
        self.check_should_fail().await?;
        Ok(self
            .readings
            .read()
            .await
            .get(&batch_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn preview_reading(&self) -> Result<RawSample> {
        self.check_should_fail().await?;
        self.preview.read().await.clone().ok_or(Error::Api {
            status: 404,
            message: "no reading available".to_string(),
        })
    }

    async fn update_abv(&self, batch_id: BatchId) -> Result<AbvResult> {
        self.check_should_fail().await?;
        self.abv
            .read()
            .await
            .get(&batch_id)
            .copied()
            .ok_or(Error::Api {
                status: 400,
                message: format!("no original gravity recorded for batch {batch_id}"),
            })
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = now.saturating_add(time::Duration::try_from(by).unwrap_or(time::Duration::MAX));
    }

    /// Jump to an absolute instant (may move backwards).
    pub fn set(&self, at: OffsetDateTime) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
