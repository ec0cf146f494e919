//! Periodic telemetry polling for the active fermentation run.
//!
//! One [`TelemetryPoller`] drives at most one monitoring session at a time.
//! While a session is active a background task fetches readings from the
//! [`TelemetrySource`] on a fixed interval. The first fetch happens
//! immediately. Each outcome is applied to the in-memory series:
//!
//! - success replaces the series with the fetched `Live` readings;
//! - failure falls back according to [`FallbackPolicy`] and never reaches the
//!   caller.
//!
//! Every fetch is tagged with a [`FetchTicket`]. Stopping a session cancels
//! its timer task synchronously and bumps the generation counter, so an
//! outcome that arrives after `stop()` is discarded instead of leaking into
//! the next session.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tuba_core::mock::MockTelemetrySource;
//! use tuba_core::{PollerOptions, TelemetryPoller};
//! use tuba_types::BatchId;
//!
//! # #[tokio::main]
//! # async fn main() -> tuba_core::Result<()> {
//! let source = Arc::new(MockTelemetrySource::new());
//! let poller = TelemetryPoller::new(source, PollerOptions::default())?;
//!
//! poller.start(BatchId::new(8)?).await?;
//! tokio::time::sleep(Duration::from_millis(10)).await;
//! let session = poller.stop().await?;
//! assert_eq!(session.batch_id.to_string(), "008");
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::Stream;
use rand::Rng;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::macros::format_description;
use tokio::sync::{Mutex, broadcast};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tuba_types::{BatchId, Readiness, Reading, Session, SourcedReading};

use crate::abv::GRAVITY_RANGE;
use crate::classifier::ReadinessPolicy;
use crate::error::{Error, Result};
use crate::events::{Connectivity, EventReceiver, EventSender, PollerEvent, event_channel};
use crate::session::{Clock, DEFAULT_HISTORY_LIMIT, SessionTracker, SystemClock};
use crate::smoothing::{Window, smooth};
use crate::source::TelemetrySource;

/// What to do when a fetch fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Rotate the series: drop the oldest reading and append a perturbed copy
    /// of the latest one, tagged as simulated.
    #[default]
    Perturb,
    /// Abort the session if the source has not answered once since it
    /// started; later failures behave like [`FallbackPolicy::Perturb`].
    #[serde(rename = "stop")]
    StopWhenUnreachable,
}

/// Maximum random delta applied to each channel by the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerturbationBounds {
    pub brix: f64,
    pub gravity: f64,
    pub temperature: f64,
}

impl Default for PerturbationBounds {
    fn default() -> Self {
        Self {
            brix: 0.1,
            gravity: 0.0005,
            temperature: 0.1,
        }
    }
}

impl PerturbationBounds {
    /// No perturbation: simulated readings repeat the last value.
    pub const ZERO: Self = Self {
        brix: 0.0,
        gravity: 0.0,
        temperature: 0.0,
    };

    /// A copy of `reading` with each channel moved by at most its bound.
    ///
    /// Results are clamped to physically meaningful ranges.
    pub fn apply<R: Rng + ?Sized>(&self, reading: &Reading, rng: &mut R) -> Reading {
        Reading {
            time: reading.time.clone(),
            brix: (reading.brix + jitter(rng, self.brix)).clamp(0.0, 40.0),
            gravity: (reading.gravity + jitter(rng, self.gravity))
                .clamp(*GRAVITY_RANGE.start(), *GRAVITY_RANGE.end()),
            temperature: (reading.temperature + jitter(rng, self.temperature)).clamp(-10.0, 60.0),
        }
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("brix", self.brix),
            ("gravity", self.gravity),
            ("temperature", self.temperature),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::InvalidConfig(format!(
                    "perturbation bound for {name} must be a non-negative number, got {value}"
                )));
            }
        }
        Ok(())
    }
}

fn jitter<R: Rng + ?Sized>(rng: &mut R, bound: f64) -> f64 {
    if bound > 0.0 {
        rng.random_range(-bound..=bound)
    } else {
        0.0
    }
}

/// Options for the telemetry poller.
///
/// ```
/// use std::time::Duration;
/// use tuba_core::{FallbackPolicy, PollerOptions};
/// use tuba_core::smoothing::Window;
///
/// let options = PollerOptions::builder()
///     .poll_interval(Duration::from_secs(5))
///     .fallback(FallbackPolicy::StopWhenUnreachable)
///     .smoothing(Some(Window::new(5).unwrap()))
///     .build();
/// assert!(options.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct PollerOptions {
    /// Time between fetches. Default: 5 seconds.
    pub poll_interval: Duration,
    /// Behaviour on fetch failure.
    pub fallback: FallbackPolicy,
    /// Smoothing applied to the displayed series; `None` disables it.
    pub smoothing: Option<Window>,
    /// Bounds for simulated readings.
    pub perturbation: PerturbationBounds,
    /// Thresholds for the live readiness indicator.
    pub readiness: ReadinessPolicy,
    /// Completed sessions kept in memory.
    pub history_limit: usize,
    /// Capacity of the event channel.
    pub event_buffer: usize,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            fallback: FallbackPolicy::default(),
            smoothing: Some(Window::default()),
            perturbation: PerturbationBounds::default(),
            readiness: ReadinessPolicy::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            event_buffer: 100,
        }
    }
}

impl PollerOptions {
    /// Create a new builder for PollerOptions.
    pub fn builder() -> PollerOptionsBuilder {
        PollerOptionsBuilder::default()
    }

    /// Validate the options and return an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig("poll_interval must be > 0".to_string()));
        }
        if self.history_limit == 0 {
            return Err(Error::InvalidConfig("history_limit must be > 0".to_string()));
        }
        if self.event_buffer == 0 {
            return Err(Error::InvalidConfig("event_buffer must be > 0".to_string()));
        }
        self.perturbation.validate()?;
        self.readiness.validate()
    }
}

/// Builder for PollerOptions.
#[derive(Debug, Clone, Default)]
pub struct PollerOptionsBuilder {
    options: PollerOptions,
}

impl PollerOptionsBuilder {
    /// Set the polling interval.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.options.poll_interval = interval;
        self
    }

    /// Set the fallback policy.
    #[must_use]
    pub fn fallback(mut self, fallback: FallbackPolicy) -> Self {
        self.options.fallback = fallback;
        self
    }

    /// Set or disable smoothing.
    #[must_use]
    pub fn smoothing(mut self, window: Option<Window>) -> Self {
        self.options.smoothing = window;
        self
    }

    /// Set the perturbation bounds.
    #[must_use]
    pub fn perturbation(mut self, bounds: PerturbationBounds) -> Self {
        self.options.perturbation = bounds;
        self
    }

    /// Set the readiness policy.
    #[must_use]
    pub fn readiness(mut self, policy: ReadinessPolicy) -> Self {
        self.options.readiness = policy;
        self
    }

    /// Set the session history limit.
    #[must_use]
    pub fn history_limit(mut self, limit: usize) -> Self {
        self.options.history_limit = limit;
        self
    }

    /// Set the event channel capacity.
    #[must_use]
    pub fn event_buffer(mut self, size: usize) -> Self {
        self.options.event_buffer = size;
        self
    }

    /// Build the PollerOptions.
    #[must_use]
    pub fn build(self) -> PollerOptions {
        self.options
    }
}

/// Identifies the session a fetch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FetchTicket {
    pub generation: u64,
    pub batch_id: BatchId,
}

/// What [`TelemetryPoller::apply`] did with a fetch outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The outcome updated the active session.
    Applied,
    /// The ticket belonged to a stopped or superseded session.
    Discarded,
    /// The failure ended the session (stop-when-unreachable policy).
    Aborted,
}

/// Whether a session is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    #[default]
    Idle,
    Polling,
}

/// Point-in-time view of the poller for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    pub state: PollState,
    pub batch_id: Option<BatchId>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    pub elapsed_seconds: Option<u64>,
    pub connectivity: Connectivity,
    pub readings: Vec<SourcedReading>,
    pub smoothed: Vec<SourcedReading>,
    pub readiness: Readiness,
    pub last_abv: Option<f64>,
}

struct ActiveRun {
    batch_id: BatchId,
    generation: u64,
    cancel: CancellationToken,
    readings: Vec<SourcedReading>,
    connectivity: Connectivity,
    has_succeeded: bool,
}

struct PollerInner {
    tracker: SessionTracker,
    active: Option<ActiveRun>,
    generation: u64,
    consecutive_failures: u32,
    last_abv: HashMap<BatchId, f64>,
}

struct Shared {
    source: Arc<dyn TelemetrySource>,
    clock: Arc<dyn Clock>,
    options: PollerOptions,
    inner: Mutex<PollerInner>,
    events: EventSender,
}

/// Drives monitoring sessions against a telemetry source.
///
/// Cloning is cheap and every clone controls the same poller.
#[derive(Clone)]
pub struct TelemetryPoller {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TelemetryPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryPoller")
            .field("source", &self.shared.source.name())
            .field("options", &self.shared.options)
            .finish()
    }
}

impl TelemetryPoller {
    /// Create a poller reading wall-clock time.
    pub fn new(source: Arc<dyn TelemetrySource>, options: PollerOptions) -> Result<Self> {
        Self::with_clock(source, options, Arc::new(SystemClock))
    }

    /// Create a poller with a custom clock.
    pub fn with_clock(
        source: Arc<dyn TelemetrySource>,
        options: PollerOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        options.validate()?;
        let (events, _) = event_channel(options.event_buffer);
        let inner = PollerInner {
            tracker: SessionTracker::new(options.history_limit),
            active: None,
            generation: 0,
            consecutive_failures: 0,
            last_abv: HashMap::new(),
        };
        Ok(Self {
            shared: Arc::new(Shared {
                source,
                clock,
                options,
                inner: Mutex::new(inner),
                events,
            }),
        })
    }

    /// The options this poller was created with.
    pub fn options(&self) -> &PollerOptions {
        &self.shared.options
    }

    /// Start monitoring `batch_id`.
    ///
    /// Fetches immediately, then once per poll interval until
    /// [`stop`](Self::stop) is called.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyPolling`] if a session is already running.
    pub async fn start(&self, batch_id: BatchId) -> Result<FetchTicket> {
        let shared = &self.shared;
        let started_at = shared.clock.now();

        let (ticket, token) = {
            let mut inner = shared.inner.lock().await;
            if let Some(run) = &inner.active {
                return Err(Error::AlreadyPolling(run.batch_id));
            }
            inner.tracker.on_start(batch_id, started_at)?;
            inner.generation += 1;
            inner.consecutive_failures = 0;

            let ticket = FetchTicket {
                generation: inner.generation,
                batch_id,
            };
            let token = CancellationToken::new();
            inner.active = Some(ActiveRun {
                batch_id,
                generation: ticket.generation,
                cancel: token.clone(),
                readings: Vec::new(),
                connectivity: Connectivity::Unknown,
                has_succeeded: false,
            });
            (ticket, token)
        };

        info!(
            "Started monitoring batch {} via {} source (interval: {:?})",
            batch_id,
            shared.source.name(),
            shared.options.poll_interval
        );
        let _ = shared.events.send(PollerEvent::Started {
            batch_id,
            started_at,
        });

        tokio::spawn(poll_loop(Arc::clone(shared), ticket, token));
        Ok(ticket)
    }

    /// Stop the active session and return it.
    ///
    /// The timer task is cancelled before this returns; fetches still in
    /// flight are discarded when they complete.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotPolling`] when no session is running.
    pub async fn stop(&self) -> Result<Session> {
        let shared = &self.shared;
        let session = {
            let mut inner = shared.inner.lock().await;
            let run = inner.active.take().ok_or(Error::NotPolling)?;
            run.cancel.cancel();
            inner.generation += 1;
            inner.tracker.on_stop(shared.clock.now())?
        };

        info!(
            "Stopped monitoring batch {} after {}s",
            session.batch_id, session.duration_seconds
        );
        let _ = shared.events.send(PollerEvent::Stopped {
            session: session.clone(),
        });
        Ok(session)
    }

    /// Apply a fetch outcome to the session identified by `ticket`.
    ///
    /// The background task calls this for every fetch. Outcomes whose ticket
    /// does not match the active session are discarded.
    pub async fn apply(&self, ticket: FetchTicket, outcome: Result<Vec<Reading>>) -> ApplyOutcome {
        self.shared.apply(ticket, outcome).await
    }

    /// Ticket of the running session, if any.
    pub async fn current_ticket(&self) -> Option<FetchTicket> {
        let inner = self.shared.inner.lock().await;
        inner.active.as_ref().map(|run| FetchTicket {
            generation: run.generation,
            batch_id: run.batch_id,
        })
    }

    /// Whether a session is running.
    pub async fn is_polling(&self) -> bool {
        self.shared.inner.lock().await.active.is_some()
    }

    /// Record the latest derived ABV for a batch.
    ///
    /// The live readiness indicator uses it as the alcohol input.
    pub async fn set_alcohol(&self, batch_id: BatchId, abv: f64) {
        self.shared.inner.lock().await.last_abv.insert(batch_id, abv);
    }

    /// Drop the cached ABV for a batch.
    pub async fn forget_alcohol(&self, batch_id: BatchId) {
        self.shared.inner.lock().await.last_abv.remove(&batch_id);
    }

    /// Drop every cached ABV, e.g. after the batch records were reset.
    pub async fn clear_alcohol(&self) {
        self.shared.inner.lock().await.last_abv.clear();
    }

    /// Snapshot of the poller at the clock's current time.
    pub async fn snapshot(&self) -> MonitorSnapshot {
        self.snapshot_at(self.shared.clock.now()).await
    }

    /// Snapshot of the poller with elapsed time measured at `now`.
    pub async fn snapshot_at(&self, now: OffsetDateTime) -> MonitorSnapshot {
        let inner = self.shared.inner.lock().await;
        let Some(run) = &inner.active else {
            return MonitorSnapshot {
                state: PollState::Idle,
                batch_id: None,
                started_at: None,
                elapsed_seconds: None,
                connectivity: Connectivity::Unknown,
                readings: Vec::new(),
                smoothed: Vec::new(),
                readiness: Readiness::NotReady,
                last_abv: None,
            };
        };

        let last_abv = inner.last_abv.get(&run.batch_id).copied();
        let smoothed = self.shared.smoothed(&run.readings);
        MonitorSnapshot {
            state: PollState::Polling,
            batch_id: Some(run.batch_id),
            started_at: inner.tracker.active().map(|(_, at)| at),
            elapsed_seconds: inner.tracker.elapsed(now),
            connectivity: run.connectivity,
            readings: run.readings.clone(),
            readiness: self.shared.readiness(&smoothed, last_abv),
            smoothed,
            last_abv,
        }
    }

    /// Completed sessions, newest first.
    pub async fn history(&self) -> Vec<Session> {
        self.shared.inner.lock().await.tracker.history()
    }

    /// Seed the in-memory history with persisted sessions.
    pub async fn restore_history(&self, sessions: Vec<Session>) {
        self.shared.inner.lock().await.tracker.restore(sessions);
    }

    /// Subscribe to poller events.
    pub fn subscribe(&self) -> EventReceiver {
        self.shared.events.subscribe()
    }

    /// Poller events as a stream; lagged receivers skip missed events.
    pub fn event_stream(&self) -> impl Stream<Item = PollerEvent> + Send + 'static {
        let rx = self.shared.events.subscribe();
        futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Poller event stream lagged, skipped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }
}

impl Shared {
    async fn apply(&self, ticket: FetchTicket, outcome: Result<Vec<Reading>>) -> ApplyOutcome {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let Some(run) = inner.active.as_mut() else {
            debug!("Discarding fetch for batch {}: no active session", ticket.batch_id);
            return ApplyOutcome::Discarded;
        };
        if run.generation != ticket.generation || run.batch_id != ticket.batch_id {
            debug!(
                "Discarding stale fetch for batch {} (generation {} != {})",
                ticket.batch_id, ticket.generation, run.generation
            );
            return ApplyOutcome::Discarded;
        }
        let last_abv = inner.last_abv.get(&run.batch_id).copied();

        let event = match outcome {
            Ok(readings) => {
                if inner.consecutive_failures > 0 {
                    info!(
                        "Telemetry for batch {} recovered after {} failed fetch(es)",
                        run.batch_id, inner.consecutive_failures
                    );
                }
                inner.consecutive_failures = 0;
                run.readings = readings.into_iter().map(SourcedReading::Live).collect();
                run.connectivity = Connectivity::Online;
                run.has_succeeded = true;
                self.readings_event(run, last_abv)
            }
            Err(e) => {
                inner.consecutive_failures += 1;
                log_failure(run.batch_id, &e, inner.consecutive_failures);

                if self.options.fallback == FallbackPolicy::StopWhenUnreachable
                    && !run.has_succeeded
                {
                    let batch_id = run.batch_id;
                    run.cancel.cancel();
                    inner.active = None;
                    inner.tracker.discard();
                    inner.generation += 1;
                    warn!("Aborted monitoring of batch {}: telemetry source unreachable", batch_id);
                    let _ = self.events.send(PollerEvent::Aborted {
                        batch_id,
                        reason: e.to_string(),
                    });
                    return ApplyOutcome::Aborted;
                }

                match run.readings.last() {
                    None => {
                        run.connectivity = Connectivity::Offline;
                        PollerEvent::Offline {
                            batch_id: run.batch_id,
                            reason: e.to_string(),
                        }
                    }
                    Some(last) => {
                        let simulated = self.simulate(last.reading());
                        run.readings.remove(0);
                        run.readings.push(SourcedReading::Simulated(simulated));
                        run.connectivity = Connectivity::Degraded;
                        self.readings_event(run, last_abv)
                    }
                }
            }
        };

        let _ = self.events.send(event);
        ApplyOutcome::Applied
    }

    fn simulate(&self, last: &Reading) -> Reading {
        let mut rng = rand::rng();
        let mut next = self.options.perturbation.apply(last, &mut rng);
        if let Ok(label) = self
            .clock
            .now()
            .format(format_description!("[hour]:[minute]:[second]"))
        {
            next.time = label;
        }
        next
    }

    fn smoothed(&self, readings: &[SourcedReading]) -> Vec<SourcedReading> {
        match self.options.smoothing {
            Some(window) => smooth(readings, window),
            None => readings.to_vec(),
        }
    }

    fn readiness(&self, series: &[SourcedReading], abv: Option<f64>) -> Readiness {
        let latest = series.last().map(SourcedReading::reading);
        self.options.readiness.classify_optional(
            latest.map(|r| r.brix),
            abv,
            latest.map(|r| r.temperature),
        )
    }

    fn readings_event(&self, run: &ActiveRun, abv: Option<f64>) -> PollerEvent {
        let smoothed = self.smoothed(&run.readings);
        PollerEvent::Readings {
            batch_id: run.batch_id,
            connectivity: run.connectivity,
            readings: run.readings.clone(),
            readiness: self.readiness(&smoothed, abv),
            smoothed,
        }
    }
}

fn log_failure(batch_id: BatchId, err: &Error, consecutive_failures: u32) {
    if consecutive_failures <= 3 {
        warn!(
            "Failed to fetch telemetry for batch {}: {} (attempt {})",
            batch_id, err, consecutive_failures
        );
    } else if consecutive_failures == 4 {
        error!(
            "Failed to fetch telemetry for batch {} after {} attempts, will continue trying silently",
            batch_id, consecutive_failures
        );
    }
}

async fn poll_loop(shared: Arc<Shared>, ticket: FetchTicket, token: CancellationToken) {
    let mut ticker = interval(shared.options.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let outcome = tokio::select! {
            _ = token.cancelled() => break,
            outcome = shared.source.fetch_readings(ticket.batch_id) => outcome,
        };

        match shared.apply(ticket, outcome).await {
            ApplyOutcome::Applied => {}
            ApplyOutcome::Discarded | ApplyOutcome::Aborted => break,
        }
    }
    debug!("Poll loop for batch {} exited", ticket.batch_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ManualClock, MockTelemetrySource};
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2025-05-20 10:00:00 UTC);

    fn batch(n: u32) -> BatchId {
        BatchId::new(n).unwrap()
    }

    fn reading(brix: f64, temperature: f64) -> Reading {
        Reading {
            time: "10:00".to_string(),
            brix,
            gravity: 1.05,
            temperature,
        }
    }

    fn poller_with(
        source: Arc<MockTelemetrySource>,
        options: PollerOptions,
    ) -> (TelemetryPoller, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let poller = TelemetryPoller::with_clock(source, options, clock.clone()).unwrap();
        (poller, clock)
    }

    fn quiet_options() -> PollerOptions {
        PollerOptions::builder()
            .poll_interval(Duration::from_secs(5))
            .smoothing(None)
            .perturbation(PerturbationBounds::ZERO)
            .build()
    }

    #[test]
    fn test_options_validation() {
        assert!(PollerOptions::default().validate().is_ok());
        let zero = PollerOptions::builder().poll_interval(Duration::ZERO).build();
        assert!(zero.validate().is_err());
        let no_history = PollerOptions::builder().history_limit(0).build();
        assert!(no_history.validate().is_err());
        let negative = PollerOptions::builder()
            .perturbation(PerturbationBounds {
                brix: -1.0,
                ..Default::default()
            })
            .build();
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_perturbation_stays_within_bounds() {
        let bounds = PerturbationBounds::default();
        let base = reading(16.0, 30.0);
        let mut rng = rand::rng();
        for _ in 0..200 {
            let next = bounds.apply(&base, &mut rng);
            assert!((next.brix - base.brix).abs() <= bounds.brix + 1e-12);
            assert!((next.gravity - base.gravity).abs() <= bounds.gravity + 1e-12);
            assert!((next.temperature - base.temperature).abs() <= bounds.temperature + 1e-12);
        }
    }

    #[test]
    fn test_perturbation_clamps() {
        let r = Reading {
            time: String::new(),
            brix: 0.0,
            gravity: 1.2,
            temperature: 30.0,
        };
        let bounds = PerturbationBounds {
            brix: 5.0,
            gravity: 0.5,
            temperature: 0.0,
        };
        let mut rng = rand::rng();
        for _ in 0..50 {
            let next = bounds.apply(&r, &mut rng);
            assert!(next.brix >= 0.0);
            assert!(next.gravity <= 1.2);
        }
    }

    #[test]
    fn test_fallback_policy_serde_names() {
        assert_eq!(
            serde_json::from_str::<FallbackPolicy>("\"stop\"").unwrap(),
            FallbackPolicy::StopWhenUnreachable
        );
        assert_eq!(
            serde_json::to_string(&FallbackPolicy::Perturb).unwrap(),
            "\"perturb\""
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_fetches_immediately() {
        let source = Arc::new(MockTelemetrySource::new());
        source
            .set_readings(batch(8), MockTelemetrySource::sample_series(4))
            .await;
        let (poller, _) = poller_with(source.clone(), quiet_options());

        poller.start(batch(8)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(source.fetch_count(), 1);
        let snap = poller.snapshot().await;
        assert_eq!(snap.state, PollState::Polling);
        assert_eq!(snap.connectivity, Connectivity::Online);
        assert_eq!(snap.readings.len(), 4);
        assert!(snap.readings.iter().all(|r| !r.is_simulated()));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(source.fetch_count(), 3);
        poller.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_polling_is_rejected() {
        let source = Arc::new(MockTelemetrySource::new());
        let (poller, _) = poller_with(source, quiet_options());

        poller.start(batch(1)).await.unwrap();
        let err = poller.start(batch(2)).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyPolling(id) if id == batch(1)));
        poller.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_without_session() {
        let source = Arc::new(MockTelemetrySource::new());
        let (poller, _) = poller_with(source, quiet_options());
        assert!(matches!(poller.stop().await, Err(Error::NotPolling)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_records_session_duration() {
        let source = Arc::new(MockTelemetrySource::new());
        let (poller, clock) = poller_with(source, quiet_options());

        poller.start(batch(8)).await.unwrap();
        clock.advance(Duration::from_secs(65));
        assert_eq!(poller.snapshot().await.elapsed_seconds, Some(65));

        let session = poller.stop().await.unwrap();
        assert_eq!(session.duration_seconds, 65);
        assert_eq!(poller.history().await, vec![session]);

        let snap = poller.snapshot().await;
        assert_eq!(snap.state, PollState::Idle);
        assert!(snap.readings.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_rotates_series_with_simulated_reading() {
        let source = Arc::new(MockTelemetrySource::new());
        let series = MockTelemetrySource::sample_series(5);
        source.set_readings(batch(3), series.clone()).await;
        let (poller, _) = poller_with(source.clone(), quiet_options());

        poller.start(batch(3)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        source.set_should_fail(true, None).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let snap = poller.snapshot().await;
        assert_eq!(snap.connectivity, Connectivity::Degraded);
        assert_eq!(snap.readings.len(), 5);
        assert_eq!(snap.readings[0].reading(), &series[1]);
        let last = snap.readings.last().unwrap();
        assert!(last.is_simulated());
        assert_eq!(last.reading().brix, series[4].brix);

        // Recovery replaces the series with live data again
        source.set_should_fail(false, None).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        let snap = poller.snapshot().await;
        assert_eq!(snap.connectivity, Connectivity::Online);
        assert!(snap.readings.iter().all(|r| !r.is_simulated()));

        poller.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_without_series_goes_offline() {
        let source = Arc::new(MockTelemetrySource::new());
        source.set_should_fail(true, Some("bridge down")).await;
        let (poller, _) = poller_with(source, quiet_options());
        let mut events = poller.subscribe();

        poller.start(batch(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let snap = poller.snapshot().await;
        assert_eq!(snap.state, PollState::Polling);
        assert_eq!(snap.connectivity, Connectivity::Offline);
        assert!(snap.readings.is_empty());

        assert!(matches!(events.recv().await.unwrap(), PollerEvent::Started { .. }));
        assert!(matches!(events.recv().await.unwrap(), PollerEvent::Offline { .. }));
        poller.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_when_unreachable_aborts_without_session() {
        let source = Arc::new(MockTelemetrySource::new());
        source.set_should_fail(true, None).await;
        let options = PollerOptions::builder()
            .fallback(FallbackPolicy::StopWhenUnreachable)
            .smoothing(None)
            .build();
        let (poller, _) = poller_with(source.clone(), options);
        let mut events = poller.subscribe();

        poller.start(batch(4)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(!poller.is_polling().await);
        assert!(poller.history().await.is_empty());
        assert_eq!(source.fetch_count(), 1);
        assert!(matches!(events.recv().await.unwrap(), PollerEvent::Started { .. }));
        assert!(matches!(events.recv().await.unwrap(), PollerEvent::Aborted { .. }));

        // A fresh session can start afterwards
        assert!(poller.start(batch(4)).await.is_ok());
        poller.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_when_unreachable_degrades_after_first_success() {
        let source = Arc::new(MockTelemetrySource::new());
        source
            .set_readings(batch(4), MockTelemetrySource::sample_series(3))
            .await;
        let options = PollerOptions::builder()
            .fallback(FallbackPolicy::StopWhenUnreachable)
            .perturbation(PerturbationBounds::ZERO)
            .build();
        let (poller, _) = poller_with(source.clone(), options);

        poller.start(batch(4)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        source.set_should_fail(true, None).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let snap = poller.snapshot().await;
        assert_eq!(snap.state, PollState::Polling);
        assert_eq!(snap.connectivity, Connectivity::Degraded);
        poller.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_ticket_is_discarded() {
        let source = Arc::new(MockTelemetrySource::new());
        let (poller, _) = poller_with(source, quiet_options());

        let first = poller.start(batch(1)).await.unwrap();
        poller.stop().await.unwrap();
        let second = poller.start(batch(1)).await.unwrap();
        assert_ne!(first, second);

        let outcome = poller.apply(first, Ok(vec![reading(20.0, 30.0)])).await;
        assert_eq!(outcome, ApplyOutcome::Discarded);
        assert!(poller.snapshot().await.readings.is_empty());

        let outcome = poller.apply(second, Ok(vec![reading(20.0, 30.0)])).await;
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(poller.snapshot().await.readings.len(), 1);
        poller.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_fetch_after_stop_is_ignored() {
        let source = Arc::new(MockTelemetrySource::new());
        source
            .set_readings(batch(6), MockTelemetrySource::sample_series(3))
            .await;
        source.set_latency(Duration::from_secs(3));
        let (poller, _) = poller_with(source.clone(), quiet_options());
        let mut events = poller.subscribe();

        poller.start(batch(6)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.fetch_count(), 1);

        poller.stop().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(source.fetch_count(), 1);
        assert!(poller.snapshot().await.readings.is_empty());
        assert!(matches!(events.recv().await.unwrap(), PollerEvent::Started { .. }));
        assert!(matches!(events.recv().await.unwrap(), PollerEvent::Stopped { .. }));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_uses_latest_reading_and_abv() {
        let source = Arc::new(MockTelemetrySource::new());
        source
            .set_readings(batch(8), vec![reading(10.0, 20.0), reading(16.0, 30.0)])
            .await;
        let (poller, _) = poller_with(source, quiet_options());

        poller.start(batch(8)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(poller.snapshot().await.readiness, Readiness::NotReady);

        poller.set_alcohol(batch(8), 25.0).await;
        let snap = poller.snapshot().await;
        assert_eq!(snap.last_abv, Some(25.0));
        assert_eq!(snap.readiness, Readiness::Ready);
        poller.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_forgotten_abv_no_longer_counts() {
        let source = Arc::new(MockTelemetrySource::new());
        source
            .set_readings(batch(1), vec![reading(16.0, 30.0)])
            .await;
        let (poller, _) = poller_with(source, quiet_options());

        poller.set_alcohol(batch(1), 25.0).await;
        poller.set_alcohol(batch(2), 22.0).await;
        poller.forget_alcohol(batch(1)).await;

        poller.start(batch(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        let snap = poller.snapshot().await;
        assert_eq!(snap.last_abv, None);
        assert_eq!(snap.readiness, Readiness::NotReady);
        poller.stop().await.unwrap();

        poller.clear_alcohol().await;
        poller.start(batch(2)).await.unwrap();
        assert_eq!(poller.snapshot().await.last_abv, None);
        poller.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_smoothed_series_is_reported() {
        let source = Arc::new(MockTelemetrySource::new());
        source
            .set_readings(
                batch(2),
                vec![reading(10.0, 30.0), reading(20.0, 30.0), reading(30.0, 30.0)],
            )
            .await;
        let options = PollerOptions::builder()
            .smoothing(Some(Window::new(3).unwrap()))
            .build();
        let (poller, _) = poller_with(source, options);

        poller.start(batch(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        let snap = poller.snapshot().await;
        let smoothed: Vec<_> = snap.smoothed.iter().map(|r| r.reading().brix).collect();
        assert_eq!(smoothed, vec![15.0, 20.0, 25.0]);
        assert_eq!(snap.readings[0].reading().brix, 10.0);
        poller.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_stream_yields_events() {
        use futures::StreamExt;

        let source = Arc::new(MockTelemetrySource::new());
        let (poller, _) = poller_with(source, quiet_options());
        let stream = poller.event_stream();
        tokio::pin!(stream);

        poller.start(batch(1)).await.unwrap();
        let first = stream.next().await.unwrap();
        assert!(matches!(first, PollerEvent::Started { .. }));
        poller.stop().await.unwrap();
    }
}
