//! Monitoring core for tuba fermentation batches.
//!
//! This crate holds the algorithmic part of the monitor: everything that
//! classifies, aggregates, smooths or times data. Storage and the HTTP
//! surface live in `tuba-store` and `tuba-service`.
//!
//! # Features
//!
//! - **Readiness classification**: threshold policy over brix, alcohol and temperature
//! - **Chart aggregation**: day/month buckets and label-keyed merging of series
//! - **Smoothing**: centred moving average over multi-channel readings
//! - **Live polling**: cancellable periodic fetches with an explicit fallback policy
//! - **Session tracking**: start/stop bookkeeping with a bounded history
//! - **ABV derivation**: on-demand, rate-limited, with a hard missing-baseline error
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tuba_core::mock::MockTelemetrySource;
//! use tuba_core::{PollerOptions, TelemetryPoller};
//! use tuba_types::{BatchId, Readiness};
//!
//! #[tokio::main]
//! async fn main() -> tuba_core::Result<()> {
//!     let batch = BatchId::new(8)?;
//!     let source = Arc::new(MockTelemetrySource::new());
//!     source.set_readings(batch, MockTelemetrySource::sample_series(6)).await;
//!
//!     let poller = TelemetryPoller::new(source, PollerOptions::default())?;
//!     poller.start(batch).await?;
//!     tokio::time::sleep(Duration::from_millis(50)).await;
//!
//!     let snapshot = poller.snapshot().await;
//!     println!("{} readings, {:?}", snapshot.readings.len(), snapshot.connectivity);
//!     assert_eq!(snapshot.readiness, Readiness::NotReady); // no ABV yet
//!
//!     let session = poller.stop().await?;
//!     println!("monitored batch {} for {}s", session.batch_id, session.duration_seconds);
//!     Ok(())
//! }
//! ```

pub mod abv;
pub mod aggregate;
pub mod classifier;
#[cfg(feature = "http-source")]
pub mod client;
pub mod error;
pub mod events;
pub mod mock;
pub mod poller;
pub mod session;
pub mod smoothing;
pub mod source;

// Core exports
pub use error::{AbvError, Error, Result, SessionError};
pub use source::TelemetrySource;

pub use abv::{AbvDeriver, Reservation, derive_abv, gravity_to_brix};
pub use aggregate::{BucketUnit, MergedPoint, aggregate, merge_series};
pub use classifier::{ReadinessPolicy, ReadinessSummary, classify};
#[cfg(feature = "http-source")]
pub use client::HttpTelemetrySource;
pub use events::{Connectivity, EventReceiver, EventSender, PollerEvent};
pub use mock::{ManualClock, MockTelemetrySource};
pub use poller::{
    ApplyOutcome, FallbackPolicy, FetchTicket, MonitorSnapshot, PerturbationBounds, PollState,
    PollerOptions, PollerOptionsBuilder, TelemetryPoller,
};
pub use session::{Clock, SessionTracker, SystemClock};
pub use smoothing::{Channels, Window, smooth};

// Re-export from tuba-types
pub use tuba_types::{
    AbvResult, Batch, BatchId, ChartPoint, RawSample, Readiness, Reading, Session, SourcedReading,
};
