//! Poller event system.
//!
//! The poller broadcasts an event for every state change so the service can
//! forward them to WebSocket clients without polling the snapshot.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;

use tuba_types::{BatchId, Readiness, Session, SourcedReading};

/// Reachability of the telemetry source as seen by the active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    /// No fetch has completed yet.
    #[default]
    Unknown,
    /// The last fetch succeeded.
    Online,
    /// The last fetch failed; the series holds simulated fallback values.
    Degraded,
    /// The source is unreachable and there is nothing to show.
    Offline,
}

/// Events emitted by the telemetry poller.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum PollerEvent {
    /// A monitoring session started.
    Started {
        batch_id: BatchId,
        #[serde(with = "time::serde::rfc3339")]
        started_at: OffsetDateTime,
    },
    /// The reading series changed.
    Readings {
        batch_id: BatchId,
        connectivity: Connectivity,
        readings: Vec<SourcedReading>,
        smoothed: Vec<SourcedReading>,
        readiness: Readiness,
    },
    /// A fetch failed and there was no series to fall back on.
    Offline { batch_id: BatchId, reason: String },
    /// The session ended before any telemetry arrived.
    Aborted { batch_id: BatchId, reason: String },
    /// A session was stopped by the operator.
    Stopped { session: Session },
}

impl PollerEvent {
    /// Batch the event refers to.
    pub fn batch_id(&self) -> BatchId {
        match self {
            PollerEvent::Started { batch_id, .. }
            | PollerEvent::Readings { batch_id, .. }
            | PollerEvent::Offline { batch_id, .. }
            | PollerEvent::Aborted { batch_id, .. } => *batch_id,
            PollerEvent::Stopped { session } => session.batch_id,
        }
    }
}

/// Sender for poller events.
pub type EventSender = broadcast::Sender<PollerEvent>;

/// Receiver for poller events.
pub type EventReceiver = broadcast::Receiver<PollerEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    broadcast::channel(capacity.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_event_serialization_is_tagged() {
        let batch_id = BatchId::new(8).unwrap();
        let event = PollerEvent::Started {
            batch_id,
            started_at: datetime!(2025-05-20 10:00 UTC),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "started");
        assert_eq!(json["batch_id"], "008");
        assert_eq!(json["started_at"], "2025-05-20T10:00:00Z");
        assert_eq!(event.batch_id(), batch_id);

        let offline = PollerEvent::Offline {
            batch_id,
            reason: "unreachable".to_string(),
        };
        let json = serde_json::to_value(&offline).unwrap();
        assert_eq!(json["type"], "offline");
    }

    #[test]
    fn test_connectivity_serialization() {
        assert_eq!(
            serde_json::to_string(&Connectivity::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(Connectivity::default(), Connectivity::Unknown);
    }

    #[tokio::test]
    async fn test_event_channel() {
        let (tx, mut rx) = event_channel(0);
        let event = PollerEvent::Aborted {
            batch_id: BatchId::new(1).unwrap(),
            reason: "no source".to_string(),
        };
        tx.send(event.clone()).unwrap();
        assert_eq!(rx.recv().await.unwrap(), event);
    }
}
