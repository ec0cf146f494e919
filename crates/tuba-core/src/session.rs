//! Monitoring session bookkeeping.
//!
//! The tracker records when polling of a batch starts and stops, turns each
//! start/stop pair into a completed [`Session`], and keeps a bounded history
//! of the most recent sessions.

use std::collections::VecDeque;

use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

use tuba_types::{BatchId, Session};

use crate::error::SessionError;

/// Source of the current time.
///
/// The poller reads time through this trait so tests can drive elapsed-time
/// behaviour with [`ManualClock`](crate::mock::ManualClock).
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> OffsetDateTime;
}

/// Wall-clock time in UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Default number of completed sessions retained.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ActiveSession {
    batch_id: BatchId,
    started_at: OffsetDateTime,
}

/// Tracks the active session and recent completed ones.
#[derive(Debug, Clone)]
pub struct SessionTracker {
    active: Option<ActiveSession>,
    history: VecDeque<Session>,
    capacity: usize,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl SessionTracker {
    /// Create a tracker retaining at most `capacity` completed sessions.
    ///
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            active: None,
            history: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record the start of a session.
    pub fn on_start(&mut self, batch_id: BatchId, at: OffsetDateTime) -> Result<(), SessionError> {
        if let Some(active) = self.active {
            return Err(SessionError::AlreadyActive(active.batch_id));
        }
        self.active = Some(ActiveSession {
            batch_id,
            started_at: at,
        });
        Ok(())
    }

    /// Close the active session and add it to the history.
    ///
    /// An end time before the start is clamped to the start.
    pub fn on_stop(&mut self, at: OffsetDateTime) -> Result<Session, SessionError> {
        let active = self.active.take().ok_or(SessionError::NotActive)?;

        let end_time = if at < active.started_at {
            warn!(
                "Session for batch {} stopped before it started ({} < {}); clamping",
                active.batch_id, at, active.started_at
            );
            active.started_at
        } else {
            at
        };

        let session = Session {
            id: Uuid::new_v4(),
            batch_id: active.batch_id,
            start_time: active.started_at,
            end_time,
            duration_seconds: whole_seconds(active.started_at, end_time),
        };

        self.push(session.clone());
        Ok(session)
    }

    /// Drop the active session without recording it.
    pub fn discard(&mut self) -> Option<BatchId> {
        self.active.take().map(|a| a.batch_id)
    }

    /// Seconds elapsed in the active session, or `None` when idle.
    pub fn elapsed(&self, now: OffsetDateTime) -> Option<u64> {
        self.active
            .map(|a| whole_seconds(a.started_at, now.max(a.started_at)))
    }

    /// Batch and start time of the active session.
    pub fn active(&self) -> Option<(BatchId, OffsetDateTime)> {
        self.active.map(|a| (a.batch_id, a.started_at))
    }

    /// Whether a session is open.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Completed sessions, newest first.
    pub fn history(&self) -> Vec<Session> {
        self.history.iter().cloned().collect()
    }

    /// Maximum number of retained sessions.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Replace the history with previously persisted sessions.
    ///
    /// Sessions are re-ordered newest first and truncated to the capacity.
    pub fn restore(&mut self, mut sessions: Vec<Session>) {
        sessions.sort_by(|a, b| b.end_time.cmp(&a.end_time));
        sessions.truncate(self.capacity);
        self.history = sessions.into();
    }

    fn push(&mut self, session: Session) {
        self.history.push_front(session);
        while self.history.len() > self.capacity {
            self.history.pop_back();
        }
    }
}

/// Whole seconds between two instants, floored.
fn whole_seconds(start: OffsetDateTime, end: OffsetDateTime) -> u64 {
    let millis = (end - start).whole_milliseconds().max(0);
    u64::try_from(millis / 1000).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;
    use time::macros::datetime;

    fn batch(n: u32) -> BatchId {
        BatchId::new(n).unwrap()
    }

    const T0: OffsetDateTime = datetime!(2025-05-20 10:00:00 UTC);

    #[test]
    fn test_start_stop_produces_session() {
        let mut tracker = SessionTracker::default();
        tracker.on_start(batch(8), T0).unwrap();
        let session = tracker.on_stop(T0 + Duration::seconds(65)).unwrap();

        assert_eq!(session.batch_id, batch(8));
        assert_eq!(session.duration_seconds, 65);
        assert_eq!(session.start_time, T0);
        assert!(!tracker.is_active());
        assert_eq!(tracker.history(), vec![session]);
    }

    #[test]
    fn test_duration_is_floored() {
        let mut tracker = SessionTracker::default();
        tracker.on_start(batch(1), T0).unwrap();
        let session = tracker.on_stop(T0 + Duration::milliseconds(1999)).unwrap();
        assert_eq!(session.duration_seconds, 1);
    }

    #[test]
    fn test_end_before_start_is_clamped() {
        let mut tracker = SessionTracker::default();
        tracker.on_start(batch(1), T0).unwrap();
        let session = tracker.on_stop(T0 - Duration::seconds(5)).unwrap();
        assert_eq!(session.end_time, T0);
        assert_eq!(session.duration_seconds, 0);
    }

    #[test]
    fn test_double_start_and_stray_stop() {
        let mut tracker = SessionTracker::default();
        assert_eq!(tracker.on_stop(T0), Err(SessionError::NotActive));

        tracker.on_start(batch(2), T0).unwrap();
        assert_eq!(
            tracker.on_start(batch(3), T0),
            Err(SessionError::AlreadyActive(batch(2)))
        );
    }

    #[test]
    fn test_elapsed() {
        let mut tracker = SessionTracker::default();
        assert_eq!(tracker.elapsed(T0), None);
        tracker.on_start(batch(1), T0).unwrap();
        assert_eq!(tracker.elapsed(T0 + Duration::seconds(42)), Some(42));
        assert_eq!(tracker.elapsed(T0 - Duration::seconds(1)), Some(0));
    }

    #[test]
    fn test_history_newest_first_and_capped() {
        let mut tracker = SessionTracker::new(2);
        for i in 1..=3 {
            let start = T0 + Duration::minutes(i64::from(i));
            tracker.on_start(batch(i), start).unwrap();
            tracker.on_stop(start + Duration::seconds(10)).unwrap();
        }
        let ids: Vec<_> = tracker.history().iter().map(|s| s.batch_id.get()).collect();
        assert_eq!(ids, vec![3, 2]);
    }

    #[test]
    fn test_discard_records_nothing() {
        let mut tracker = SessionTracker::default();
        tracker.on_start(batch(5), T0).unwrap();
        assert_eq!(tracker.discard(), Some(batch(5)));
        assert!(tracker.history().is_empty());
        assert!(tracker.on_start(batch(6), T0).is_ok());
    }

    #[test]
    fn test_restore_orders_and_truncates() {
        let mut tracker = SessionTracker::new(2);
        let make = |n: u32, offset: i64| Session {
            id: Uuid::new_v4(),
            batch_id: batch(n),
            start_time: T0,
            end_time: T0 + Duration::seconds(offset),
            duration_seconds: offset as u64,
        };
        tracker.restore(vec![make(1, 10), make(2, 30), make(3, 20)]);
        let ids: Vec<_> = tracker.history().iter().map(|s| s.batch_id.get()).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_system_clock_is_utc() {
        assert!(SystemClock.now().offset().is_utc());
    }
}
