//! In-memory system event ring surfaced through the status endpoint:
//! sensor faults, controller actions, interlock refusals, and lifecycle
//! notices. Capped; oldest entries fall off the front.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Action,
    Fault,
    Safety,
    System,
}

#[derive(Default)]
pub struct EventRing {
    events: VecDeque<SystemEvent>,
}

impl EventRing {
    pub fn new() -> Self {
        Self {
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn record(&mut self, kind: EventKind, detail: impl Into<String>) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: Utc::now(),
            kind,
            detail: detail.into(),
        });
    }

    /// Newest first, for the status response.
    pub fn snapshot(&self) -> Vec<SystemEvent> {
        self.events.iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_appends_event() {
        let mut ring = EventRing::new();
        ring.record(EventKind::System, "scheduler started");
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.snapshot()[0].detail, "scheduler started");
    }

    #[test]
    fn ring_caps_at_max() {
        let mut ring = EventRing::new();
        for i in 0..MAX_EVENTS + 50 {
            ring.record(EventKind::Reading, format!("event {i}"));
        }
        assert_eq!(ring.len(), MAX_EVENTS);
    }

    #[test]
    fn ring_evicts_oldest() {
        let mut ring = EventRing::new();
        for i in 0..MAX_EVENTS + 10 {
            ring.record(EventKind::Reading, format!("event {i}"));
        }
        let snapshot = ring.snapshot();
        // Newest first: the final event leads, event 10 is the oldest kept.
        assert_eq!(snapshot[0].detail, format!("event {}", MAX_EVENTS + 9));
        assert_eq!(snapshot.last().unwrap().detail, "event 10");
    }

    #[test]
    fn snapshot_is_newest_first() {
        let mut ring = EventRing::new();
        ring.record(EventKind::System, "first");
        ring.record(EventKind::Fault, "second");
        let snapshot = ring.snapshot();
        assert_eq!(snapshot[0].detail, "second");
        assert_eq!(snapshot[1].detail, "first");
    }
}
