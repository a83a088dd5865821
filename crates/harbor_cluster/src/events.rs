//! Structured log of topology-affecting events: recovery state transitions,
//! degeneration requests and failbacks. Bounded ring buffer; every entry
//! is also emitted through `tracing`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use harbor_common::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    Recovery,
    Degeneration,
    Failback,
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventCategory::Recovery => write!(f, "recovery"),
            EventCategory::Degeneration => write!(f, "degeneration"),
            EventCategory::Failback => write!(f, "failback"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Info,
    Warn,
    Error,
}

impl fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSeverity::Info => write!(f, "info"),
            EventSeverity::Warn => write!(f, "warn"),
            EventSeverity::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClusterEvent {
    /// Monotonically increasing, starting at 1.
    pub seq: u64,
    /// Wall-clock timestamp (ms since epoch).
    pub timestamp_ms: u64,
    pub category: EventCategory,
    pub severity: EventSeverity,
    pub node_id: NodeId,
    pub from_state: String,
    pub to_state: String,
    pub message: String,
}

struct LogInner {
    events: VecDeque<ClusterEvent>,
    next_seq: u64,
}

pub struct ClusterEventLog {
    inner: Mutex<LogInner>,
    max_events: usize,
}

impl ClusterEventLog {
    pub fn new(max_events: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(LogInner {
                events: VecDeque::with_capacity(max_events),
                next_seq: 1,
            }),
            max_events: max_events.max(1),
        })
    }

    pub fn log(
        &self,
        category: EventCategory,
        severity: EventSeverity,
        node_id: NodeId,
        from_state: impl Into<String>,
        to_state: impl Into<String>,
        message: impl Into<String>,
    ) {
        let mut inner = self.inner.lock();
        let event = ClusterEvent {
            seq: inner.next_seq,
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            category,
            severity,
            node_id,
            from_state: from_state.into(),
            to_state: to_state.into(),
            message: message.into(),
        };
        inner.next_seq += 1;

        match severity {
            EventSeverity::Error => tracing::error!(
                seq = event.seq,
                category = %event.category,
                node_id = event.node_id.0,
                from = %event.from_state,
                to = %event.to_state,
                "CLUSTER_EVENT: {}",
                event.message,
            ),
            EventSeverity::Warn => tracing::warn!(
                seq = event.seq,
                category = %event.category,
                node_id = event.node_id.0,
                from = %event.from_state,
                to = %event.to_state,
                "CLUSTER_EVENT: {}",
                event.message,
            ),
            EventSeverity::Info => tracing::info!(
                seq = event.seq,
                category = %event.category,
                node_id = event.node_id.0,
                from = %event.from_state,
                to = %event.to_state,
                "CLUSTER_EVENT: {}",
                event.message,
            ),
        }

        if inner.events.len() >= self.max_events {
            inner.events.pop_front();
        }
        inner.events.push_back(event);
    }

    /// All retained events, oldest first.
    pub fn snapshot(&self) -> Vec<ClusterEvent> {
        self.inner.lock().events.iter().cloned().collect()
    }

    pub fn by_category(&self, category: EventCategory) -> Vec<ClusterEvent> {
        self.inner
            .lock()
            .events
            .iter()
            .filter(|e| e.category == category)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_numbers_increase() {
        let log = ClusterEventLog::new(8);
        log.log(EventCategory::Recovery, EventSeverity::Info, NodeId(1), "init", "checkpoint1", "a");
        log.log(EventCategory::Failback, EventSeverity::Info, NodeId(1), "", "", "b");
        let events = log.snapshot();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 1);
        assert_eq!(events[1].seq, 2);
        assert_eq!(events[0].to_state, "checkpoint1");
    }

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let log = ClusterEventLog::new(2);
        for i in 0..5 {
            log.log(
                EventCategory::Degeneration,
                EventSeverity::Warn,
                NodeId(i),
                "up",
                "down",
                format!("event {}", i),
            );
        }
        let events = log.snapshot();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 4);
        assert_eq!(events[1].node_id, NodeId(4));
    }

    #[test]
    fn test_filter_by_category() {
        let log = ClusterEventLog::new(8);
        log.log(EventCategory::Recovery, EventSeverity::Info, NodeId(0), "", "", "r");
        log.log(EventCategory::Degeneration, EventSeverity::Warn, NodeId(0), "", "", "d");
        assert_eq!(log.by_category(EventCategory::Degeneration).len(), 1);
        assert!(!log.is_empty());
    }
}
