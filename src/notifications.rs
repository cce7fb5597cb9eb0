//! Bounded, deduplicating log of per-file progress events.
//!
//! One instance lives for the whole process and is shared by the ingestion
//! pipeline, the metadata extractor and the HTTP polling/streaming routes.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::schema::{CustomerId, Notification, NotificationStatus};

/// Time source for notification timestamps and the dedup window.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Default)]
struct BusState {
    /// Newest first.
    entries: VecDeque<Notification>,
    next_seq: u64,
}

#[derive(Clone)]
pub struct NotificationBus {
    state: Arc<Mutex<BusState>>,
    capacity: usize,
    dedup_window: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl NotificationBus {
    pub fn new(capacity: usize, dedup_window: Duration) -> Self {
        Self::with_clock(capacity, dedup_window, Arc::new(SystemClock))
    }

    pub fn with_clock(capacity: usize, dedup_window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState::default())),
            capacity: capacity.max(1),
            dedup_window: chrono::Duration::from_std(dedup_window)
                .unwrap_or_else(|_| chrono::Duration::zero()),
            clock,
        }
    }

    /// Append an event. Returns `None` when an identical
    /// (customer, filename, status) event was published inside the dedup window.
    pub fn publish(
        &self,
        customer_id: CustomerId,
        filename: &str,
        status: NotificationStatus,
        message: Option<String>,
    ) -> Option<Notification> {
        let now = self.clock.now();
        let cutoff = now - self.dedup_window;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let duplicate = state
            .entries
            .iter()
            .take_while(|n| n.timestamp >= cutoff)
            .any(|n| n.customer_id == customer_id && n.filename == filename && n.status == status);
        if duplicate {
            debug!(customer_id, filename, ?status, "Dropping duplicate notification");
            return None;
        }

        state.next_seq += 1;
        let notification = Notification {
            seq: state.next_seq,
            customer_id,
            filename: filename.to_string(),
            status,
            message,
            timestamp: now,
        };
        state.entries.push_front(notification.clone());
        let capacity = self.capacity;
        state.entries.truncate(capacity);
        Some(notification)
    }

    /// Most recent events for a customer, newest first.
    pub fn recent(&self, customer_id: CustomerId, limit: usize) -> Vec<Notification> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .entries
            .iter()
            .filter(|n| n.customer_id == customer_id)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Events for a customer with a sequence number above `after`, oldest first.
    pub fn since(&self, customer_id: CustomerId, after: u64) -> Vec<Notification> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut newer: Vec<Notification> = state
            .entries
            .iter()
            .take_while(|n| n.seq > after)
            .filter(|n| n.customer_id == customer_id)
            .cloned()
            .collect();
        newer.reverse();
        newer
    }

    pub fn latest_for(&self, customer_id: CustomerId, filename: &str) -> Option<Notification> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .entries
            .iter()
            .find(|n| n.customer_id == customer_id && n.filename == filename)
            .cloned()
    }

    /// Sequence number of the newest event, 0 when empty.
    pub fn last_seq(&self) -> u64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.next_seq
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Clock that only moves when told to.
    pub(crate) struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        pub(crate) fn new() -> Self {
            Self(Mutex::new(Utc::now()))
        }

        pub(crate) fn advance(&self, by: Duration) {
            let mut now = self.0.lock().unwrap();
            *now += chrono::Duration::from_std(by).unwrap();
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn bus(capacity: usize) -> (NotificationBus, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let bus = NotificationBus::with_clock(capacity, Duration::from_secs(5), clock.clone());
        (bus, clock)
    }

    #[test]
    fn test_dedup_within_window() {
        let (bus, clock) = bus(10);
        assert!(bus
            .publish(7, "a.pdf", NotificationStatus::Processing, None)
            .is_some());
        assert!(bus
            .publish(7, "a.pdf", NotificationStatus::Processing, Some("again".into()))
            .is_none());
        // Different status or file is not a duplicate
        assert!(bus
            .publish(7, "a.pdf", NotificationStatus::Complete, None)
            .is_some());
        assert!(bus
            .publish(7, "b.pdf", NotificationStatus::Processing, None)
            .is_some());

        clock.advance(Duration::from_secs(6));
        assert!(bus
            .publish(7, "a.pdf", NotificationStatus::Processing, None)
            .is_some());
    }

    #[test]
    fn test_capacity_truncates_oldest() {
        let (bus, clock) = bus(3);
        for i in 0..5 {
            bus.publish(1, &format!("f{}.pdf", i), NotificationStatus::Complete, None);
            clock.advance(Duration::from_millis(10));
        }
        let recent = bus.recent(1, 10);
        let names: Vec<_> = recent.iter().map(|n| n.filename.as_str()).collect();
        assert_eq!(names, vec!["f4.pdf", "f3.pdf", "f2.pdf"]);
    }

    #[test]
    fn test_recent_filters_by_customer() {
        let (bus, _clock) = bus(10);
        bus.publish(1, "a.pdf", NotificationStatus::Processing, None);
        bus.publish(2, "b.pdf", NotificationStatus::Processing, None);
        bus.publish(1, "c.pdf", NotificationStatus::Error, Some("boom".into()));

        let recent = bus.recent(1, 20);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].filename, "c.pdf");
        assert_eq!(recent[0].message.as_deref(), Some("boom"));
        assert_eq!(bus.recent(1, 1).len(), 1);
    }

    #[test]
    fn test_since_is_oldest_first() {
        let (bus, _clock) = bus(10);
        bus.publish(1, "a.pdf", NotificationStatus::Processing, None);
        let mark = bus.last_seq();
        bus.publish(1, "a.pdf", NotificationStatus::Complete, None);
        bus.publish(2, "x.pdf", NotificationStatus::Complete, None);
        bus.publish(1, "b.pdf", NotificationStatus::Processing, None);

        let newer = bus.since(1, mark);
        let names: Vec<_> = newer
            .iter()
            .map(|n| (n.filename.as_str(), n.status))
            .collect();
        assert_eq!(
            names,
            vec![
                ("a.pdf", NotificationStatus::Complete),
                ("b.pdf", NotificationStatus::Processing)
            ]
        );
        assert_eq!(
            bus.latest_for(1, "a.pdf").unwrap().status,
            NotificationStatus::Complete
        );
    }
}
