//! Counter event fan-out to topic subscribers.
//!
//! Publishing never waits on a subscriber. Each recipient's queue either
//! accepts the event or the event is dropped for that recipient alone.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use serde::Serialize;
use tally_core::{CounterEvent, SessionId};
use tracing::{debug, error, warn};

use super::registry::SubscriberRegistry;
use super::session::{Offer, Session, SessionState};

/// Outcome of one publish.
#[derive(Debug, Default)]
pub struct PublishReport {
    /// Subscribers in the snapshot.
    pub recipients: usize,
    /// Subscribers whose queue accepted the event.
    pub delivered: usize,
    /// Subscribers that dropped the event because their queue was full.
    pub dropped: usize,
    /// Subscribers that crossed the consecutive-drop threshold.
    pub forced: Vec<Arc<Session>>,
    /// Terminated sessions still found in the registry.
    pub inconsistent: Vec<Arc<Session>>,
    /// Registry handles whose session no longer exists.
    pub stale: Vec<SessionId>,
}

/// Cumulative broadcaster counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastStats {
    /// Events published.
    pub total_messages: u64,
    /// Per-subscriber enqueues.
    pub delivered_messages: u64,
    /// Per-subscriber drops.
    pub dropped_messages: u64,
    /// Registry inconsistencies detected while publishing.
    pub registry_inconsistencies: u64,
}

/// Delivers events to every open subscriber of a topic.
pub struct Broadcaster {
    registry: Arc<SubscriberRegistry>,
    max_consecutive_drops: u32,
    total_messages: AtomicU64,
    delivered_messages: AtomicU64,
    dropped_messages: AtomicU64,
    registry_inconsistencies: AtomicU64,
}

impl Broadcaster {
    /// Create a broadcaster over `registry`.
    ///
    /// A subscriber reaching `max_consecutive_drops` drops in a row is
    /// reported for forced closure.
    pub fn new(registry: Arc<SubscriberRegistry>, max_consecutive_drops: u32) -> Self {
        Self {
            registry,
            max_consecutive_drops: max_consecutive_drops.max(1),
            total_messages: AtomicU64::new(0),
            delivered_messages: AtomicU64::new(0),
            dropped_messages: AtomicU64::new(0),
            registry_inconsistencies: AtomicU64::new(0),
        }
    }

    /// Offer `event` to every subscriber of its topic.
    ///
    /// Subscribers in `Draining` are skipped silently. Sessions listed in
    /// `forced` and `inconsistent` must be closed by the caller.
    pub fn publish(&self, event: &CounterEvent) -> PublishReport {
        let _ = self.total_messages.fetch_add(1, Ordering::Relaxed);
        counter!(crate::metrics::STREAM_EVENTS_PUBLISHED_TOTAL).increment(1);

        let snapshot = self.registry.snapshot(&event.topic);
        let mut report = PublishReport {
            recipients: snapshot.sessions.len(),
            stale: snapshot.stale,
            ..PublishReport::default()
        };
        for id in &report.stale {
            self.record_inconsistency();
            error!(session_id = %id, topic = %event.topic, "registry held a handle to a dropped session");
        }

        for session in snapshot.sessions {
            match session.offer(event.clone()) {
                Offer::Queued => report.delivered += 1,
                Offer::Dropped(consecutive) => {
                    report.dropped += 1;
                    counter!(crate::metrics::STREAM_BROADCAST_DROPS_TOTAL).increment(1);
                    if consecutive >= self.max_consecutive_drops {
                        warn!(
                            session_id = %session.id(),
                            topic = %event.topic,
                            consecutive,
                            "disconnecting slow subscriber"
                        );
                        report.forced.push(session);
                    } else {
                        debug!(
                            session_id = %session.id(),
                            topic = %event.topic,
                            consecutive,
                            "subscriber queue full, event dropped"
                        );
                    }
                }
                Offer::Inactive => {
                    if session.state() == SessionState::Terminated {
                        self.record_inconsistency();
                        error!(
                            session_id = %session.id(),
                            topic = %event.topic,
                            "terminated session still registered"
                        );
                        let _ = self.registry.unregister(&event.topic, session.id());
                        report.inconsistent.push(session);
                    }
                }
            }
        }

        let _ = self
            .delivered_messages
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        let _ = self
            .dropped_messages
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        debug!(
            topic = %event.topic,
            value = event.value,
            recipients = report.recipients,
            delivered = report.delivered,
            dropped = report.dropped,
            "broadcast event"
        );
        report
    }

    /// Count a registry inconsistency detected outside of publishing.
    pub fn record_inconsistency(&self) {
        let _ = self.registry_inconsistencies.fetch_add(1, Ordering::Relaxed);
        counter!(crate::metrics::STREAM_REGISTRY_INCONSISTENCIES_TOTAL).increment(1);
    }

    /// Consecutive-drop threshold for forced closure.
    pub fn max_consecutive_drops(&self) -> u32 {
        self.max_consecutive_drops
    }

    /// Cumulative counters.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            total_messages: self.total_messages.load(Ordering::Relaxed),
            delivered_messages: self.delivered_messages.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
            registry_inconsistencies: self.registry_inconsistencies.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::registry::SubscriberHandle;
    use crate::stream::session::CloseReason;
    use tally_core::Topic;

    fn topic(key: &str) -> Topic {
        Topic::new("site", key).unwrap()
    }

    fn open_session(registry: &SubscriberRegistry, key: &str, capacity: usize) -> Arc<Session> {
        let session = Arc::new(Session::new(topic(key), capacity));
        registry.register(session.topic(), SubscriberHandle::new(&session));
        assert!(session.mark_open());
        session
    }

    #[tokio::test]
    async fn delivers_to_topic_subscribers_only() {
        let registry = Arc::new(SubscriberRegistry::new());
        let a = open_session(&registry, "visits", 4);
        let b = open_session(&registry, "visits", 4);
        let other = open_session(&registry, "downloads", 4);
        let broadcaster = Broadcaster::new(registry, 8);

        let report = broadcaster.publish(&CounterEvent::new(topic("visits"), 7));
        assert_eq!(report.recipients, 2);
        assert_eq!(report.delivered, 2);
        assert_eq!(a.queue().pop().await.unwrap().value, 7);
        assert_eq!(b.queue().pop().await.unwrap().value, 7);
        assert!(other.queue().is_empty());
    }

    #[test]
    fn no_subscribers_is_noop() {
        let registry = Arc::new(SubscriberRegistry::new());
        let broadcaster = Broadcaster::new(registry, 8);
        let report = broadcaster.publish(&CounterEvent::new(topic("visits"), 1));
        assert_eq!(report.recipients, 0);
        assert_eq!(broadcaster.stats().total_messages, 1);
    }

    #[test]
    fn full_queue_drops_for_that_subscriber_only() {
        let registry = Arc::new(SubscriberRegistry::new());
        let slow = open_session(&registry, "visits", 1);
        let fast = open_session(&registry, "visits", 8);
        let broadcaster = Broadcaster::new(registry, 8);

        for v in 1..=3 {
            let _ = broadcaster.publish(&CounterEvent::new(topic("visits"), v));
        }
        assert_eq!(slow.queue().len(), 1);
        assert_eq!(slow.drop_count(), 2);
        assert!(slow.is_degraded());
        assert_eq!(fast.queue().len(), 3);
        assert!(!fast.is_degraded());

        let stats = broadcaster.stats();
        assert_eq!(stats.delivered_messages, 4);
        assert_eq!(stats.dropped_messages, 2);
    }

    #[test]
    fn threshold_reports_forced_closure() {
        let registry = Arc::new(SubscriberRegistry::new());
        let slow = open_session(&registry, "visits", 1);
        let broadcaster = Broadcaster::new(registry, 2);

        let first = broadcaster.publish(&CounterEvent::new(topic("visits"), 1));
        assert!(first.forced.is_empty());
        let second = broadcaster.publish(&CounterEvent::new(topic("visits"), 2));
        assert!(second.forced.is_empty());
        let third = broadcaster.publish(&CounterEvent::new(topic("visits"), 3));
        assert_eq!(third.forced.len(), 1);
        assert_eq!(third.forced[0].id(), slow.id());
    }

    #[test]
    fn draining_subscribers_skipped_silently() {
        let registry = Arc::new(SubscriberRegistry::new());
        let session = open_session(&registry, "visits", 4);
        let _ = session.begin_draining(CloseReason::Explicit);
        let broadcaster = Broadcaster::new(registry, 8);

        let report = broadcaster.publish(&CounterEvent::new(topic("visits"), 1));
        assert_eq!(report.delivered, 0);
        assert!(report.inconsistent.is_empty());
        assert_eq!(broadcaster.stats().registry_inconsistencies, 0);
    }

    #[test]
    fn terminated_but_registered_is_inconsistent() {
        let registry = Arc::new(SubscriberRegistry::new());
        let session = open_session(&registry, "visits", 4);
        let _ = session.begin_draining(CloseReason::Explicit);
        session.mark_terminated();
        let broadcaster = Broadcaster::new(registry.clone(), 8);

        let report = broadcaster.publish(&CounterEvent::new(topic("visits"), 1));
        assert_eq!(report.inconsistent.len(), 1);
        assert_eq!(broadcaster.stats().registry_inconsistencies, 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_handle_is_inconsistent() {
        let registry = Arc::new(SubscriberRegistry::new());
        let session = open_session(&registry, "visits", 4);
        let id = session.id();
        drop(session);
        let broadcaster = Broadcaster::new(registry.clone(), 8);

        let report = broadcaster.publish(&CounterEvent::new(topic("visits"), 1));
        assert_eq!(report.stale, vec![id]);
        assert_eq!(broadcaster.stats().registry_inconsistencies, 1);
        assert!(registry.is_empty());
    }
}
