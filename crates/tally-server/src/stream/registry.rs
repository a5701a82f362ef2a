//! Topic -> subscriber index.
//!
//! The registry holds non-owning handles. Sessions are owned by the
//! lifecycle coordinator and their tasks; a handle that no longer upgrades
//! means a session was dropped without being unregistered.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tally_core::{SessionId, Topic};

use super::session::Session;

/// Non-owning reference to a registered session.
#[derive(Clone, Debug)]
pub struct SubscriberHandle {
    id: SessionId,
    session: Weak<Session>,
}

impl SubscriberHandle {
    /// Create a handle for a session.
    pub fn new(session: &Arc<Session>) -> Self {
        Self {
            id: session.id(),
            session: Arc::downgrade(session),
        }
    }

    /// Session ID.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Upgrade to the live session, if it still exists.
    pub fn upgrade(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }
}

/// Subscribers of one topic at one instant.
#[derive(Debug, Default)]
pub struct Snapshot {
    /// Live sessions.
    pub sessions: Vec<Arc<Session>>,
    /// Handles whose session is gone. Already pruned from the registry.
    pub stale: Vec<SessionId>,
}

/// Concurrent topic -> set-of-subscribers map.
///
/// A topic entry exists only while it has at least one subscriber.
#[derive(Default)]
pub struct SubscriberRegistry {
    topics: DashMap<Topic, HashMap<SessionId, SubscriberHandle>>,
}

impl SubscriberRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handle under `topic`, creating the topic entry if needed.
    pub fn register(&self, topic: &Topic, handle: SubscriberHandle) {
        let _ = self
            .topics
            .entry(topic.clone())
            .or_default()
            .insert(handle.id(), handle);
    }

    /// Remove a handle. Deletes the topic entry once its set is empty.
    ///
    /// Returns whether the handle was present. Removing an absent handle is
    /// a no-op.
    pub fn unregister(&self, topic: &Topic, id: SessionId) -> bool {
        let mut removed = false;
        let _ = self.topics.remove_if_mut(topic, |_, subscribers| {
            removed = subscribers.remove(&id).is_some();
            subscribers.is_empty()
        });
        removed
    }

    /// Consistent copy of a topic's subscribers at one instant.
    ///
    /// Stale handles found while copying are removed and reported.
    pub fn snapshot(&self, topic: &Topic) -> Snapshot {
        let mut snapshot = Snapshot::default();
        {
            let Some(subscribers) = self.topics.get(topic) else {
                return snapshot;
            };
            snapshot.sessions.reserve(subscribers.len());
            for (id, handle) in subscribers.iter() {
                match handle.upgrade() {
                    Some(session) => snapshot.sessions.push(session),
                    None => snapshot.stale.push(*id),
                }
            }
        }
        for id in &snapshot.stale {
            let _ = self.unregister(topic, *id);
        }
        snapshot
    }

    /// Whether `id` is registered under `topic`.
    pub fn contains(&self, topic: &Topic, id: SessionId) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|subscribers| subscribers.contains_key(&id))
    }

    /// Session IDs registered under `topic`.
    pub fn subscriber_ids(&self, topic: &Topic) -> Vec<SessionId> {
        self.topics
            .get(topic)
            .map(|subscribers| subscribers.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Subscriber count for one topic.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics.get(topic).map_or(0, |subscribers| subscribers.len())
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Total handles across all topics.
    pub fn total_subscribers(&self) -> usize {
        self.topics.iter().map(|entry| entry.value().len()).sum()
    }

    /// Whether no topic has subscribers.
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(key: &str) -> Topic {
        Topic::new("site", key).unwrap()
    }

    fn session(key: &str) -> Arc<Session> {
        Arc::new(Session::new(topic(key), 4))
    }

    #[test]
    fn register_and_snapshot() {
        let registry = SubscriberRegistry::new();
        let a = session("visits");
        let b = session("visits");
        registry.register(a.topic(), SubscriberHandle::new(&a));
        registry.register(b.topic(), SubscriberHandle::new(&b));

        let snapshot = registry.snapshot(&topic("visits"));
        assert_eq!(snapshot.sessions.len(), 2);
        assert!(snapshot.stale.is_empty());
        assert_eq!(registry.subscriber_count(&topic("visits")), 2);
        assert_eq!(registry.topic_count(), 1);
    }

    #[test]
    fn unregister_last_removes_topic() {
        let registry = SubscriberRegistry::new();
        let a = session("visits");
        registry.register(a.topic(), SubscriberHandle::new(&a));
        assert!(registry.unregister(a.topic(), a.id()));
        assert_eq!(registry.topic_count(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn unregister_absent_is_noop() {
        let registry = SubscriberRegistry::new();
        let a = session("visits");
        assert!(!registry.unregister(a.topic(), a.id()));

        registry.register(a.topic(), SubscriberHandle::new(&a));
        assert!(registry.unregister(a.topic(), a.id()));
        assert!(!registry.unregister(a.topic(), a.id()));
    }

    #[test]
    fn unregister_keeps_other_subscribers() {
        let registry = SubscriberRegistry::new();
        let a = session("visits");
        let b = session("visits");
        registry.register(a.topic(), SubscriberHandle::new(&a));
        registry.register(b.topic(), SubscriberHandle::new(&b));
        assert!(registry.unregister(a.topic(), a.id()));
        assert!(registry.contains(b.topic(), b.id()));
        assert!(!registry.contains(a.topic(), a.id()));
    }

    #[test]
    fn topics_are_isolated() {
        let registry = SubscriberRegistry::new();
        let a = session("visits");
        let b = session("downloads");
        registry.register(a.topic(), SubscriberHandle::new(&a));
        registry.register(b.topic(), SubscriberHandle::new(&b));
        let snapshot = registry.snapshot(&topic("visits"));
        assert_eq!(snapshot.sessions.len(), 1);
        assert_eq!(snapshot.sessions[0].id(), a.id());
        assert_eq!(registry.total_subscribers(), 2);
    }

    #[test]
    fn snapshot_unaffected_by_later_unregister() {
        let registry = SubscriberRegistry::new();
        let a = session("visits");
        registry.register(a.topic(), SubscriberHandle::new(&a));
        let snapshot = registry.snapshot(&topic("visits"));
        let _ = registry.unregister(a.topic(), a.id());
        assert_eq!(snapshot.sessions.len(), 1);
    }

    #[test]
    fn stale_handles_are_pruned() {
        let registry = SubscriberRegistry::new();
        let a = session("visits");
        let id = a.id();
        registry.register(a.topic(), SubscriberHandle::new(&a));
        drop(a);

        let snapshot = registry.snapshot(&topic("visits"));
        assert!(snapshot.sessions.is_empty());
        assert_eq!(snapshot.stale, vec![id]);
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_of_unknown_topic_is_empty() {
        let registry = SubscriberRegistry::new();
        let snapshot = registry.snapshot(&topic("nothing"));
        assert!(snapshot.sessions.is_empty());
        assert!(snapshot.stale.is_empty());
    }

    #[test]
    fn concurrent_register_unregister_leaves_no_empty_sets() {
        let registry = Arc::new(SubscriberRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let s = session("visits");
                        registry.register(s.topic(), SubscriberHandle::new(&s));
                        assert!(registry.unregister(s.topic(), s.id()));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
