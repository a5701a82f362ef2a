//! Session admission, teardown, and shutdown.
//!
//! The coordinator owns every live session. All closes, whatever triggers
//! them, go through [`LifecycleCoordinator::close`], which performs teardown
//! exactly once per session: mark draining, unregister, release the queue,
//! drop the session from the live table, mark terminated. Closes caused by a
//! [`StreamError`] go through [`LifecycleCoordinator::fail`], which records
//! the error on the session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tally_core::{CounterEvent, SessionId, Topic};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::StreamConfig;
use crate::metrics::{
    STREAM_FORCED_CLOSURES_TOTAL, STREAM_SESSION_DURATION_SECONDS, STREAM_SESSIONS_ACTIVE,
    STREAM_SESSIONS_CLOSED_TOTAL, STREAM_SESSIONS_OPENED_TOTAL, STREAM_SESSIONS_REJECTED_TOTAL,
};

use super::broadcast::{Broadcaster, PublishReport};
use super::errors::StreamError;
use super::liveness::{LivenessResult, run_idle_watch};
use super::registry::{SubscriberHandle, SubscriberRegistry};
use super::session::{CloseReason, Offer, Session, SessionState};
use super::transport::Transport;
use super::worker::run_session;

/// Result of a close request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// This call performed teardown.
    Closed,
    /// Teardown already ran or is running; nothing was done.
    AlreadyClosed,
}

/// Result of [`LifecycleCoordinator::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Sessions closed by the shutdown sweep.
    pub closed: usize,
    /// Whether every session task finished within the timeout.
    pub drained: bool,
    /// Tasks still running when the wait ended.
    pub remaining_tasks: usize,
}

/// Connection statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    /// Sessions currently admitted.
    pub active_connections: usize,
    /// Admission cap.
    pub max_connections: usize,
    /// Topics with at least one subscriber.
    pub topics: usize,
    /// Registered subscriber handles.
    pub subscribers: usize,
    /// Events published.
    pub total_messages: u64,
    /// Per-subscriber enqueues.
    pub delivered_messages: u64,
    /// Per-subscriber drops.
    pub dropped_messages: u64,
    /// Sessions opened since start.
    pub sessions_opened: u64,
    /// Sessions closed since start.
    pub sessions_closed: u64,
    /// Sessions closed by the server (idle, backpressure, inconsistency, abort).
    pub forced_closures: u64,
    /// Registry/session-table disagreements detected.
    pub registry_inconsistencies: u64,
    /// Session and watcher tasks still running.
    pub pending_tasks: usize,
}

/// Owns sessions and mediates every lifecycle transition.
pub struct LifecycleCoordinator {
    config: StreamConfig,
    registry: Arc<SubscriberRegistry>,
    broadcaster: Broadcaster,
    sessions: DashMap<SessionId, Arc<Session>>,
    active: AtomicUsize,
    shutting_down: AtomicBool,
    tasks: TaskTracker,
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    forced_closures: AtomicU64,
}

impl LifecycleCoordinator {
    /// Create a coordinator with an empty registry.
    ///
    /// Out-of-range timing values in `config` are clamped, see
    /// [`StreamConfig::sanitized`].
    pub fn new(config: StreamConfig) -> Self {
        let config = config.sanitized();
        let registry = Arc::new(SubscriberRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry), config.max_consecutive_drops);
        Self {
            config,
            registry,
            broadcaster,
            sessions: DashMap::new(),
            active: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            tasks: TaskTracker::new(),
            sessions_opened: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            forced_closures: AtomicU64::new(0),
        }
    }

    /// Lifecycle configuration.
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Subscriber registry.
    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Admit a session for `topic` and make it visible to the broadcaster.
    ///
    /// The returned session is `Open` and watched for idleness. No worker is
    /// attached; use [`accept_stream`](Self::accept_stream) to serve a client.
    pub fn open(self: &Arc<Self>, topic: Topic) -> Result<Arc<Session>, StreamError> {
        if self.is_shutting_down() {
            counter!(STREAM_SESSIONS_REJECTED_TOTAL, "cause" => "shutting_down").increment(1);
            return Err(StreamError::ShuttingDown);
        }
        let max = self.config.max_connections;
        if self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_err()
        {
            counter!(STREAM_SESSIONS_REJECTED_TOTAL, "cause" => "capacity").increment(1);
            warn!(%topic, max, "connection limit reached, rejecting stream");
            return Err(StreamError::CapacityExceeded { max });
        }

        let session = Arc::new(Session::new(topic, self.config.queue_capacity));
        let _ = self.sessions.insert(session.id(), Arc::clone(&session));
        self.registry
            .register(session.topic(), SubscriberHandle::new(&session));

        if !session.mark_open() {
            // A concurrent sweep claimed the session first; its close already
            // released the slot but may have run before we registered.
            let _ = self.registry.unregister(session.topic(), session.id());
            return Err(StreamError::SessionClosed);
        }
        let _ = self.sessions_opened.fetch_add(1, Ordering::Relaxed);
        counter!(STREAM_SESSIONS_OPENED_TOTAL).increment(1);
        gauge!(STREAM_SESSIONS_ACTIVE).increment(1.0);

        if self.is_shutting_down() {
            let _ = self.close(&session, CloseReason::Shutdown);
            return Err(StreamError::ShuttingDown);
        }
        info!(session_id = %session.id(), topic = %session.topic(), "session opened");

        self.spawn_idle_watch(Arc::clone(&session));
        Ok(session)
    }

    /// Admit a session and attach a worker that streams to `transport`.
    ///
    /// When `initial` is set the current value is queued before any
    /// broadcast can reach the client.
    pub fn accept_stream<T: Transport>(
        self: &Arc<Self>,
        topic: Topic,
        transport: T,
        initial: Option<i64>,
    ) -> Result<Arc<Session>, StreamError> {
        let session = self.open(topic)?;
        if let Some(value) = initial {
            let event = CounterEvent::new(session.topic().clone(), value);
            if session.offer(event) != Offer::Queued {
                debug!(session_id = %session.id(), "initial value not queued");
            }
        }
        let _ = self
            .tasks
            .spawn(run_session(Arc::clone(self), Arc::clone(&session), transport));
        Ok(session)
    }

    fn spawn_idle_watch(self: &Arc<Self>, session: Arc<Session>) {
        let coordinator = Arc::clone(self);
        let interval = self.config.detection_interval;
        let idle_timeout = self.config.idle_timeout;
        let _ = self.tasks.spawn(async move {
            if run_idle_watch(Arc::clone(&session), interval, idle_timeout).await
                == LivenessResult::TimedOut
            {
                warn!(
                    session_id = %session.id(),
                    topic = %session.topic(),
                    idle_ms = u64::try_from(session.idle_for().as_millis()).unwrap_or(u64::MAX),
                    "session idle, closing"
                );
                let _ = coordinator.fail(&session, StreamError::IdleTimeout(session.idle_for()));
            }
        });
    }

    /// Tear a session down. Safe to call any number of times from anywhere.
    ///
    /// Only the first call for a session does anything; later calls return
    /// [`CloseOutcome::AlreadyClosed`].
    pub fn close(&self, session: &Session, reason: CloseReason) -> CloseOutcome {
        self.teardown(session, reason, None)
    }

    /// Tear a session down because of `error`.
    ///
    /// The close reason is derived from the error. If this call wins the
    /// close, the error is kept on the session as its
    /// [`failure`](Session::failure).
    pub fn fail(&self, session: &Session, error: StreamError) -> CloseOutcome {
        let reason = CloseReason::from(&error);
        self.teardown(session, reason, Some(error))
    }

    fn teardown(
        &self,
        session: &Session,
        reason: CloseReason,
        failure: Option<StreamError>,
    ) -> CloseOutcome {
        let Some(previous) = session.begin_draining(reason) else {
            return CloseOutcome::AlreadyClosed;
        };
        if let Some(error) = failure {
            warn!(session_id = %session.id(), topic = %session.topic(), %error, "session failed");
            session.record_failure(error);
        }

        let unregistered = self.registry.unregister(session.topic(), session.id());
        if previous == SessionState::Open && !unregistered {
            self.broadcaster.record_inconsistency();
            let error = StreamError::RegistryInconsistency(format!(
                "open session {} missing from registry at close",
                session.id()
            ));
            error!(session_id = %session.id(), topic = %session.topic(), %error);
        }
        let _ = session.queue().release();
        if self.sessions.remove(&session.id()).is_some() {
            let _ = self.active.fetch_sub(1, Ordering::AcqRel);
        }
        session.mark_terminated();

        if previous == SessionState::Open {
            let _ = self.sessions_closed.fetch_add(1, Ordering::Relaxed);
            counter!(STREAM_SESSIONS_CLOSED_TOTAL, "reason" => reason.as_str()).increment(1);
            gauge!(STREAM_SESSIONS_ACTIVE).decrement(1.0);
            histogram!(STREAM_SESSION_DURATION_SECONDS).record(session.age().as_secs_f64());
        }
        if reason.is_forced() {
            let _ = self.forced_closures.fetch_add(1, Ordering::Relaxed);
            counter!(STREAM_FORCED_CLOSURES_TOTAL, "reason" => reason.as_str()).increment(1);
        }
        info!(
            session_id = %session.id(),
            topic = %session.topic(),
            reason = reason.as_str(),
            dropped = session.drop_count(),
            "session terminated"
        );
        CloseOutcome::Closed
    }

    /// Close a live session by ID.
    pub fn close_by_id(&self, id: SessionId, reason: CloseReason) -> CloseOutcome {
        let session = self.sessions.get(&id).map(|entry| Arc::clone(entry.value()));
        match session {
            Some(session) => self.close(&session, reason),
            None => CloseOutcome::AlreadyClosed,
        }
    }

    /// Close every session subscribed to `topic`. Returns how many closed.
    pub fn close_topic(&self, topic: &Topic) -> usize {
        let ids = self.registry.subscriber_ids(topic);
        let closed = ids
            .into_iter()
            .filter(|id| self.close_by_id(*id, CloseReason::TopicClosed) == CloseOutcome::Closed)
            .count();
        if closed > 0 {
            info!(%topic, closed, "topic streams closed");
        }
        closed
    }

    /// Publish a counter change to the topic's subscribers.
    ///
    /// Never waits on a subscriber. Subscribers past the drop threshold and
    /// sessions found in an inconsistent state are closed before returning.
    pub fn publish(&self, event: &CounterEvent) -> PublishReport {
        let report = self.broadcaster.publish(event);
        for session in &report.forced {
            let _ = self.fail(session, StreamError::BackpressureDrop);
        }
        for session in &report.inconsistent {
            let error = StreamError::RegistryInconsistency(format!(
                "session {} still registered after termination",
                session.id()
            ));
            let _ = self.fail(session, error);
        }
        report
    }

    /// Publish a new value for `topic`.
    pub fn on_hit(&self, topic: Topic, value: i64) -> PublishReport {
        self.publish(&CounterEvent::new(topic, value))
    }

    /// Stop admitting sessions, close every live one, and wait for their
    /// tasks to finish for at most `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.shutting_down.store(true, Ordering::SeqCst);
        let live: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        info!(sessions = live.len(), "closing all streams for shutdown");

        let closed = live
            .iter()
            .filter(|session| self.close(session, CloseReason::Shutdown) == CloseOutcome::Closed)
            .count();

        let _ = self.tasks.close();
        let drained = tokio::time::timeout(timeout, self.tasks.wait()).await.is_ok();
        let remaining_tasks = self.tasks.len();
        if drained {
            info!(closed, "stream shutdown complete");
        } else {
            warn!(
                closed,
                remaining_tasks, "stream shutdown timed out after {timeout:?}"
            );
        }
        ShutdownReport {
            closed,
            drained,
            remaining_tasks,
        }
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Live session by ID.
    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Sessions currently admitted.
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Subscribers of one topic.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.registry.subscriber_count(topic)
    }

    /// Session and watcher tasks still running.
    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Connection statistics.
    pub fn stats(&self) -> StreamStats {
        let broadcast = self.broadcaster.stats();
        StreamStats {
            active_connections: self.active_sessions(),
            max_connections: self.config.max_connections,
            topics: self.registry.topic_count(),
            subscribers: self.registry.total_subscribers(),
            total_messages: broadcast.total_messages,
            delivered_messages: broadcast.delivered_messages,
            dropped_messages: broadcast.dropped_messages,
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            forced_closures: self.forced_closures.load(Ordering::Relaxed),
            registry_inconsistencies: broadcast.registry_inconsistencies,
            pending_tasks: self.tasks.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::transport::ChannelTransport;
    use assert_matches::assert_matches;

    fn topic(key: &str) -> Topic {
        Topic::new("site", key).unwrap()
    }

    fn coordinator(config: StreamConfig) -> Arc<LifecycleCoordinator> {
        Arc::new(LifecycleCoordinator::new(config))
    }

    #[tokio::test]
    async fn open_registers_session() {
        let coord = coordinator(StreamConfig::default());
        let session = coord.open(topic("visits")).unwrap();
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(coord.subscriber_count(&topic("visits")), 1);
        assert_eq!(coord.active_sessions(), 1);
        assert!(coord.session(session.id()).is_some());
    }

    #[tokio::test]
    async fn close_releases_everything() {
        let coord = coordinator(StreamConfig::default());
        let session = coord.open(topic("visits")).unwrap();
        assert_eq!(
            coord.close(&session, CloseReason::Explicit),
            CloseOutcome::Closed
        );
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(coord.registry().is_empty());
        assert_eq!(coord.active_sessions(), 0);
        assert!(session.queue().is_released());
        assert!(coord.session(session.id()).is_none());
        assert_eq!(coord.stats().sessions_closed, 1);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let coord = coordinator(StreamConfig::default());
        let session = coord.open(topic("visits")).unwrap();
        assert_eq!(
            coord.close(&session, CloseReason::ClientClosed),
            CloseOutcome::Closed
        );
        assert_eq!(
            coord.close(&session, CloseReason::IdleTimeout),
            CloseOutcome::AlreadyClosed
        );
        assert_eq!(session.close_reason(), Some(CloseReason::ClientClosed));
        let stats = coord.stats();
        assert_eq!(stats.sessions_closed, 1);
        assert_eq!(stats.forced_closures, 0);
    }

    #[tokio::test]
    async fn capacity_enforced() {
        let coord = coordinator(StreamConfig {
            max_connections: 2,
            ..StreamConfig::default()
        });
        let a = coord.open(topic("visits")).unwrap();
        let _b = coord.open(topic("visits")).unwrap();
        assert_matches!(
            coord.open(topic("visits")),
            Err(StreamError::CapacityExceeded { max: 2 })
        );
        let _ = coord.close(&a, CloseReason::Explicit);
        assert!(coord.open(topic("visits")).is_ok());
    }

    #[tokio::test]
    async fn publish_reaches_open_sessions() {
        let coord = coordinator(StreamConfig::default());
        let a = coord.open(topic("visits")).unwrap();
        let report = coord.on_hit(topic("visits"), 3);
        assert_eq!(report.delivered, 1);
        assert_eq!(a.queue().pop().await.unwrap().value, 3);
    }

    #[tokio::test]
    async fn closed_session_receives_nothing() {
        let coord = coordinator(StreamConfig::default());
        let a = coord.open(topic("visits")).unwrap();
        let _ = coord.close(&a, CloseReason::Explicit);
        let report = coord.on_hit(topic("visits"), 3);
        assert_eq!(report.recipients, 0);
        assert!(a.queue().is_empty());
    }

    #[tokio::test]
    async fn backpressure_forces_close() {
        let coord = coordinator(StreamConfig {
            queue_capacity: 2,
            max_consecutive_drops: 3,
            ..StreamConfig::default()
        });
        let slow = coord.open(topic("visits")).unwrap();
        for v in 1..=4 {
            let _ = coord.on_hit(topic("visits"), v);
        }
        assert_eq!(slow.state(), SessionState::Open);
        assert!(slow.is_degraded());
        let _ = coord.on_hit(topic("visits"), 5);
        assert_eq!(slow.state(), SessionState::Terminated);
        assert_eq!(slow.close_reason(), Some(CloseReason::Backpressure));
        assert_eq!(coord.stats().forced_closures, 1);
    }

    #[tokio::test]
    async fn close_topic_closes_only_that_topic() {
        let coord = coordinator(StreamConfig::default());
        let a = coord.open(topic("visits")).unwrap();
        let b = coord.open(topic("visits")).unwrap();
        let other = coord.open(topic("downloads")).unwrap();
        assert_eq!(coord.close_topic(&topic("visits")), 2);
        assert_eq!(a.close_reason(), Some(CloseReason::TopicClosed));
        assert_eq!(b.state(), SessionState::Terminated);
        assert!(other.is_open());
        assert_eq!(coord.close_topic(&topic("visits")), 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_sessions() {
        let coord = coordinator(StreamConfig::default());
        let a = coord.open(topic("visits")).unwrap();
        let report = coord.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report.closed, 1);
        assert!(report.drained);
        assert_eq!(a.close_reason(), Some(CloseReason::Shutdown));
        assert_matches!(coord.open(topic("visits")), Err(StreamError::ShuttingDown));
        assert_eq!(coord.pending_tasks(), 0);
    }

    #[tokio::test]
    async fn accept_stream_writes_initial_value() {
        let coord = coordinator(StreamConfig::default());
        let (transport, mut rx) = ChannelTransport::new(8);
        let session = coord
            .accept_stream(topic("visits"), transport, Some(41))
            .unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(&first[..], b"data: {\"value\":41}\n\n");

        let _ = coord.on_hit(topic("visits"), 42);
        let second = rx.recv().await.unwrap();
        assert_eq!(&second[..], b"data: {\"value\":42}\n\n");

        let _ = coord.close(&session, CloseReason::Explicit);
        // The worker drops its transport once it observes the close.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn client_disconnect_tears_down() {
        let coord = coordinator(StreamConfig::default());
        let (transport, rx) = ChannelTransport::new(8);
        let session = coord.accept_stream(topic("visits"), transport, None).unwrap();
        drop(rx);
        tokio::time::timeout(Duration::from_secs(1), async {
            while session.state() != SessionState::Terminated {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(session.close_reason(), Some(CloseReason::ClientClosed));
        assert!(coord.registry().is_empty());
    }

    #[tokio::test]
    async fn open_session_missing_from_registry_is_reported() {
        let coord = coordinator(StreamConfig::default());
        let session = coord.open(topic("visits")).unwrap();
        assert!(coord.registry().unregister(session.topic(), session.id()));

        assert_eq!(
            coord.close(&session, CloseReason::Explicit),
            CloseOutcome::Closed
        );
        assert_eq!(coord.stats().registry_inconsistencies, 1);
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(session.queue().is_released());
        assert_eq!(coord.active_sessions(), 0);
    }

    #[tokio::test]
    async fn fail_records_error_and_reason() {
        let coord = coordinator(StreamConfig::default());
        let session = coord.open(topic("visits")).unwrap();
        assert_eq!(
            coord.fail(&session, StreamError::BackpressureDrop),
            CloseOutcome::Closed
        );
        assert_eq!(session.close_reason(), Some(CloseReason::Backpressure));
        assert_eq!(session.failure(), Some(&StreamError::BackpressureDrop));
        assert_eq!(coord.stats().forced_closures, 1);

        // A later failure neither reopens teardown nor replaces the first error.
        assert_eq!(
            coord.fail(&session, StreamError::IdleTimeout(Duration::from_secs(1))),
            CloseOutcome::AlreadyClosed
        );
        assert_eq!(session.failure(), Some(&StreamError::BackpressureDrop));
    }

    #[tokio::test]
    async fn orderly_close_has_no_failure() {
        let coord = coordinator(StreamConfig::default());
        let session = coord.open(topic("visits")).unwrap();
        let _ = coord.close(&session, CloseReason::ClientClosed);
        assert!(session.failure().is_none());
    }

    #[tokio::test]
    async fn config_is_sanitized() {
        let coord = coordinator(StreamConfig {
            detection_interval: Duration::ZERO,
            ..StreamConfig::default()
        });
        assert!(!coord.config().detection_interval.is_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_closed() {
        let coord = coordinator(StreamConfig {
            idle_timeout: Duration::from_secs(5),
            detection_interval: Duration::from_secs(1),
            ..StreamConfig::default()
        });
        let session = coord.open(topic("visits")).unwrap();
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(session.close_reason(), Some(CloseReason::IdleTimeout));
        assert_matches!(session.failure(), Some(StreamError::IdleTimeout(_)));
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(coord.stats().forced_closures, 1);
    }
}
