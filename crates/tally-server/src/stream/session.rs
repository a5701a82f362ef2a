//! Per-client streaming session state.
//!
//! A session moves strictly forward through
//! `Opening -> Open -> Draining -> Terminated`. Only `Open` sessions accept
//! events. The transition into `Draining` is claimed by exactly one caller,
//! which makes teardown single-fire no matter how many triggers race.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tally_core::{CounterEvent, SessionId, Topic};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::errors::StreamError;
use super::queue::{EventQueue, PushError};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SessionState {
    /// Admitted, not yet visible to the broadcaster.
    Opening = 0,
    /// Registered and receiving events.
    Open = 1,
    /// Teardown claimed; no new events accepted.
    Draining = 2,
    /// All resources released.
    Terminated = 3,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Opening,
            1 => Self::Open,
            2 => Self::Draining,
            _ => Self::Terminated,
        }
    }
}

/// Why a session was closed. The first recorded reason wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The client went away.
    ClientClosed,
    /// A write failed or timed out.
    TransportError,
    /// No successful write within the idle bound.
    IdleTimeout,
    /// Too many consecutive dropped events.
    Backpressure,
    /// The topic was closed administratively.
    TopicClosed,
    /// Process shutdown.
    Shutdown,
    /// Closed by an explicit caller request.
    Explicit,
    /// Registry and session table disagreed.
    Inconsistency,
    /// The worker task exited without reporting a reason (panic or abort).
    Aborted,
}

impl CloseReason {
    /// Stable label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::TransportError => "transport_error",
            Self::IdleTimeout => "idle_timeout",
            Self::Backpressure => "backpressure",
            Self::TopicClosed => "topic_closed",
            Self::Shutdown => "shutdown",
            Self::Explicit => "explicit",
            Self::Inconsistency => "inconsistency",
            Self::Aborted => "aborted",
        }
    }

    /// Whether the close was forced by the server rather than the client.
    pub fn is_forced(self) -> bool {
        matches!(
            self,
            Self::IdleTimeout | Self::Backpressure | Self::Inconsistency | Self::Aborted
        )
    }
}

impl From<&StreamError> for CloseReason {
    fn from(error: &StreamError) -> Self {
        match error {
            StreamError::Transport(_) => Self::TransportError,
            StreamError::IdleTimeout(_) => Self::IdleTimeout,
            StreamError::BackpressureDrop => Self::Backpressure,
            StreamError::RegistryInconsistency(_) => Self::Inconsistency,
            StreamError::ShuttingDown => Self::Shutdown,
            StreamError::CapacityExceeded { .. } | StreamError::SessionClosed => Self::Explicit,
        }
    }
}

/// Result of offering an event to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Enqueued.
    Queued,
    /// Queue full; the event was dropped. Carries the consecutive drop count.
    Dropped(u32),
    /// The session is not `Open`.
    Inactive,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Session ID.
    pub id: SessionId,
    /// Subscribed topic.
    pub topic: Topic,
    /// Current state.
    pub state: SessionState,
    /// Events waiting in the outbound queue.
    pub queued: usize,
    /// Events dropped for this session.
    pub dropped: u64,
    /// Frames successfully written.
    pub written: u64,
    /// Whether recent events were dropped.
    pub degraded: bool,
}

/// A single client's streaming session.
pub struct Session {
    id: SessionId,
    topic: Topic,
    queue: EventQueue,
    state: AtomicU8,
    opened_at: Instant,
    last_activity: Mutex<Instant>,
    consecutive_drops: AtomicU32,
    dropped: AtomicU64,
    written: AtomicU64,
    close_reason: OnceLock<CloseReason>,
    failure: OnceLock<StreamError>,
    cancel: CancellationToken,
}

impl Session {
    /// Create a session in `Opening` with an empty queue.
    pub fn new(topic: Topic, queue_capacity: usize) -> Self {
        let now = Instant::now();
        Self {
            id: SessionId::new(),
            topic,
            queue: EventQueue::new(queue_capacity),
            state: AtomicU8::new(SessionState::Opening as u8),
            opened_at: now,
            last_activity: Mutex::new(now),
            consecutive_drops: AtomicU32::new(0),
            dropped: AtomicU64::new(0),
            written: AtomicU64::new(0),
            close_reason: OnceLock::new(),
            failure: OnceLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Session ID.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Subscribed topic.
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the session currently accepts events.
    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Outbound queue.
    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// Offer an event without waiting.
    ///
    /// A successful enqueue resets the consecutive drop count.
    pub fn offer(&self, event: CounterEvent) -> Offer {
        if !self.is_open() {
            return Offer::Inactive;
        }
        match self.queue.try_push(event) {
            Ok(()) => {
                self.consecutive_drops.store(0, Ordering::Relaxed);
                Offer::Queued
            }
            Err(PushError::Full) => {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                Offer::Dropped(self.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1)
            }
            Err(PushError::Released) => Offer::Inactive,
        }
    }

    /// Claim the transition into `Draining`.
    ///
    /// Returns the state the session left, or `None` when another caller
    /// already claimed teardown. On success the close reason is recorded and
    /// the session's cancellation token fires.
    pub fn begin_draining(&self, reason: CloseReason) -> Option<SessionState> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = SessionState::from_u8(current);
            if !matches!(from, SessionState::Opening | SessionState::Open) {
                return None;
            }
            match self.state.compare_exchange_weak(
                current,
                SessionState::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let _ = self.close_reason.set(reason);
                    self.cancel.cancel();
                    return Some(from);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Move `Opening -> Open`. Fails if teardown already claimed the session.
    pub(crate) fn mark_open(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Opening as u8,
                SessionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn mark_terminated(&self) {
        self.state
            .store(SessionState::Terminated as u8, Ordering::Release);
    }

    /// Reason recorded by whoever claimed teardown.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    /// Error that forced the session closed, if teardown was caused by one.
    pub fn failure(&self) -> Option<&StreamError> {
        self.failure.get()
    }

    pub(crate) fn record_failure(&self, error: StreamError) {
        let _ = self.failure.set(error);
    }

    /// Token cancelled when teardown begins.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Record a successful write.
    pub fn record_write(&self) {
        let _ = self.written.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Refresh the liveness timestamp.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last successful write (or since the session opened).
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Session age.
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Events dropped because the queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Current run of consecutive drops.
    pub fn consecutive_drops(&self) -> u32 {
        self.consecutive_drops.load(Ordering::Relaxed)
    }

    /// Frames successfully written.
    pub fn written_count(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Whether the last offered event was dropped.
    pub fn is_degraded(&self) -> bool {
        self.consecutive_drops() > 0
    }

    /// Snapshot for diagnostics.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            topic: self.topic.clone(),
            state: self.state(),
            queued: self.queue.len(),
            dropped: self.drop_count(),
            written: self.written_count(),
            degraded: self.is_degraded(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
