//! Bounded per-session outbound FIFO.
//!
//! Producers enqueue without ever waiting: a full queue rejects the event.
//! The single consumer (the session worker) waits for the next event or for
//! the queue to be released at teardown.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tally_core::CounterEvent;
use tokio::sync::Notify;

/// Why an event could not be enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    /// The queue already holds `capacity` events.
    Full,
    /// The queue was released; the owning session is gone.
    Released,
}

struct Inner {
    items: VecDeque<CounterEvent>,
    released: bool,
}

/// Bounded FIFO with non-blocking push and async pop.
pub struct EventQueue {
    inner: Mutex<Inner>,
    ready: Notify,
    capacity: usize,
}

impl EventQueue {
    /// Create a queue holding at most `capacity` events (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                released: false,
            }),
            ready: Notify::new(),
            capacity,
        }
    }

    /// Enqueue an event, never waiting.
    pub fn try_push(&self, event: CounterEvent) -> Result<(), PushError> {
        {
            let mut inner = self.inner.lock();
            if inner.released {
                return Err(PushError::Released);
            }
            if inner.items.len() >= self.capacity {
                return Err(PushError::Full);
            }
            inner.items.push_back(event);
        }
        self.ready.notify_one();
        Ok(())
    }

    /// Wait for the next event. Returns `None` once the queue is released.
    ///
    /// Intended for a single consumer.
    pub async fn pop(&self) -> Option<CounterEvent> {
        loop {
            let notified = self.ready.notified();
            {
                let mut inner = self.inner.lock();
                if inner.released {
                    return None;
                }
                if let Some(event) = inner.items.pop_front() {
                    return Some(event);
                }
            }
            notified.await;
        }
    }

    /// Drop every buffered event and refuse further pushes.
    ///
    /// Returns `true` only for the call that performed the release.
    pub fn release(&self) -> bool {
        let first = {
            let mut inner = self.inner.lock();
            let first = !inner.released;
            inner.released = true;
            inner.items.clear();
            inner.items.shrink_to_fit();
            first
        };
        self.ready.notify_one();
        first
    }

    /// Buffered event count.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum buffered events.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether [`release`](Self::release) has run.
    pub fn is_released(&self) -> bool {
        self.inner.lock().released
    }
}
