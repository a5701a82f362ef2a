//! In-memory counter storage.
//!
//! Values live only for the life of the process.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tally_core::Topic;
use thiserror::Error;

/// Counter storage failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CounterError {
    /// `create` on an existing counter.
    #[error("counter {0} already exists")]
    AlreadyExists(Topic),
    /// The counter does not exist.
    #[error("counter {0} not found")]
    NotFound(Topic),
    /// A write that requires an existing counter found none.
    #[error("counter {0} does not exist, create it first")]
    Missing(Topic),
    /// Incrementing would overflow.
    #[error("counter {0} is at its maximum value")]
    Overflow(Topic),
}

/// Concurrent map of topic -> value.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    values: DashMap<Topic, i64>,
}

impl MemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a counter with an initial value. Fails if it already exists.
    pub fn create(&self, topic: &Topic, initial: i64) -> Result<i64, CounterError> {
        match self.values.entry(topic.clone()) {
            Entry::Occupied(_) => Err(CounterError::AlreadyExists(topic.clone())),
            Entry::Vacant(slot) => {
                let _ = slot.insert(initial);
                Ok(initial)
            }
        }
    }

    /// Increment a counter, creating it at 1 if missing. Returns the new value.
    pub fn hit(&self, topic: &Topic) -> Result<i64, CounterError> {
        let mut value = self.values.entry(topic.clone()).or_insert(0);
        *value = value
            .checked_add(1)
            .ok_or_else(|| CounterError::Overflow(topic.clone()))?;
        Ok(*value)
    }

    /// Overwrite an existing counter. Returns the new value.
    pub fn set(&self, topic: &Topic, value: i64) -> Result<i64, CounterError> {
        let mut current = self
            .values
            .get_mut(topic)
            .ok_or_else(|| CounterError::Missing(topic.clone()))?;
        *current = value;
        Ok(value)
    }

    /// Set an existing counter back to zero.
    pub fn reset(&self, topic: &Topic) -> Result<i64, CounterError> {
        self.set(topic, 0)
    }

    /// Add `delta` (which may be negative) to an existing counter.
    pub fn update_by(&self, topic: &Topic, delta: i64) -> Result<i64, CounterError> {
        let mut current = self
            .values
            .get_mut(topic)
            .ok_or_else(|| CounterError::Missing(topic.clone()))?;
        *current = current
            .checked_add(delta)
            .ok_or_else(|| CounterError::Overflow(topic.clone()))?;
        Ok(*current)
    }

    /// Current value, if the counter exists.
    pub fn get(&self, topic: &Topic) -> Option<i64> {
        self.values.get(topic).map(|value| *value)
    }

    /// Remove a counter. Returns the last value.
    pub fn delete(&self, topic: &Topic) -> Result<i64, CounterError> {
        self.values
            .remove(topic)
            .map(|(_, value)| value)
            .ok_or_else(|| CounterError::NotFound(topic.clone()))
    }

    /// Number of counters.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no counters exist.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
