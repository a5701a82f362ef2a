//! Counter events and their event-stream wire encoding.
//!
//! Every event becomes one `text/event-stream` record terminated by a blank
//! line. Counter updates carry a JSON `data` payload; keepalives are comment
//! records that clients ignore.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::topic::Topic;

/// A counter changed value.
///
/// Immutable once built. Fan-out clones it into every subscriber queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CounterEvent {
    /// The counter that changed.
    pub topic: Topic,
    /// Value after the change.
    pub value: i64,
    /// When the change was observed.
    pub timestamp: DateTime<Utc>,
}

impl CounterEvent {
    /// Build an event stamped with the current time.
    pub fn new(topic: Topic, value: i64) -> Self {
        Self {
            topic,
            value,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Serialize)]
struct DataPayload {
    value: i64,
}

/// One encoded event-stream record, ready to write to a client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame(Bytes);

impl Frame {
    /// Comment record sent when a stream has been quiet for a while.
    pub const KEEPALIVE: &'static [u8] = b": keepalive\n\n";

    /// Encode a counter event as `data: {"value":N}\n\n`.
    pub fn event(event: &CounterEvent) -> Self {
        let payload = serde_json::to_string(&DataPayload { value: event.value })
            .unwrap_or_else(|_| format!("{{\"value\":{}}}", event.value));
        Self(Bytes::from(format!("data: {payload}\n\n")))
    }

    /// The keepalive comment record.
    pub fn keepalive() -> Self {
        Self(Bytes::from_static(Self::KEEPALIVE))
    }

    /// Whether this is a keepalive record.
    pub fn is_keepalive(&self) -> bool {
        self.0.as_ref() == Self::KEEPALIVE
    }

    /// Borrow the encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Take the encoded bytes.
    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic() -> Topic {
        Topic::new("site", "visits").unwrap()
    }

    #[test]
    fn event_frame_format() {
        let frame = Frame::event(&CounterEvent::new(topic(), 42));
        assert_eq!(frame.as_bytes(), b"data: {\"value\":42}\n\n");
        assert!(!frame.is_keepalive());
    }

    #[test]
    fn negative_value_frame() {
        let frame = Frame::event(&CounterEvent::new(topic(), -7));
        assert_eq!(frame.as_bytes(), b"data: {\"value\":-7}\n\n");
    }

    #[test]
    fn frames_end_with_blank_line() {
        let event = Frame::event(&CounterEvent::new(topic(), 1));
        assert!(event.as_bytes().ends_with(b"\n\n"));
        assert!(Frame::keepalive().as_bytes().ends_with(b"\n\n"));
    }

    #[test]
    fn keepalive_is_comment() {
        let frame = Frame::keepalive();
        assert!(frame.is_keepalive());
        assert!(frame.as_bytes().starts_with(b":"));
    }

    #[test]
    fn clone_is_independent_value() {
        let event = CounterEvent::new(topic(), 5);
        let copy = event.clone();
        assert_eq!(event, copy);
        assert_eq!(copy.topic.key(), "visits");
    }

    #[test]
    fn event_serializes_topic_and_value() {
        let event = CounterEvent::new(topic(), 3);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["value"], 3);
        assert_eq!(json["topic"]["namespace"], "site");
        assert_eq!(json["topic"]["key"], "visits");
        assert!(json["timestamp"].is_string());
    }
}
