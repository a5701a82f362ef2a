//! Counter topics.
//!
//! A topic is the `(namespace, key)` pair a counter lives under. Streams
//! subscribe to a topic and hits publish to one. Both segments must be
//! 3–64 characters from `[A-Za-z0-9_.-]`.

use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;

use crate::errors::TopicError;

/// Namespace used when a route only carries a key.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Length of each segment of a [`Topic::random`] topic.
pub const RANDOM_SEGMENT_LEN: usize = 16;

/// 64 symbols, so a random byte maps onto it without bias.
const RANDOM_CHARSET: &[u8; 64] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

static SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_\-.]{3,64}$").unwrap_or_else(|e| unreachable!("segment regex: {e}"))
});

/// A validated counter stream identifier.
///
/// Cheap to clone: both segments are reference-counted.
#[derive(Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Topic {
    namespace: Arc<str>,
    key: Arc<str>,
}

impl Topic {
    /// Build a topic after validating both segments.
    ///
    /// Leading and trailing `/` are stripped first, so wildcard route
    /// captures can be passed straight through.
    pub fn new(namespace: &str, key: &str) -> Result<Self, TopicError> {
        let namespace = namespace.trim_matches('/');
        let key = key.trim_matches('/');
        validate(namespace).map_err(TopicError::InvalidNamespace)?;
        validate(key).map_err(TopicError::InvalidKey)?;
        Ok(Self {
            namespace: Arc::from(namespace),
            key: Arc::from(key),
        })
    }

    /// Build a topic in [`DEFAULT_NAMESPACE`].
    pub fn in_default(key: &str) -> Result<Self, TopicError> {
        Self::new(DEFAULT_NAMESPACE, key)
    }

    /// A topic with random namespace and key segments.
    pub fn random() -> Self {
        Self {
            namespace: random_segment(),
            key: random_segment(),
        }
    }

    /// The namespace segment.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The key segment.
    pub fn key(&self) -> &str {
        &self.key
    }
}

fn random_segment() -> Arc<str> {
    let bytes: [u8; RANDOM_SEGMENT_LEN] = rand::random();
    bytes
        .iter()
        .map(|b| char::from(RANDOM_CHARSET[usize::from(b % 64)]))
        .collect::<String>()
        .into()
}

fn validate(segment: &str) -> Result<(), String> {
    if segment.len() < 3 || segment.len() > 64 {
        return Err("length must be between 3 and 64 characters inclusive".into());
    }
    if !SEGMENT.is_match(segment) {
        return Err(r"must match the pattern ^[A-Za-z0-9_\-.]{3,64}$".into());
    }
    Ok(())
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.key)
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({self})")
    }
}
