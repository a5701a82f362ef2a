//! Core error types.

use thiserror::Error;

/// Why a namespace or key was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    /// The namespace segment failed validation.
    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),
    /// The key segment failed validation.
    #[error("invalid key: {0}")]
    InvalidKey(String),
}
