//! Stream lifecycle error taxonomy.
//!
//! Transport, liveness, backpressure, and registry errors are handled inside
//! the owning session's teardown path: the error picks the session's close
//! reason and is kept as its failure. Only admission failures (`open`) reach
//! callers.

use std::time::Duration;

use thiserror::Error;

/// A write or read on a client transport failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer is gone (reset, broken pipe, body dropped).
    #[error("peer closed the stream")]
    Closed,
    /// A single write did not complete within the write bound.
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
    /// Any other I/O failure.
    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Errors surfaced by the lifecycle core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// Write/read failure on the client transport.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// No successful write or keepalive within the idle bound.
    #[error("no activity for {0:?}")]
    IdleTimeout(Duration),
    /// Subscriber queue was full; the event was dropped for that subscriber.
    #[error("outbound queue full, event dropped")]
    BackpressureDrop,
    /// Internal invariant violated between sessions and the registry.
    #[error("registry inconsistency: {0}")]
    RegistryInconsistency(String),
    /// The connection cap is reached.
    #[error("connection limit reached ({max})")]
    CapacityExceeded {
        /// Configured cap.
        max: usize,
    },
    /// Shutdown has started; no new sessions are admitted.
    #[error("server is shutting down")]
    ShuttingDown,
    /// A concurrent close claimed the session before it finished opening.
    #[error("session closed while opening")]
    SessionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_is_transparent() {
        let err: StreamError = TransportError::Closed.into();
        assert_eq!(err.to_string(), "peer closed the stream");
    }

    #[test]
    fn timeout_display() {
        let err = TransportError::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "write timed out after 250ms");
    }

    #[test]
    fn capacity_display() {
        let err = StreamError::CapacityExceeded { max: 5 };
        assert_eq!(err.to_string(), "connection limit reached (5)");
    }
}
