//! Zombie detection and bounded writes.
//!
//! A session is alive while writes succeed. The idle watcher closes sessions
//! that go silent; `guarded_write` bounds every write so a stuck peer turns
//! into an error instead of a hung task.

use std::sync::Arc;
use std::time::Duration;

use tally_core::Frame;
use tokio::time::{self, MissedTickBehavior};

use super::errors::TransportError;
use super::session::Session;
use super::transport::Transport;

/// Outcome of the idle watch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessResult {
    /// No successful write within the idle bound.
    TimedOut,
    /// The session began teardown for another reason.
    Cancelled,
}

/// Watch a session until it goes idle or starts closing.
///
/// Checks every `interval` (at least 1ms). A session with no successful
/// write for `idle_timeout` is reported as `TimedOut`, so detection lags the
/// bound by at most one interval.
pub async fn run_idle_watch(
    session: Arc<Session>,
    interval: Duration,
    idle_timeout: Duration,
) -> LivenessResult {
    let mut check = time::interval(interval.max(Duration::from_millis(1)));
    check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let cancel = session.cancel_token().clone();

    loop {
        tokio::select! {
            () = cancel.cancelled() => return LivenessResult::Cancelled,
            _ = check.tick() => {
                if session.idle_for() >= idle_timeout {
                    return LivenessResult::TimedOut;
                }
            }
        }
    }
}

/// Write one frame within `write_timeout`, refreshing liveness on success.
pub async fn guarded_write<T: Transport + ?Sized>(
    session: &Session,
    transport: &T,
    frame: Frame,
    write_timeout: Duration,
) -> Result<(), TransportError> {
    match time::timeout(write_timeout, transport.write(frame)).await {
        Ok(Ok(())) => {
            session.record_write();
            Ok(())
        }
        Ok(Err(error)) => Err(error),
        Err(_) => Err(TransportError::Timeout(write_timeout)),
    }
}
