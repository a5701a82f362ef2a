//! Session worker: drains one session's queue onto its transport.
//!
//! The worker is the only writer on the transport. However it exits
//! (peer gone, write failure, cancellation, panic, abort) the teardown guard
//! routes through the coordinator's single close path.

use std::sync::Arc;

use tally_core::Frame;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, instrument, warn};

use crate::config::StreamConfig;

use super::coordinator::LifecycleCoordinator;
use super::errors::StreamError;
use super::liveness::guarded_write;
use super::session::{CloseReason, Session};
use super::transport::Transport;

/// Closes the session when dropped, with whatever reason was recorded last.
struct TeardownGuard {
    coordinator: Arc<LifecycleCoordinator>,
    session: Arc<Session>,
    reason: CloseReason,
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        let _ = self.coordinator.close(&self.session, self.reason);
    }
}

/// Run a session until it closes.
#[instrument(skip_all, fields(session_id = %session.id(), topic = %session.topic()))]
pub(crate) async fn run_session<T: Transport>(
    coordinator: Arc<LifecycleCoordinator>,
    session: Arc<Session>,
    transport: T,
) {
    let config = coordinator.config().clone();
    let mut guard = TeardownGuard {
        coordinator,
        session: Arc::clone(&session),
        reason: CloseReason::Aborted,
    };
    let outcome = drive(&session, &transport, &config).await;
    drop(transport);
    match outcome {
        Ok(reason) => guard.reason = reason,
        Err(error) => {
            guard.reason = CloseReason::from(&error);
            let _ = guard.coordinator.fail(&session, error);
        }
    }
    debug!(reason = guard.reason.as_str(), "session worker exiting");
    drop(guard);
}

/// Returns the close reason for an orderly exit, or the error that ended the
/// stream.
async fn drive<T: Transport>(
    session: &Session,
    transport: &T,
    config: &StreamConfig,
) -> Result<CloseReason, StreamError> {
    let cancel = session.cancel_token().clone();
    let mut keepalive = config.keepalive_interval.map(|period| {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(closing_reason(session)),
            () = transport.closed() => return Ok(CloseReason::ClientClosed),
            event = session.queue().pop() => match event {
                Some(event) => Frame::event(&event),
                None => return Ok(closing_reason(session)),
            },
            () = next_keepalive(keepalive.as_mut()) => Frame::keepalive(),
        };

        let written = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(closing_reason(session)),
            result = guarded_write(session, transport, frame, config.write_timeout) => result,
        };
        if let Err(error) = written {
            warn!(%error, "write failed, closing session");
            return Err(error.into());
        }
        // Keepalives only fill silence.
        if let Some(interval) = keepalive.as_mut() {
            interval.reset();
        }
    }
}

fn closing_reason(session: &Session) -> CloseReason {
    session.close_reason().unwrap_or(CloseReason::Explicit)
}

async fn next_keepalive(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            let _ = interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
