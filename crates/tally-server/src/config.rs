//! Server configuration.
//!
//! Runtime shapes derived from [`TallySettings`]: millisecond fields become
//! [`Duration`]s and a zero keepalive interval becomes `None`.

use std::time::Duration;

use tally_settings::{StreamSettings, TallySettings};
use tracing::warn;

/// Shortest accepted timer period; `tokio::time::interval` rejects zero.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Configuration for the HTTP server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Upper bound on waiting for session tasks during shutdown.
    pub shutdown_timeout: Duration,
    /// Streaming lifecycle configuration.
    pub stream: StreamConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&TallySettings::default())
    }
}

impl From<&TallySettings> for ServerConfig {
    fn from(settings: &TallySettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            shutdown_timeout: Duration::from_millis(settings.server.shutdown_timeout_ms),
            stream: StreamConfig::from(&settings.stream),
        }
    }
}

/// Configuration for the streaming connection lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    /// Maximum concurrently admitted sessions.
    pub max_connections: usize,
    /// Per-session outbound queue depth.
    pub queue_capacity: usize,
    /// Consecutive drops before a subscriber is force-closed.
    pub max_consecutive_drops: u32,
    /// Silence tolerated before a session is closed as a zombie.
    pub idle_timeout: Duration,
    /// Idle check period.
    pub detection_interval: Duration,
    /// Keepalive period, if enabled.
    pub keepalive_interval: Option<Duration>,
    /// Upper bound on one transport write.
    pub write_timeout: Duration,
}

impl StreamConfig {
    /// Clamp values the lifecycle core cannot run with.
    ///
    /// Timer periods and the write bound are at least 1ms, queue depth and
    /// drop threshold at least 1. A keepalive that is not shorter than the
    /// idle timeout is lowered to half of it, so a quiet but healthy stream
    /// is never idled out.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        self.detection_interval = self.detection_interval.max(MIN_PERIOD);
        self.write_timeout = self.write_timeout.max(MIN_PERIOD);
        self.queue_capacity = self.queue_capacity.max(1);
        self.max_consecutive_drops = self.max_consecutive_drops.max(1);
        self.keepalive_interval = match self.keepalive_interval {
            Some(period) if period.is_zero() => None,
            Some(period) if period >= self.idle_timeout => {
                let lowered = (self.idle_timeout / 2).max(MIN_PERIOD);
                warn!(
                    keepalive = ?period,
                    idle_timeout = ?self.idle_timeout,
                    lowered = ?lowered,
                    "keepalive not shorter than idle timeout, lowering"
                );
                Some(lowered)
            }
            other => other,
        };
        self
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::from(&StreamSettings::default())
    }
}

impl From<&StreamSettings> for StreamConfig {
    fn from(settings: &StreamSettings) -> Self {
        Self {
            max_connections: settings.max_connections,
            queue_capacity: settings.queue_capacity,
            max_consecutive_drops: settings.max_consecutive_drops,
            idle_timeout: Duration::from_millis(settings.idle_timeout_ms),
            detection_interval: Duration::from_millis(settings.detection_interval_ms),
            keepalive_interval: (settings.keepalive_interval_ms > 0)
                .then(|| Duration::from_millis(settings.keepalive_interval_ms)),
            write_timeout: Duration::from_millis(settings.write_timeout_ms),
        }
    }
}
