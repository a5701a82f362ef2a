//! Settings type definitions.
//!
//! Field names are camelCase on the wire. Every section is
//! `#[serde(default)]` so a settings file only needs the values it changes.

use serde::{Deserialize, Serialize};
use tally_core::logging::LogFormat;

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9090 },
///   "stream": { "idleTimeoutMs": 30000 }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TallySettings {
    /// HTTP listener settings.
    pub server: ServerSettings,
    /// Streaming connection lifecycle settings.
    pub stream: StreamSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

/// HTTP listener settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Upper bound on graceful shutdown before remaining tasks are abandoned.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            shutdown_timeout_ms: 10_000,
        }
    }
}

/// Streaming connection lifecycle settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    /// Maximum concurrently open streams.
    pub max_connections: usize,
    /// Per-session outbound queue depth.
    pub queue_capacity: usize,
    /// Consecutive full-queue drops before a session is force-closed.
    pub max_consecutive_drops: u32,
    /// Silence (no successful write) tolerated before a session is a zombie.
    pub idle_timeout_ms: u64,
    /// How often the idle watcher checks a session.
    pub detection_interval_ms: u64,
    /// Keepalive comment interval; `0` disables keepalives.
    pub keepalive_interval_ms: u64,
    /// Upper bound on a single transport write.
    pub write_timeout_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
            queue_capacity: 10,
            max_consecutive_drops: 32,
            idle_timeout_ms: 60_000,
            detection_interval_ms: 1_000,
            keepalive_interval_ms: 15_000,
            write_timeout_ms: 1_000,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}
