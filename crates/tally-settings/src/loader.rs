//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TallySettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `TALLY_*` environment variable overrides (highest priority)
//! 4. Validate cross-field constraints
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tally_core::logging::LogFormat;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::TallySettings;

/// Resolve the default settings file (`~/.tally/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tally").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TallySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults (plus env overrides). If
/// the file contains invalid JSON or the result fails validation, returns
/// an error.
pub fn load_settings_from_path(path: &Path) -> Result<TallySettings> {
    let defaults = serde_json::to_value(TallySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: TallySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Reject settings the lifecycle core cannot run with.
pub fn validate(settings: &TallySettings) -> Result<()> {
    let stream = &settings.stream;
    if stream.queue_capacity == 0 {
        return Err(SettingsError::InvalidValue(
            "stream.queueCapacity must be at least 1".into(),
        ));
    }
    if stream.max_connections == 0 {
        return Err(SettingsError::InvalidValue(
            "stream.maxConnections must be at least 1".into(),
        ));
    }
    if stream.max_consecutive_drops == 0 {
        return Err(SettingsError::InvalidValue(
            "stream.maxConsecutiveDrops must be at least 1".into(),
        ));
    }
    if stream.detection_interval_ms == 0 || stream.write_timeout_ms == 0 {
        return Err(SettingsError::InvalidValue(
            "stream.detectionIntervalMs and stream.writeTimeoutMs must be positive".into(),
        ));
    }
    if stream.idle_timeout_ms < stream.detection_interval_ms {
        return Err(SettingsError::InvalidValue(format!(
            "stream.idleTimeoutMs ({}) must not be shorter than stream.detectionIntervalMs ({})",
            stream.idle_timeout_ms, stream.detection_interval_ms
        )));
    }
    if stream.keepalive_interval_ms != 0 && stream.keepalive_interval_ms >= stream.idle_timeout_ms
    {
        return Err(SettingsError::InvalidValue(format!(
            "stream.keepaliveIntervalMs ({}) must be shorter than stream.idleTimeoutMs ({}), or 0 to disable",
            stream.keepalive_interval_ms, stream.idle_timeout_ms
        )));
    }
    Ok(())
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_env_overrides(settings: &mut TallySettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup` instead of the process environment.
pub fn apply_overrides_from(
    settings: &mut TallySettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("TALLY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("TALLY_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.u64("TALLY_SHUTDOWN_TIMEOUT_MS", 100, 600_000) {
        settings.server.shutdown_timeout_ms = v;
    }

    // ── Stream lifecycle ────────────────────────────────────────────
    if let Some(v) = env.usize("TALLY_MAX_CONNECTIONS", 1, 10_000_000) {
        settings.stream.max_connections = v;
    }
    if let Some(v) = env.usize("TALLY_QUEUE_CAPACITY", 1, 65_536) {
        settings.stream.queue_capacity = v;
    }
    if let Some(v) = env.u64("TALLY_MAX_CONSECUTIVE_DROPS", 1, 1_000_000) {
        settings.stream.max_consecutive_drops = u32::try_from(v).unwrap_or(u32::MAX);
    }
    if let Some(v) = env.u64("TALLY_IDLE_TIMEOUT_MS", 100, 86_400_000) {
        settings.stream.idle_timeout_ms = v;
    }
    if let Some(v) = env.u64("TALLY_DETECTION_INTERVAL_MS", 10, 600_000) {
        settings.stream.detection_interval_ms = v;
    }
    if let Some(v) = env.u64("TALLY_KEEPALIVE_INTERVAL_MS", 0, 3_600_000) {
        settings.stream.keepalive_interval_ms = v;
    }
    if let Some(v) = env.u64("TALLY_WRITE_TIMEOUT_MS", 10, 600_000) {
        settings.stream.write_timeout_ms = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("TALLY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.string("TALLY_LOG_FORMAT") {
        match LogFormat::parse(&v) {
            Some(format) => settings.logging.format = format,
            None => tracing::warn!(key = "TALLY_LOG_FORMAT", value = %v, "invalid log format, ignoring"),
        }
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = (self.lookup)(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = (self.lookup)(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
