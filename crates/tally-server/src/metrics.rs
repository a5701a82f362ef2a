//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Fails if a global recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// Counter hits total (counter).
pub const COUNTER_HITS_TOTAL: &str = "counter_hits_total";
/// Stream sessions opened total (counter).
pub const STREAM_SESSIONS_OPENED_TOTAL: &str = "stream_sessions_opened_total";
/// Stream sessions closed total (counter, labels: reason).
pub const STREAM_SESSIONS_CLOSED_TOTAL: &str = "stream_sessions_closed_total";
/// Active stream sessions (gauge).
pub const STREAM_SESSIONS_ACTIVE: &str = "stream_sessions_active";
/// Stream sessions rejected at admission (counter, labels: cause).
pub const STREAM_SESSIONS_REJECTED_TOTAL: &str = "stream_sessions_rejected_total";
/// Stream session lifetime seconds (histogram).
pub const STREAM_SESSION_DURATION_SECONDS: &str = "stream_session_duration_seconds";
/// Events published to the broadcaster (counter).
pub const STREAM_EVENTS_PUBLISHED_TOTAL: &str = "stream_events_published_total";
/// Per-subscriber event drops due to full queues (counter).
pub const STREAM_BROADCAST_DROPS_TOTAL: &str = "stream_broadcast_drops_total";
/// Sessions force-closed by the server (counter, labels: reason).
pub const STREAM_FORCED_CLOSURES_TOTAL: &str = "stream_forced_closures_total";
/// Registry/session-table disagreements detected (counter).
pub const STREAM_REGISTRY_INCONSISTENCIES_TOTAL: &str = "stream_registry_inconsistencies_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_and_render() {
        // Build a recorder + handle (no global install to avoid test conflicts).
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            COUNTER_HITS_TOTAL,
            STREAM_SESSIONS_OPENED_TOTAL,
            STREAM_SESSIONS_CLOSED_TOTAL,
            STREAM_SESSIONS_ACTIVE,
            STREAM_SESSIONS_REJECTED_TOTAL,
            STREAM_SESSION_DURATION_SECONDS,
            STREAM_EVENTS_PUBLISHED_TOTAL,
            STREAM_BROADCAST_DROPS_TOTAL,
            STREAM_FORCED_CLOSURES_TOTAL,
            STREAM_REGISTRY_INCONSISTENCIES_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
