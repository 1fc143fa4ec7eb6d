//! Prometheus metrics for the relay.

use prometheus::{
    register_int_counter_vec, register_int_gauge, Encoder, IntCounterVec, IntGauge, TextEncoder,
};
use std::sync::OnceLock;

/// Container for all application metrics.
pub struct Metrics {
    /// Requests by client protocol, backend protocol and final status
    pub request_count: IntCounterVec,

    /// Quota-triggered failovers by model
    pub failovers: IntCounterVec,

    /// Credentials flagged quota-exceeded, by credential and model
    pub quota_flags: IntCounterVec,

    /// Tool results or calls dropped while pairing a transcript
    pub dropped_tool_items: IntCounterVec,

    /// Streams currently being bridged
    pub active_streams: IntGauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialize the metrics registry.
///
/// Subsequent calls return the same instance.
pub fn init_metrics() -> &'static Metrics {
    METRICS.get_or_init(|| Metrics {
        request_count: register_int_counter_vec!(
            "llm_relay_requests_total",
            "Total number of relayed requests",
            &["client_protocol", "backend_protocol", "status_code"]
        )
        .expect("Failed to register request_count metric"),
        failovers: register_int_counter_vec!(
            "llm_relay_failovers_total",
            "Quota-triggered credential failovers",
            &["model"]
        )
        .expect("Failed to register failovers metric"),
        quota_flags: register_int_counter_vec!(
            "llm_relay_quota_flags_total",
            "Credentials marked quota-exceeded",
            &["credential", "model"]
        )
        .expect("Failed to register quota_flags metric"),
        dropped_tool_items: register_int_counter_vec!(
            "llm_relay_dropped_tool_items_total",
            "Unmatched tool calls or results dropped during translation",
            &["kind"]
        )
        .expect("Failed to register dropped_tool_items metric"),
        active_streams: register_int_gauge!(
            "llm_relay_active_streams",
            "Streams currently being bridged"
        )
        .expect("Failed to register active_streams metric"),
    })
}

/// Get the metrics instance, initializing it on first use.
pub fn get_metrics() -> &'static Metrics {
    init_metrics()
}

/// Render every registered metric in the Prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_idempotent() {
        let a = init_metrics() as *const Metrics;
        let b = get_metrics() as *const Metrics;
        assert_eq!(a, b);
    }

    #[test]
    fn test_render_contains_counters() {
        get_metrics()
            .failovers
            .with_label_values(&["metrics-test-model"])
            .inc();
        let text = render();
        assert!(text.contains("llm_relay_failovers_total"));
    }
}
