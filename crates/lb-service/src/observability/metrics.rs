//! Metrics definitions for the balancer.
//!
//! All metrics follow Prometheus naming conventions:
//! - `lb_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `operation`: bounded by code (repository method names)
//! - `status`: 2 values (success, error)
//! - `action`: bounded by the BBB API surface

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus metrics recorder and return the handle for
/// serving the scrape endpoint.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns an error if the recorder fails to install (e.g. already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("lb_db_query".to_string()),
            &[
                0.001, 0.002, 0.005, 0.010, 0.020, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set DB query buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("lb_backend_call".to_string()),
            &[
                0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000,
            ],
        )
        .map_err(|e| format!("Failed to set backend call buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("lb_recording_import".to_string()),
            &[0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0],
        )
        .map_err(|e| format!("Failed to set import buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {e}"))
}

/// Record a repository query.
///
/// Metrics: `lb_db_queries_total`, `lb_db_query_duration_seconds`
pub fn record_db_query(operation: &'static str, status: &'static str, duration: Duration) {
    counter!("lb_db_queries_total", "operation" => operation, "status" => status).increment(1);
    histogram!("lb_db_query_duration_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
}

/// Record a backend BBB API call.
///
/// Metrics: `lb_backend_calls_total`, `lb_backend_call_duration_seconds`
pub fn record_backend_call(action: &'static str, status: &'static str, duration: Duration) {
    counter!("lb_backend_calls_total", "action" => action, "status" => status).increment(1);
    histogram!("lb_backend_call_duration_seconds", "action" => action)
        .record(duration.as_secs_f64());
}

/// Record a recording import outcome.
///
/// Metrics: `lb_recording_imports_total`, `lb_recording_import_duration_seconds`
pub fn record_import(status: &'static str, duration: Duration) {
    counter!("lb_recording_imports_total", "status" => status).increment(1);
    histogram!("lb_recording_import_duration_seconds").record(duration.as_secs_f64());
}

/// Record a webhook forward attempt outcome.
///
/// Metric: `lb_webhook_forwards_total`
pub fn record_webhook(status: &'static str) {
    counter!("lb_webhook_forwards_total", "status" => status).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_helpers_do_not_panic_without_recorder() {
        // With no global recorder installed these are no-ops.
        record_db_query("test_op", "success", Duration::from_millis(5));
        record_backend_call("getMeetings", "error", Duration::from_millis(50));
        record_import("success", Duration::from_secs(1));
        record_webhook("error");
    }
}
