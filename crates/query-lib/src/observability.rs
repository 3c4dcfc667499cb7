//! Observability infrastructure for the query service
//!
//! Provides:
//! - Prometheus metrics (store latency by query mode, rejected requests, store failures, skipped rows)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder, HistogramVec,
    IntCounter, IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for store latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<QueryMetricsInner> = OnceLock::new();

struct QueryMetricsInner {
    store_latency_seconds: HistogramVec,
    requests_rejected: IntCounterVec,
    store_failures: IntCounter,
    rows_skipped: IntCounter,
}

impl QueryMetricsInner {
    fn new() -> Self {
        Self {
            store_latency_seconds: register_histogram_vec!(
                "query_store_latency_seconds",
                "Time spent waiting on the metrics store",
                &["mode"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register store_latency_seconds"),

            requests_rejected: register_int_counter_vec!(
                "query_requests_rejected_total",
                "Requests rejected for invalid input",
                &["reason"]
            )
            .expect("Failed to register requests_rejected"),

            store_failures: register_int_counter!(
                "query_store_failures_total",
                "Store calls that failed or timed out"
            )
            .expect("Failed to register store_failures"),

            rows_skipped: register_int_counter!(
                "query_rows_skipped_total",
                "Result rows skipped because they could not be decoded"
            )
            .expect("Failed to register rows_skipped"),
        }
    }
}

/// Query service metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct QueryMetrics {
    _private: (),
}

impl Default for QueryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(QueryMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &QueryMetricsInner {
        GLOBAL_METRICS.get_or_init(QueryMetricsInner::new)
    }

    /// Record how long a store call took
    pub fn observe_store_latency(&self, mode: &str, duration_secs: f64) {
        self.inner()
            .store_latency_seconds
            .with_label_values(&[mode])
            .observe(duration_secs);
    }

    pub fn inc_rejected(&self, reason: &str) {
        self.inner().requests_rejected.with_label_values(&[reason]).inc();
    }

    pub fn inc_store_failures(&self) {
        self.inner().store_failures.inc();
    }

    pub fn add_rows_skipped(&self, count: u64) {
        self.inner().rows_skipped.inc_by(count);
    }

    pub fn rows_skipped(&self) -> u64 {
        self.inner().rows_skipped.get()
    }

    pub fn store_failures(&self) -> u64 {
        self.inner().store_failures.get()
    }

    /// Render the default registry in the Prometheus text format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Structured logger for query service events
///
/// Every record carries an `event` field so log pipelines can filter on it.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_startup(&self, version: &str, listen: &str, store: &str) {
        info!(
            event = "server_started",
            instance = %self.instance,
            version = %version,
            listen = %listen,
            store = %store,
            "Query server started"
        );
    }

    /// Log a request rejected for invalid input
    pub fn log_request_rejected(&self, operation: &str, reason: &str) {
        info!(
            event = "request_rejected",
            instance = %self.instance,
            operation = %operation,
            reason = %reason,
            "Request rejected"
        );
    }

    /// Log a store failure; the cause never reaches the client
    pub fn log_store_failure(&self, operation: &str, error: &str) {
        warn!(
            event = "store_failure",
            instance = %self.instance,
            operation = %operation,
            error = %error,
            "Metrics store call failed"
        );
    }

    pub fn log_row_skipped(&self, operation: &str, error: &str) {
        warn!(
            event = "row_skipped",
            instance = %self.instance,
            operation = %operation,
            error = %error,
            "Skipping undecodable row"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "server_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Query server shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_metrics_counters() {
        // The registry is process-global, so only assert on deltas
        let metrics = QueryMetrics::new();
        let before = metrics.rows_skipped();

        metrics.add_rows_skipped(2);
        metrics.observe_store_latency("snapshot", 0.004);
        metrics.inc_rejected("invalid_scope");

        assert!(metrics.rows_skipped() >= before + 2);
    }

    #[test]
    fn test_render_contains_registered_metrics() {
        let metrics = QueryMetrics::new();
        metrics.inc_store_failures();

        let text = metrics.render();
        assert!(text.contains("query_store_failures_total"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("query-server");
        assert_eq!(logger.instance, "query-server");
    }
}
