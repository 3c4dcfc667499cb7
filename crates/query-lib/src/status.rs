//! Ingestion statistics read model
//!
//! The write path bumps the counter as it persists samples; the status
//! endpoint only reads it.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Process-wide ingestion counters
#[derive(Debug)]
pub struct IngestStats {
    started_at: Instant,
    metrics_saved: AtomicU64,
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            metrics_saved: AtomicU64::new(0),
        }
    }

    /// Count samples persisted by the write path
    pub fn record_saved(&self, count: u64) {
        self.metrics_saved.fetch_add(count, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.metrics_saved.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn report(&self) -> StatusReport {
        StatusReport::new(self.uptime(), self.total())
    }
}

/// Payload of the status endpoint; every field is pre-formatted text
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub uptime: String,
    pub metrics_per_seconds: String,
    pub total_metrics: String,
}

impl StatusReport {
    pub fn new(uptime: Duration, total: u64) -> Self {
        let secs = uptime.as_secs_f64();
        let rate = if secs > 0.0 { total as f64 / secs } else { 0.0 };

        Self {
            uptime: format_uptime(uptime),
            metrics_per_seconds: format!("{rate:.2}"),
            total_metrics: total.to_string(),
        }
    }
}

/// Render as `1h2m3s`, omitting leading zero units
pub fn format_uptime(uptime: Duration) -> String {
    let total = uptime.as_secs();
    let (hours, minutes, seconds) = (total / 3600, total / 60 % 60, total % 60);

    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_formatting() {
        let report = StatusReport::new(Duration::from_secs(3725), 7450);

        assert_eq!(report.uptime, "1h2m5s");
        assert_eq!(report.metrics_per_seconds, "2.00");
        assert_eq!(report.total_metrics, "7450");
    }

    #[test]
    fn test_zero_uptime_has_zero_rate() {
        let report = StatusReport::new(Duration::ZERO, 10);
        assert_eq!(report.metrics_per_seconds, "0.00");
        assert_eq!(report.uptime, "0s");
    }

    #[test]
    fn test_counter_accumulates() {
        let stats = IngestStats::new();
        stats.record_saved(3);
        stats.record_saved(4);
        assert_eq!(stats.total(), 7);
    }

    #[test]
    fn test_report_serializes_camel_case() {
        let json = serde_json::to_value(StatusReport::new(Duration::from_secs(90), 0)).unwrap();
        assert_eq!(json["uptime"], "1m30s");
        assert!(json.get("metricsPerSeconds").is_some());
        assert!(json.get("totalMetrics").is_some());
    }
}
