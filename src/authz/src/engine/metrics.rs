//! Prometheus-style metrics for authorization checks

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::time::Duration;

use super::decision::{CheckResult, DecisionReason};

/// Engine performance metrics
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    /// Total number of checks
    pub total_checks: u64,

    pub allowed_decisions: u64,

    pub denied_decisions: u64,

    /// Decisions keyed by reason name
    pub decisions_by_reason: BTreeMap<&'static str, u64>,

    pub cache_hits: u64,

    pub cache_misses: u64,

    /// Latency percentiles in microseconds, computed when the snapshot is taken
    pub latency_p50_us: f64,
    pub latency_p90_us: f64,
    pub latency_p99_us: f64,

    pub avg_latency_us: f64,

    /// Evaluation and internal errors
    pub error_count: u64,

    /// Administrative writes applied
    pub admin_writes: u64,

    /// Audit sink failures
    pub audit_failures: u64,
}

impl EngineMetrics {
    /// Calculate cache hit rate
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    /// Calculate allow rate
    pub fn allow_rate(&self) -> f64 {
        let total = self.allowed_decisions + self.denied_decisions;
        if total == 0 {
            0.0
        } else {
            self.allowed_decisions as f64 / total as f64
        }
    }

    pub fn reason_count(&self, reason: DecisionReason) -> u64 {
        self.decisions_by_reason
            .get(reason.as_str())
            .copied()
            .unwrap_or(0)
    }
}

/// Metrics collector
pub struct MetricsCollector {
    metrics: RwLock<EngineMetrics>,

    /// Recent latency samples in microseconds, oldest first
    latency_samples: Mutex<VecDeque<f64>>,

    max_samples: usize,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            metrics: RwLock::new(EngineMetrics::default()),
            latency_samples: Mutex::new(VecDeque::with_capacity(1_024)),
            max_samples: 10_000,
        }
    }

    pub fn record_cache_hit(&self) {
        self.metrics.write().cache_hits += 1;
    }

    pub fn record_cache_miss(&self) {
        self.metrics.write().cache_misses += 1;
    }

    /// Record a check outcome
    pub fn record_decision(&self, result: &CheckResult) {
        let mut metrics = self.metrics.write();
        metrics.total_checks += 1;

        if result.allowed {
            metrics.allowed_decisions += 1;
        } else {
            metrics.denied_decisions += 1;
        }
        if result.reason.is_error() {
            metrics.error_count += 1;
        }
        *metrics
            .decisions_by_reason
            .entry(result.reason.as_str())
            .or_insert(0) += 1;
    }

    /// Record check latency; keeps the newest `max_samples` samples
    pub fn record_latency(&self, latency: Duration) {
        let latency_us = latency.as_nanos() as f64 / 1_000.0;

        let mut samples = self.latency_samples.lock();
        if samples.len() == self.max_samples {
            samples.pop_front();
        }
        samples.push_back(latency_us);
    }

    pub fn record_admin_write(&self) {
        self.metrics.write().admin_writes += 1;
    }

    pub fn record_audit_failure(&self) {
        self.metrics.write().audit_failures += 1;
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> EngineMetrics {
        let mut metrics = self.metrics.read().clone();

        let mut sorted: Vec<f64> = self.latency_samples.lock().iter().copied().collect();
        if !sorted.is_empty() {
            sorted.sort_by(f64::total_cmp);
            metrics.avg_latency_us = sorted.iter().sum::<f64>() / sorted.len() as f64;
            metrics.latency_p50_us = percentile(&sorted, 0.50);
            metrics.latency_p90_us = percentile(&sorted, 0.90);
            metrics.latency_p99_us = percentile(&sorted, 0.99);
        }
        metrics
    }

    pub fn reset(&self) {
        *self.metrics.write() = EngineMetrics::default();
        self.latency_samples.lock().clear();
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let metrics = self.snapshot();
        let mut out = String::new();

        let counters = [
            ("rbac_checks_total", "Total number of authorization checks", metrics.total_checks),
            ("rbac_allowed_total", "Number of allowed decisions", metrics.allowed_decisions),
            ("rbac_denied_total", "Number of denied decisions", metrics.denied_decisions),
            ("rbac_cache_hits_total", "Decision cache hits", metrics.cache_hits),
            ("rbac_cache_misses_total", "Decision cache misses", metrics.cache_misses),
            ("rbac_errors_total", "Evaluation and internal errors", metrics.error_count),
            ("rbac_admin_writes_total", "Administrative writes applied", metrics.admin_writes),
            ("rbac_audit_failures_total", "Audit sink failures", metrics.audit_failures),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {} {}\n# TYPE {} counter\n{} {}\n", name, help, name, name, value);
        }

        let _ = writeln!(out, "# HELP rbac_decisions_total Decisions by reason");
        let _ = writeln!(out, "# TYPE rbac_decisions_total counter");
        for (reason, count) in &metrics.decisions_by_reason {
            let _ = writeln!(out, "rbac_decisions_total{{reason=\"{}\"}} {}", reason, count);
        }
        out.push('\n');

        let _ = writeln!(out, "# HELP rbac_check_latency_seconds Check latency percentiles");
        let _ = writeln!(out, "# TYPE rbac_check_latency_seconds summary");
        for (quantile, value) in [
            ("0.5", metrics.latency_p50_us),
            ("0.9", metrics.latency_p90_us),
            ("0.99", metrics.latency_p99_us),
        ] {
            let _ = writeln!(
                out,
                "rbac_check_latency_seconds{{quantile=\"{}\"}} {}",
                quantile,
                value / 1_000_000.0
            );
        }

        out
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }

    let idx = ((sorted.len() as f64) * p) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_decision() {
        let collector = MetricsCollector::new();

        collector.record_decision(&CheckResult::allow(DecisionReason::PermissionGranted, "p"));
        collector.record_decision(&CheckResult::deny(DecisionReason::UserSuspended));
        collector.record_decision(&CheckResult::deny(DecisionReason::InternalError));

        let metrics = collector.snapshot();
        assert_eq!(metrics.total_checks, 3);
        assert_eq!(metrics.allowed_decisions, 1);
        assert_eq!(metrics.denied_decisions, 2);
        assert_eq!(metrics.error_count, 1);
        assert_eq!(metrics.reason_count(DecisionReason::UserSuspended), 1);
    }

    #[test]
    fn test_record_cache() {
        let collector = MetricsCollector::new();

        collector.record_cache_hit();
        collector.record_cache_hit();
        collector.record_cache_miss();

        let metrics = collector.snapshot();
        assert!((metrics.cache_hit_rate() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_record_latency() {
        let collector = MetricsCollector::new();

        collector.record_latency(Duration::from_micros(50));
        collector.record_latency(Duration::from_micros(100));
        collector.record_latency(Duration::from_micros(150));

        let metrics = collector.snapshot();
        assert!((metrics.avg_latency_us - 100.0).abs() < 1.0);
        assert_eq!(metrics.latency_p50_us, 100.0);
    }

    #[test]
    fn test_latency_window_keeps_newest() {
        let collector = MetricsCollector::new();

        for _ in 0..100 {
            collector.record_latency(Duration::from_micros(1_000));
        }
        for _ in 0..10_000 {
            collector.record_latency(Duration::from_micros(10));
        }

        assert_eq!(collector.latency_samples.lock().len(), 10_000);
        let metrics = collector.snapshot();
        assert_eq!(metrics.latency_p99_us, 10.0);
    }

    #[test]
    fn test_concurrent_latency_recording() {
        let collector = MetricsCollector::new();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..250 {
                        collector.record_latency(Duration::from_micros(20));
                    }
                });
            }
        });

        assert_eq!(collector.latency_samples.lock().len(), 1_000);
        assert_eq!(collector.snapshot().latency_p50_us, 20.0);
    }

    #[test]
    fn test_prometheus_export() {
        let collector = MetricsCollector::new();

        collector.record_decision(&CheckResult::allow(DecisionReason::PermissionGranted, "p"));
        collector.record_latency(Duration::from_micros(5));

        let text = collector.export_prometheus();
        assert!(text.contains("rbac_checks_total 1"));
        assert!(text.contains("rbac_allowed_total 1"));
        assert!(text.contains("rbac_decisions_total{reason=\"permission_granted\"} 1"));
    }

    #[test]
    fn test_reset() {
        let collector = MetricsCollector::new();
        collector.record_decision(&CheckResult::deny(DecisionReason::UserNotFound));
        collector.reset();

        assert_eq!(collector.snapshot().total_checks, 0);
    }
}
