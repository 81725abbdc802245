//! Execution metrics.
//!
//! Every counter is an atomic, so recording never blocks the execution path
//! and snapshots never block recording. A snapshot is assembled from
//! individual loads and may straddle a concurrent update by one call.
//!
//! Latency is tracked two ways:
//!
//! 1. **Mean**: cumulative time divided by cumulative count
//! 2. **Rolling average**: an exponentially weighted moving average that
//!    follows recent behaviour (alpha 0.2, seeded by the first sample)

use crate::error::ErrorKind;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use utoipa::ToSchema;

/// Weight of the newest sample in the rolling average.
const EWMA_ALPHA: f64 = 0.2;

/// Failure rate above which a snapshot raises an alert.
const FAILURE_RATE_ALERT: f64 = 0.2;

/// Executions needed before the failure rate alert can fire.
const FAILURE_RATE_MIN_SAMPLES: u64 = 10;

/// Bit pattern marking the rolling average as unseeded.
const UNSEEDED: u64 = u64::MAX;

/// Lock-free aggregate of every completed execution.
pub struct MetricsCollector {
    total: AtomicU64,
    success: AtomicU64,
    failure: AtomicU64,
    total_time_us: AtomicU64,
    min_time_us: AtomicU64,
    max_time_us: AtomicU64,
    rolling_avg_bits: AtomicU64,
    by_kind: [AtomicU64; ErrorKind::ALL.len()],
    pool_waits: AtomicU64,
    pool_wait_total_us: AtomicU64,
    retries: AtomicU64,
    active: AtomicUsize,
    started: Instant,
}

/// Point-in-time metrics view.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    /// success / total, 1.0 before the first execution.
    pub success_rate: f64,
    /// Cumulative mean.
    pub mean_execution_time_ms: f64,
    /// Exponentially weighted recent average.
    pub rolling_avg_execution_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_execution_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_execution_time_ms: Option<f64>,
    /// Failures keyed by error kind. Kinds never seen are omitted.
    pub errors_by_kind: BTreeMap<String, u64>,
    pub pool_waits: u64,
    pub avg_pool_wait_ms: f64,
    pub active_executions: usize,
    pub retries: u64,
    pub uptime_secs: u64,
    pub alerts: Vec<String>,
}

/// Decrements the active execution gauge when dropped.
pub struct ActiveExecution<'a> {
    metrics: &'a MetricsCollector,
}

impl Drop for ActiveExecution<'_> {
    fn drop(&mut self) {
        self.metrics.active.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
            total_time_us: AtomicU64::new(0),
            min_time_us: AtomicU64::new(u64::MAX),
            max_time_us: AtomicU64::new(0),
            rolling_avg_bits: AtomicU64::new(UNSEEDED),
            by_kind: std::array::from_fn(|_| AtomicU64::new(0)),
            pool_waits: AtomicU64::new(0),
            pool_wait_total_us: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    /// Count one completed execution. `error` is `None` on success.
    pub fn record(&self, elapsed: Duration, error: Option<ErrorKind>) {
        let us = elapsed.as_micros().min(u64::MAX as u128) as u64;

        self.total.fetch_add(1, Ordering::Relaxed);
        match error {
            None => {
                self.success.fetch_add(1, Ordering::Relaxed);
            }
            Some(kind) => {
                self.failure.fetch_add(1, Ordering::Relaxed);
                self.by_kind[kind.index()].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.total_time_us.fetch_add(us, Ordering::Relaxed);
        self.min_time_us.fetch_min(us, Ordering::Relaxed);
        self.max_time_us.fetch_max(us, Ordering::Relaxed);
        self.update_rolling_avg(us as f64 / 1000.0);
    }

    fn update_rolling_avg(&self, sample_ms: f64) {
        let mut current = self.rolling_avg_bits.load(Ordering::Relaxed);
        loop {
            let next = if current == UNSEEDED {
                sample_ms
            } else {
                let avg = f64::from_bits(current);
                avg + EWMA_ALPHA * (sample_ms - avg)
            };
            match self.rolling_avg_bits.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Count time spent waiting for a worker.
    pub fn record_pool_wait(&self, waited: Duration) {
        self.pool_waits.fetch_add(1, Ordering::Relaxed);
        self.pool_wait_total_us.fetch_add(
            waited.as_micros().min(u64::MAX as u128) as u64,
            Ordering::Relaxed,
        );
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark an execution as in flight until the guard is dropped.
    pub fn start_execution(&self) -> ActiveExecution<'_> {
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveExecution { metrics: self }
    }

    pub fn total_executions(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn success_rate(&self) -> f64 {
        ratio(
            self.success.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
        .unwrap_or(1.0)
    }

    /// Rolling average latency, 0.0 before the first execution.
    pub fn rolling_avg_ms(&self) -> f64 {
        match self.rolling_avg_bits.load(Ordering::Relaxed) {
            UNSEEDED => 0.0,
            bits => f64::from_bits(bits),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let success = self.success.load(Ordering::Relaxed);
        let failure = self.failure.load(Ordering::Relaxed);
        let total_us = self.total_time_us.load(Ordering::Relaxed);
        let min_us = self.min_time_us.load(Ordering::Relaxed);
        let max_us = self.max_time_us.load(Ordering::Relaxed);
        let waits = self.pool_waits.load(Ordering::Relaxed);
        let wait_us = self.pool_wait_total_us.load(Ordering::Relaxed);

        let errors_by_kind = ErrorKind::ALL
            .iter()
            .filter_map(|kind| {
                let count = self.by_kind[kind.index()].load(Ordering::Relaxed);
                (count > 0).then(|| (kind.as_str().to_string(), count))
            })
            .collect();

        let success_rate = ratio(success, total).unwrap_or(1.0);
        let mut alerts = Vec::new();
        if total >= FAILURE_RATE_MIN_SAMPLES && 1.0 - success_rate > FAILURE_RATE_ALERT {
            alerts.push(format!(
                "High failure rate: {:.1}% of {} executions failed",
                (1.0 - success_rate) * 100.0,
                total
            ));
        }

        MetricsSnapshot {
            total_executions: total,
            successful_executions: success,
            failed_executions: failure,
            success_rate,
            mean_execution_time_ms: ratio(total_us, total).unwrap_or(0.0) / 1000.0,
            rolling_avg_execution_time_ms: self.rolling_avg_ms(),
            min_execution_time_ms: (min_us != u64::MAX).then(|| min_us as f64 / 1000.0),
            max_execution_time_ms: (total > 0).then(|| max_us as f64 / 1000.0),
            errors_by_kind,
            pool_waits: waits,
            avg_pool_wait_ms: ratio(wait_us, waits).unwrap_or(0.0) / 1000.0,
            active_executions: self.active.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs(),
            alerts,
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> Option<f64> {
    (denominator > 0).then(|| numerator as f64 / denominator as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_empty_snapshot() {
        let metrics = MetricsCollector::new();
        let snap = metrics.snapshot();
        assert_eq!(snap.total_executions, 0);
        assert_eq!(snap.success_rate, 1.0);
        assert_eq!(snap.mean_execution_time_ms, 0.0);
        assert_eq!(snap.rolling_avg_execution_time_ms, 0.0);
        assert!(snap.min_execution_time_ms.is_none());
        assert!(snap.max_execution_time_ms.is_none());
        assert!(snap.errors_by_kind.is_empty());
        assert!(snap.alerts.is_empty());
    }

    #[test]
    fn test_failures_count_toward_total_not_success() {
        let metrics = MetricsCollector::new();
        metrics.record(ms(10), None);
        metrics.record(ms(20), Some(ErrorKind::Timeout));
        metrics.record(ms(30), Some(ErrorKind::ExecutionError));
        metrics.record(ms(40), None);

        let snap = metrics.snapshot();
        assert_eq!(snap.total_executions, 4);
        assert_eq!(snap.successful_executions, 2);
        assert_eq!(snap.failed_executions, 2);
        assert_eq!(snap.success_rate, 0.5);
        assert_eq!(snap.errors_by_kind["Timeout"], 1);
        assert_eq!(snap.errors_by_kind["ExecutionError"], 1);
        assert!(!snap.errors_by_kind.contains_key("WorkerCrashed"));
    }

    #[test]
    fn test_mean_min_max() {
        let metrics = MetricsCollector::new();
        for n in [10, 20, 30] {
            metrics.record(ms(n), None);
        }
        let snap = metrics.snapshot();
        assert!((snap.mean_execution_time_ms - 20.0).abs() < 1e-9);
        assert_eq!(snap.min_execution_time_ms, Some(10.0));
        assert_eq!(snap.max_execution_time_ms, Some(30.0));
    }

    #[test]
    fn test_rolling_average_seeded_then_weighted() {
        let metrics = MetricsCollector::new();
        metrics.record(ms(100), None);
        assert!((metrics.rolling_avg_ms() - 100.0).abs() < 1e-9);
        metrics.record(ms(200), None);
        // 100 + 0.2 * (200 - 100)
        assert!((metrics.rolling_avg_ms() - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_hundred_successes() {
        let metrics = MetricsCollector::new();
        for _ in 0..100 {
            metrics.record(ms(1), None);
        }
        assert_eq!(metrics.total_executions(), 100);
        assert_eq!(metrics.success_rate(), 1.0);
    }

    #[test]
    fn test_concurrent_recording() {
        let metrics = Arc::new(MetricsCollector::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let metrics = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..250 {
                        let error = (i % 2 == 1).then_some(ErrorKind::ProtocolError);
                        metrics.record(ms(2), error);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.total_executions, 2000);
        assert_eq!(snap.successful_executions, 1000);
        assert_eq!(snap.errors_by_kind["ProtocolError"], 1000);
        assert!((snap.rolling_avg_execution_time_ms - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_failure_rate_alert() {
        let metrics = MetricsCollector::new();
        for _ in 0..7 {
            metrics.record(ms(1), None);
        }
        for _ in 0..3 {
            metrics.record(ms(1), Some(ErrorKind::WorkerCrashed));
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.alerts.len(), 1);
        assert!(snap.alerts[0].contains("30.0%"));
    }

    #[test]
    fn test_active_execution_guard() {
        let metrics = MetricsCollector::new();
        {
            let _a = metrics.start_execution();
            let _b = metrics.start_execution();
            assert_eq!(metrics.snapshot().active_executions, 2);
        }
        assert_eq!(metrics.snapshot().active_executions, 0);
    }

    #[test]
    fn test_pool_wait_average() {
        let metrics = MetricsCollector::new();
        metrics.record_pool_wait(ms(4));
        metrics.record_pool_wait(ms(8));
        metrics.record_retry();
        let snap = metrics.snapshot();
        assert_eq!(snap.pool_waits, 2);
        assert!((snap.avg_pool_wait_ms - 6.0).abs() < 1e-9);
        assert_eq!(snap.retries, 1);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let metrics = MetricsCollector::new();
        metrics.record(ms(5), None);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["totalExecutions"], 1);
        assert_eq!(json["successRate"], 1.0);
        assert!(json.get("rollingAvgExecutionTimeMs").is_some());
    }
}
