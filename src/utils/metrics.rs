use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use serde::Serialize;
use tracing::info;

/// Aggregate counters for a worker fleet run.
///
/// Shared across all workers and the batch writer; logged once at
/// shutdown and available on demand for inspection.
#[derive(Debug)]
pub struct WorkerStats {
    started: Instant,
    processed: AtomicU64,
    succeeded: AtomicU64,
    deduplicated: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    partial: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub runtime_secs: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub deduplicated: u64,
    pub retried: u64,
    pub failed: u64,
    pub partial: u64,
    pub dead_lettered: u64,
    pub success_rate: f64,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            processed: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            partial: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
        }
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// A success whose write was suppressed by the dedup window.
    pub fn record_deduplicated(&self) {
        self.deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_partial(&self) {
        self.partial.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let succeeded = self.succeeded.load(Ordering::Relaxed);

        StatsSnapshot {
            runtime_secs: self.started.elapsed().as_secs(),
            processed,
            succeeded,
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            partial: self.partial.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            success_rate: if processed > 0 {
                (succeeded as f64 / processed as f64) * 100.0
            } else {
                0.0
            },
        }
    }

    /// Final statistics, logged once when the fleet shuts down.
    pub fn log_summary(&self) {
        let snapshot = self.snapshot();

        info!("=== Final statistics ===");
        info!("Runtime: {}s", snapshot.runtime_secs);
        info!("Tasks processed: {}", snapshot.processed);
        info!(
            "Succeeded: {} ({} deduplicated)",
            snapshot.succeeded, snapshot.deduplicated
        );
        info!("Retries scheduled: {}", snapshot.retried);
        info!(
            "Failed: {} (partial: {}, dead-lettered: {})",
            snapshot.failed, snapshot.partial, snapshot.dead_lettered
        );
        if snapshot.processed > 0 {
            info!("Success rate: {:.1}%", snapshot.success_rate);
        }
    }
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = WorkerStats::new();

        for _ in 0..4 {
            stats.record_processed();
        }
        stats.record_success();
        stats.record_success();
        stats.record_deduplicated();
        stats.record_retry();
        stats.record_failed();
        stats.record_partial();
        stats.record_dead_letter();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.processed, 4);
        assert_eq!(snapshot.succeeded, 2);
        assert_eq!(snapshot.deduplicated, 1);
        assert_eq!(snapshot.retried, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.partial, 1);
        assert_eq!(snapshot.dead_lettered, 1);
        assert!((snapshot.success_rate - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_run_has_zero_success_rate() {
        let stats = WorkerStats::new();
        assert_eq!(stats.snapshot().success_rate, 0.0);
    }
}
