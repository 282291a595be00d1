use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use crate::crawler::error::CrawlError;
use crate::crawler::task::{CrawlLogEntry, CrawlTask, DeadLetterEntry, FailureEvent, LogStatus};
use crate::storage::dedup::DedupGuard;
use crate::storage::queue::TaskQueue;
use crate::storage::store::PgStore;
use crate::utils::metrics::WorkerStats;

/// Bounded exponential backoff with an enlarged factor for anti-bot
/// blocks.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(60),
        }
    }
}

/// What to do with a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue after the given backoff, same priority.
    Retry { delay: Duration },
    /// Route to the dead-letter queue; the task never re-enters the
    /// normal queue.
    Dead,
}

impl RetryPolicy {
    /// Backoff for the attempt that just failed: `base × 2^retry_count`,
    /// times the error's multiplier (×3 for Blocked).
    pub fn backoff(&self, error: &CrawlError, retry_count: u32) -> Duration {
        // Cap the shift; retry counts are bounded at 3 anyway
        let exponent = retry_count.min(16);
        self.base_delay * 2u32.pow(exponent) * error.backoff_multiplier()
    }

    pub fn decide(&self, retry_count: u32, error: &CrawlError) -> RetryDecision {
        if error.is_retryable() && retry_count < self.max_retries {
            RetryDecision::Retry {
                delay: self.backoff(error, retry_count),
            }
        } else {
            RetryDecision::Dead
        }
    }
}

/// Routes failed attempts: records the attempt log, then either parks
/// the task for a delayed retry or moves it to the dead-letter queue and
/// publishes the terminal failure event.
pub struct RetryManager {
    queue: Arc<TaskQueue>,
    store: Arc<PgStore>,
    dedup: Arc<DedupGuard>,
    policy: RetryPolicy,
    stats: Arc<WorkerStats>,
}

impl RetryManager {
    pub fn new(
        queue: Arc<TaskQueue>,
        store: Arc<PgStore>,
        dedup: Arc<DedupGuard>,
        policy: RetryPolicy,
        stats: Arc<WorkerStats>,
    ) -> Self {
        Self {
            queue,
            store,
            dedup,
            policy,
            stats,
        }
    }

    /// Handle one failed attempt. Exactly one crawl-log row is written
    /// per attempt; a failure event is published only on the terminal
    /// transition.
    pub async fn handle_failure(
        &self,
        mut task: CrawlTask,
        cause: &CrawlError,
        execution_time_ms: u64,
        worker_id: &str,
    ) -> Result<RetryDecision> {
        self.store.spawn_insert_log(CrawlLogEntry {
            product_id: task.product_id,
            platform: task.platform,
            url: task.url.clone(),
            status: cause.log_status(),
            error_message: Some(cause.to_string()),
            execution_time_ms,
            created_at: Utc::now(),
        });

        // A persistence failure means the dedup claim points at a row
        // that never landed; free it so the retry is not suppressed
        if matches!(cause, CrawlError::Persistence(_)) {
            if let Err(e) = self.dedup.release(task.product_id).await {
                warn!(
                    product_id = task.product_id,
                    error = %e,
                    "failed to release dedup entry for lost write"
                );
            }
        }

        let decision = self.policy.decide(task.retry_count, cause);

        match &decision {
            RetryDecision::Retry { delay } => {
                task.retry_count += 1;
                task.last_error = Some(cause.to_string());

                warn!(
                    task_id = %task.task_id,
                    retry_count = task.retry_count,
                    delay_secs = delay.as_secs(),
                    error = %cause,
                    "task failed, scheduling retry"
                );

                self.queue.schedule_retry(&task, *delay).await?;
                self.stats.record_retry();
            }
            RetryDecision::Dead => {
                error!(
                    task_id = %task.task_id,
                    retry_count = task.retry_count,
                    error_code = cause.error_code(),
                    error = %cause,
                    "task permanently failed"
                );

                match cause.log_status() {
                    LogStatus::Partial => self.stats.record_partial(),
                    _ => self.stats.record_failed(),
                }

                let failed_at = Utc::now();

                let event = FailureEvent {
                    task_id: task.task_id,
                    status: "failed",
                    error: cause.to_string(),
                    error_code: cause.error_code(),
                    retry_count: task.retry_count,
                    worker_id: worker_id.to_string(),
                    platform: task.platform,
                    completed_at: failed_at,
                };

                let entry = DeadLetterEntry {
                    task,
                    final_error: cause.to_string(),
                    error_code: cause.error_code(),
                    failed_at,
                };

                self.queue.push_dead_letter(&entry).await?;
                self.queue.push_result(&event).await?;
                self.stats.record_dead_letter();
            }
        }

        Ok(decision)
    }
}
