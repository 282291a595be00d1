use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use url::Url;

use crate::crawler::error::{CrawlError, ExtractError};
use crate::crawler::extractor::{extract_with_timeout, ExtractorRegistry};
use crate::crawler::retry::RetryManager;
use crate::crawler::task::{CompletionEvent, CrawlLogEntry, CrawlTask, LogStatus, Observation};
use crate::crawler::validator::Validator;
use crate::storage::batch::{BatchItem, BatchWriter};
use crate::storage::dedup::DedupGuard;
use crate::storage::queue::TaskQueue;
use crate::storage::ratelimit::RateLimiter;
use crate::storage::store::PgStore;
use crate::utils::metrics::WorkerStats;

/// How many due delayed retries a worker promotes per dequeue cycle.
const PROMOTE_BATCH: isize = 32;

/// Everything a worker needs to drive one task through the pipeline.
/// Shared read-only across the whole pool.
pub struct WorkerContext {
    pub extract_timeout: Duration,
    pub poll_timeout_secs: usize,
    pub queue: Arc<TaskQueue>,
    pub rate_limiter: Arc<RateLimiter>,
    pub registry: Arc<ExtractorRegistry>,
    pub validator: Validator,
    pub dedup: Arc<DedupGuard>,
    pub batch: BatchWriter,
    pub store: Arc<PgStore>,
    pub retry: Arc<RetryManager>,
    pub stats: Arc<WorkerStats>,
}

enum PipelineOutcome {
    /// Observation handed to the batch writer.
    Persisted(Observation),
    /// Valid extraction, write suppressed by the dedup window.
    Deduplicated(Observation),
}

/// Dequeues tasks by priority and drives the pipeline across a bounded
/// worker pool. Each worker runs one task at a time to completion; a
/// shutdown signal suppresses further dequeues but never aborts a task
/// mid-pipeline.
pub struct QueueHandler {
    ctx: Arc<WorkerContext>,
}

impl QueueHandler {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    /// Run `worker_count` workers until cancellation, then wait for all
    /// of them to finish their current task.
    pub async fn run(
        &self,
        worker_count: usize,
        worker_prefix: &str,
        cancel: CancellationToken,
    ) {
        info!(worker_count, "starting worker pool");

        let mut handles = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let ctx = Arc::clone(&self.ctx);
            let worker_id = format!("{}-{}", worker_prefix, i + 1);
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                worker_loop(ctx, worker_id, cancel).await;
            }));
        }

        join_all(handles).await;

        info!("all workers have stopped");
    }
}

async fn worker_loop(ctx: Arc<WorkerContext>, worker_id: String, cancel: CancellationToken) {
    info!(%worker_id, "worker started");

    while !cancel.is_cancelled() {
        // Due retries re-enter their priority queues before each poll
        if let Err(e) = ctx.queue.promote_due_retries(PROMOTE_BATCH).await {
            error!(%worker_id, error = %e, "failed to promote delayed retries");
        }

        match ctx.queue.pop_task(ctx.poll_timeout_secs).await {
            Ok(Some(task)) => {
                // A task popped right at shutdown is still finished
                process_task(&ctx, &worker_id, task).await;
            }
            Ok(None) => {
                // Poll timeout with an empty queue; loop re-checks cancel
            }
            Err(e) => {
                error!(%worker_id, error = %e, "error in worker loop");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
    }

    info!(%worker_id, "worker stopped");
}

/// Drive one task through the full pipeline and publish exactly one
/// completion-or-failure outcome.
async fn process_task(ctx: &WorkerContext, worker_id: &str, task: CrawlTask) {
    let started = Instant::now();

    info!(
        task_id = %task.task_id,
        product_id = task.product_id,
        platform = %task.platform,
        retry_count = task.retry_count,
        "processing task"
    );

    ctx.stats.record_processed();

    match run_pipeline(ctx, &task, started).await {
        Ok(outcome) => {
            let execution_time_ms = started.elapsed().as_millis() as u64;
            let (observation, deduplicated) = match &outcome {
                PipelineOutcome::Persisted(observation) => (observation, false),
                PipelineOutcome::Deduplicated(observation) => (observation, true),
            };

            let event =
                CompletionEvent::new(&task, observation, deduplicated, execution_time_ms, worker_id);
            if let Err(e) = ctx.queue.push_result(&event).await {
                error!(task_id = %task.task_id, error = %e, "failed to publish completion event");
            }

            ctx.stats.record_success();
            if deduplicated {
                ctx.stats.record_deduplicated();
            }

            info!(
                task_id = %task.task_id,
                product_id = task.product_id,
                confidence = observation.confidence_score,
                deduplicated,
                execution_time_ms,
                "task completed"
            );
        }
        Err(cause) => {
            let execution_time_ms = started.elapsed().as_millis() as u64;
            if let Err(e) = ctx
                .retry
                .handle_failure(task, &cause, execution_time_ms, worker_id)
                .await
            {
                error!(error = %e, "error in task failure handler");
            }
        }
    }
}

async fn run_pipeline(
    ctx: &WorkerContext,
    task: &CrawlTask,
    started: Instant,
) -> Result<PipelineOutcome, CrawlError> {
    Url::parse(&task.url).map_err(|e| {
        CrawlError::Extract(ExtractError::ParseError(format!("invalid task url: {}", e)))
    })?;

    let extractor = ctx
        .registry
        .get(task.platform)
        .ok_or_else(|| CrawlError::UnsupportedPlatform(task.platform.to_string()))?;

    ctx.rate_limiter
        .acquire(task.platform)
        .await
        .map_err(|e| CrawlError::Infrastructure(format!("{:#}", e)))?;

    let raw = extract_with_timeout(extractor.as_ref(), &task.url, ctx.extract_timeout).await?;

    let observation = ctx.validator.validate(task.product_id, &raw, Utc::now())?;

    let proceed = ctx
        .dedup
        .should_persist(task.product_id, observation.recorded_at)
        .await
        .map_err(|e| CrawlError::Infrastructure(format!("{:#}", e)))?;

    if proceed {
        ctx.batch
            .submit(BatchItem {
                task: task.clone(),
                observation: observation.clone(),
                log: success_log(task, started),
            })
            .await
            .map_err(|e| CrawlError::Persistence(format!("{:#}", e)))?;

        Ok(PipelineOutcome::Persisted(observation))
    } else {
        // Suppressed writes bypass the batch; the attempt log is still
        // written, fire-and-forget
        ctx.store.spawn_insert_log(success_log(task, started));

        Ok(PipelineOutcome::Deduplicated(observation))
    }
}

fn success_log(task: &CrawlTask, started: Instant) -> CrawlLogEntry {
    CrawlLogEntry {
        product_id: task.product_id,
        platform: task.platform,
        url: task.url.clone(),
        status: LogStatus::Success,
        error_message: None,
        execution_time_ms: started.elapsed().as_millis() as u64,
        created_at: Utc::now(),
    }
}
