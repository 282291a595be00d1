use anyhow::{Result, Context};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cli::config::CrawlerConfig;
use crate::crawler::extractor::ExtractorRegistry;
use crate::crawler::retry::{RetryManager, RetryPolicy};
use crate::crawler::task::{CrawlTask, Platform, Priority};
use crate::crawler::validator::Validator;
use crate::crawler::worker::{QueueHandler, WorkerContext};
use crate::storage::batch::BatchWriter;
use crate::storage::dedup::DedupGuard;
use crate::storage::queue::TaskQueue;
use crate::storage::ratelimit::RateLimiter;
use crate::storage::store::PgStore;
use crate::utils::metrics::WorkerStats;

/// Deployment seam: platform extractor implementations live outside this
/// core and are registered here before the pool starts.
fn build_registry() -> ExtractorRegistry {
    ExtractorRegistry::new()
}

/// Run the crawl worker pool until a shutdown signal arrives
pub async fn run(workers: Option<usize>, profile: Option<String>) -> Result<()> {
    let config = match profile {
        Some(ref name) => CrawlerConfig::load_profile(name)
            .context(format!("Failed to load profile: {}", name))?,
        None => CrawlerConfig::load_default()?,
    };

    let worker_count = workers.unwrap_or(config.worker.count);
    if worker_count < 1 {
        anyhow::bail!("Number of workers must be at least 1");
    }

    let registry = Arc::new(build_registry());
    if registry.is_empty() {
        warn!("no platform extractors registered; every task will be dead-lettered");
    } else {
        info!(platforms = ?registry.platforms(), "extractors registered");
    }

    // Shared infrastructure
    let queue = Arc::new(TaskQueue::connect(&config.queue).await?);
    let store = Arc::new(PgStore::connect(&config.database).await?);
    let rate_limiter = Arc::new(
        RateLimiter::connect(&config.queue.redis_url, config.rate_limit.clone()).await?,
    );
    let dedup = Arc::new(
        DedupGuard::connect(
            &config.queue.redis_url,
            Duration::from_secs(config.crawler.dedup_window_secs),
        )
        .await?,
    );

    let stats = Arc::new(WorkerStats::new());
    let policy = RetryPolicy {
        max_retries: config.crawler.max_retries,
        base_delay: Duration::from_secs(config.crawler.retry_base_secs),
    };
    let retry = Arc::new(RetryManager::new(
        Arc::clone(&queue),
        Arc::clone(&store),
        Arc::clone(&dedup),
        policy,
        Arc::clone(&stats),
    ));

    let (batch, batch_handle) =
        BatchWriter::spawn(Arc::clone(&store), Arc::clone(&retry), config.batch.clone());

    let ctx = Arc::new(WorkerContext {
        extract_timeout: Duration::from_secs(config.crawler.extract_timeout_secs),
        poll_timeout_secs: config.worker.poll_timeout_secs,
        queue: Arc::clone(&queue),
        rate_limiter,
        registry,
        validator: Validator::new(config.crawler.min_confidence),
        dedup,
        batch,
        store: Arc::clone(&store),
        retry,
        stats: Arc::clone(&stats),
    });

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let handler = QueueHandler::new(Arc::clone(&ctx));
    handler.run(worker_count, &config.worker.worker_prefix, cancel).await;

    // Dropping the last batch sender drains and flushes the buffer
    drop(handler);
    drop(ctx);
    batch_handle.await.context("Batch writer task panicked")?;

    stats.log_summary();

    Ok(())
}

/// Cancel on SIGINT or SIGTERM; workers finish their current task first.
fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        info!("shutdown signal received, finishing in-flight tasks");
        cancel.cancel();
    });
}

/// Enqueue a single crawl task for testing
pub async fn enqueue(
    product_id: i64,
    url: String,
    platform: String,
    priority: String,
    user_id: i64,
) -> Result<()> {
    let platform: Platform = platform.parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let priority = match priority.as_str() {
        "normal" => Priority::Normal,
        "high" => Priority::High,
        other => anyhow::bail!("Unknown priority: {}", other),
    };

    let config = CrawlerConfig::load_default()?;
    let queue = TaskQueue::connect(&config.queue).await?;

    let task = CrawlTask {
        task_id: Uuid::new_v4(),
        product_id,
        url,
        platform,
        priority,
        retry_count: 0,
        user_id,
        created_at: Utc::now(),
        last_error: None,
    };

    queue.push_task(&task).await?;

    println!("Enqueued task {}", task.task_id);

    Ok(())
}

/// Show queue depths
pub async fn stats() -> Result<()> {
    let config = CrawlerConfig::load_default()?;
    let queue = TaskQueue::connect(&config.queue).await?;

    let stats = queue.stats().await?;

    println!("High priority:    {}", stats.high_priority);
    println!("Normal priority:  {}", stats.normal_priority);
    println!("Delayed retries:  {}", stats.delayed_retries);
    println!("Results:          {}", stats.results);
    println!("Dead letter:      {}", stats.dead_letter);

    Ok(())
}

/// Clear queues (development/testing)
pub async fn clear(which: String) -> Result<()> {
    let config = CrawlerConfig::load_default()?;
    let queue = TaskQueue::connect(&config.queue).await?;

    queue.clear(&which).await?;

    info!("Cleared queues: {}", which);

    Ok(())
}

/// List all available configuration profiles
pub async fn list_profiles() -> Result<()> {
    let profiles = CrawlerConfig::list_profiles()?;

    println!("Available configuration profiles:");
    for profile in profiles {
        println!("  - {}", profile);
    }

    Ok(())
}

/// Manage a specific configuration profile
pub async fn manage_profile(profile_name: String) -> Result<()> {
    match CrawlerConfig::load_profile(&profile_name) {
        Ok(config) => {
            println!("Profile: {}", profile_name);
            println!("{:#?}", config);
        },
        Err(_) => {
            warn!("Profile '{}' does not exist. Creating a default profile.", profile_name);
            let config = CrawlerConfig::default();
            config.save_as_profile(&profile_name)?;
            println!("Created default profile: {}", profile_name);
        }
    }

    Ok(())
}

/// Show the current configuration
pub async fn show_config() -> Result<()> {
    let config = CrawlerConfig::load_default()?;
    println!("{:#?}", config);

    Ok(())
}
