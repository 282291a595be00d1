use anyhow::{Result, Context};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::cli::config::BatchSettings;
use crate::crawler::error::CrawlError;
use crate::crawler::retry::RetryManager;
use crate::crawler::task::{CrawlLogEntry, CrawlTask, Observation};
use crate::storage::store::PgStore;

/// One validated observation plus its attempt log, carried with the
/// originating task so a lost batch can be re-routed per task.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub task: CrawlTask,
    pub observation: Observation,
    pub log: CrawlLogEntry,
}

/// Handle used by workers to feed the batch writer.
#[derive(Clone)]
pub struct BatchWriter {
    tx: mpsc::Sender<BatchItem>,
}

impl BatchWriter {
    /// Spawn the background flush loop. Dropping every `BatchWriter`
    /// clone drains and flushes whatever is buffered, then the returned
    /// handle resolves.
    pub fn spawn(
        store: Arc<PgStore>,
        retry: Arc<RetryManager>,
        settings: BatchSettings,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(settings.max_items * 2);

        let handle = tokio::spawn(run_flush_loop(rx, store, retry, settings));

        (Self { tx }, handle)
    }

    pub async fn submit(&self, item: BatchItem) -> Result<()> {
        self.tx
            .send(item)
            .await
            .context("Batch writer is no longer accepting items")
    }
}

async fn run_flush_loop(
    mut rx: mpsc::Receiver<BatchItem>,
    store: Arc<PgStore>,
    retry: Arc<RetryManager>,
    settings: BatchSettings,
) {
    let mut buffer: Vec<BatchItem> = Vec::with_capacity(settings.max_items);
    let mut interval = tokio::time::interval(Duration::from_secs(settings.flush_interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately
    interval.tick().await;

    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(item) => {
                    buffer.push(item);
                    if buffer.len() >= settings.max_items {
                        flush(&mut buffer, &store, &retry, &settings).await;
                        interval.reset();
                    }
                }
                // All senders dropped: shutdown
                None => break,
            },
            _ = interval.tick() => {
                if !buffer.is_empty() {
                    flush(&mut buffer, &store, &retry, &settings).await;
                }
            }
        }
    }

    // Final drain so nothing buffered is lost on shutdown
    if !buffer.is_empty() {
        flush(&mut buffer, &store, &retry, &settings).await;
    }

    debug!("batch writer stopped");
}

/// Commit the buffered batch as one transaction, retrying the whole batch
/// with linear backoff. When the batch is unrecoverable every task in it
/// is individually re-routed through the retry manager.
async fn flush(
    buffer: &mut Vec<BatchItem>,
    store: &Arc<PgStore>,
    retry: &Arc<RetryManager>,
    settings: &BatchSettings,
) {
    let items = std::mem::take(buffer);
    let mut last_error = None;

    for attempt in 1..=settings.flush_attempts {
        match store.write_batch(&items).await {
            Ok(()) => return,
            Err(e) => {
                warn!(
                    attempt,
                    attempts = settings.flush_attempts,
                    items = items.len(),
                    error = %e,
                    "batch flush failed"
                );
                last_error = Some(e);
                if attempt < settings.flush_attempts {
                    let backoff = Duration::from_secs(settings.flush_backoff_secs * attempt as u64);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    let cause = CrawlError::Persistence(
        last_error
            .map(|e| format!("{:#}", e))
            .unwrap_or_else(|| "batch flush failed".to_string()),
    );

    error!(
        items = items.len(),
        "batch unrecoverable, re-routing tasks individually"
    );

    for item in items {
        let execution_time_ms = item.log.execution_time_ms;
        if let Err(e) = retry
            .handle_failure(item.task, &cause, execution_time_ms, "batch-writer")
            .await
        {
            error!(error = %e, "failed to re-route task from lost batch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::{LogStatus, Platform, Priority, StockStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_item() -> BatchItem {
        let task = CrawlTask {
            task_id: Uuid::new_v4(),
            product_id: 42,
            url: "https://www.coupang.com/vp/products/123".to_string(),
            platform: Platform::Coupang,
            priority: Priority::Normal,
            retry_count: 0,
            user_id: 7,
            created_at: Utc::now(),
            last_error: None,
        };
        let observation = Observation {
            product_id: 42,
            price: 29900.0,
            discount_rate: None,
            stock_status: StockStatus::Available,
            stock_quantity: None,
            promotion_info: None,
            image_url: None,
            rating: None,
            confidence_score: 0.75,
            recorded_at: Utc::now(),
        };
        let log = CrawlLogEntry {
            product_id: 42,
            platform: Platform::Coupang,
            url: task.url.clone(),
            status: LogStatus::Success,
            error_message: None,
            execution_time_ms: 1500,
            created_at: Utc::now(),
        };
        BatchItem {
            task,
            observation,
            log,
        }
    }

    #[test]
    fn test_batch_item_carries_task_for_rerouting() {
        let item = sample_item();
        assert_eq!(item.task.product_id, item.observation.product_id);
        assert_eq!(item.log.status, LogStatus::Success);
    }

    #[tokio::test]
    async fn test_submit_fails_after_writer_stops() {
        let (tx, rx) = mpsc::channel::<BatchItem>(4);
        drop(rx);

        let writer = BatchWriter { tx };
        assert!(writer.submit(sample_item()).await.is_err());
    }
}
