use anyhow::{Result, Context};
use chrono::Utc;
use redis::{Client, aio::MultiplexedConnection};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cli::config::QueueSettings;
use crate::crawler::task::{CrawlTask, DeadLetterEntry, Priority};

/// Redis-backed task queue shared by every worker process.
///
/// Layout: one list per priority for intake, a list each for results and
/// dead letters, and a sorted set holding requeued tasks until their
/// backoff expires (score = ready time in epoch-ms).
pub struct TaskQueue {
    /// Shared multiplexed connection
    conn: Arc<Mutex<MultiplexedConnection>>,

    task_key: String,
    result_key: String,
    dead_letter_key: String,
    retry_key: String,
}

/// Queue depths for inspection and the `stats` subcommand.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub high_priority: usize,
    pub normal_priority: usize,
    pub delayed_retries: usize,
    pub results: usize,
    pub dead_letter: usize,
}

impl TaskQueue {
    /// Connect to Redis and bind the configured queue keys.
    pub async fn connect(config: &QueueSettings) -> Result<Self> {
        let client = Client::open(config.redis_url.clone())
            .context(format!("Failed to connect to Redis at {}", config.redis_url))?;

        let conn = client.get_multiplexed_async_connection().await
            .context("Failed to get Redis connection")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            task_key: config.task_queue.clone(),
            result_key: config.result_queue.clone(),
            dead_letter_key: config.dead_letter_queue.clone(),
            retry_key: config.retry_queue.clone(),
        })
    }

    fn priority_key(&self, priority: Priority) -> String {
        format!("{}:{}", self.task_key, priority.as_str())
    }

    /// Push a task onto its priority queue.
    pub async fn push_task(&self, task: &CrawlTask) -> Result<()> {
        let task_json = serde_json::to_string(task)
            .context("Failed to serialize task")?;

        let mut conn = self.conn.lock().await;

        redis::cmd("LPUSH")
            .arg(self.priority_key(task.priority))
            .arg(&task_json)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to push task to Redis queue")?;

        debug!(task_id = %task.task_id, priority = task.priority.as_str(), "pushed task to queue");

        Ok(())
    }

    /// Blocking pop with strict priority: the high queue is always
    /// drained before the normal queue is considered.
    pub async fn pop_task(&self, timeout_secs: usize) -> Result<Option<CrawlTask>> {
        let keys = vec![
            self.priority_key(Priority::High),
            self.priority_key(Priority::Normal),
        ];

        let mut conn = self.conn.lock().await;

        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&keys)
            .arg(timeout_secs)
            .query_async(&mut *conn)
            .await
            .context("Failed to pop task from Redis queue")?;

        match popped {
            Some((_queue, task_json)) => {
                let task: CrawlTask = serde_json::from_str(&task_json)
                    .context("Failed to deserialize task")?;
                debug!(task_id = %task.task_id, "popped task from queue");
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// Park a task until its backoff expires. The payload lives in Redis
    /// so retry state survives worker restarts.
    pub async fn schedule_retry(&self, task: &CrawlTask, delay: Duration) -> Result<()> {
        let task_json = serde_json::to_string(task)
            .context("Failed to serialize task")?;

        let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        let mut conn = self.conn.lock().await;

        redis::cmd("ZADD")
            .arg(&self.retry_key)
            .arg(ready_at)
            .arg(&task_json)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to schedule delayed retry")?;

        debug!(
            task_id = %task.task_id,
            retry_count = task.retry_count,
            delay_ms = delay.as_millis() as u64,
            "scheduled delayed retry"
        );

        Ok(())
    }

    /// Move due retries back onto their priority queues. `ZREM` is the
    /// claim: when several workers race on the same payload only the one
    /// whose removal succeeds re-enqueues it.
    pub async fn promote_due_retries(&self, limit: isize) -> Result<usize> {
        let now_ms = Utc::now().timestamp_millis();

        let mut conn = self.conn.lock().await;

        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.retry_key)
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut *conn)
            .await
            .context("Failed to read delayed retries")?;

        let mut promoted = 0;
        for payload in due {
            let removed: i64 = redis::cmd("ZREM")
                .arg(&self.retry_key)
                .arg(&payload)
                .query_async(&mut *conn)
                .await
                .context("Failed to claim delayed retry")?;

            if removed == 0 {
                // Another worker claimed it first
                continue;
            }

            match serde_json::from_str::<CrawlTask>(&payload) {
                Ok(task) => {
                    redis::cmd("LPUSH")
                        .arg(self.priority_key(task.priority))
                        .arg(&payload)
                        .query_async::<_, ()>(&mut *conn)
                        .await
                        .context("Failed to requeue delayed retry")?;
                    debug!(task_id = %task.task_id, "promoted delayed retry");
                    promoted += 1;
                }
                Err(e) => {
                    warn!(error = %e, "unparsable payload in retry set, moving to dead letter");
                    redis::cmd("LPUSH")
                        .arg(&self.dead_letter_key)
                        .arg(&payload)
                        .query_async::<_, ()>(&mut *conn)
                        .await
                        .context("Failed to dead-letter unparsable retry payload")?;
                }
            }
        }

        Ok(promoted)
    }

    /// Publish a completion or failure event on the result queue.
    pub async fn push_result<T: Serialize>(&self, event: &T) -> Result<()> {
        let event_json = serde_json::to_string(event)
            .context("Failed to serialize result event")?;

        let mut conn = self.conn.lock().await;

        redis::cmd("LPUSH")
            .arg(&self.result_key)
            .arg(&event_json)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to push result event")?;

        Ok(())
    }

    /// Move a permanently failed task to the dead-letter queue.
    pub async fn push_dead_letter(&self, entry: &DeadLetterEntry) -> Result<()> {
        let entry_json = serde_json::to_string(entry)
            .context("Failed to serialize dead-letter entry")?;

        let mut conn = self.conn.lock().await;

        redis::cmd("LPUSH")
            .arg(&self.dead_letter_key)
            .arg(&entry_json)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to push dead-letter entry")?;

        warn!(
            task_id = %entry.task.task_id,
            error_code = entry.error_code,
            "task moved to dead-letter queue"
        );

        Ok(())
    }

    /// Current queue depths.
    pub async fn stats(&self) -> Result<QueueStats> {
        let mut conn = self.conn.lock().await;

        let high_priority: usize = redis::cmd("LLEN")
            .arg(self.priority_key(Priority::High))
            .query_async(&mut *conn)
            .await
            .context("Failed to get high-priority queue length")?;

        let normal_priority: usize = redis::cmd("LLEN")
            .arg(self.priority_key(Priority::Normal))
            .query_async(&mut *conn)
            .await
            .context("Failed to get normal-priority queue length")?;

        let delayed_retries: usize = redis::cmd("ZCARD")
            .arg(&self.retry_key)
            .query_async(&mut *conn)
            .await
            .context("Failed to get delayed retry count")?;

        let results: usize = redis::cmd("LLEN")
            .arg(&self.result_key)
            .query_async(&mut *conn)
            .await
            .context("Failed to get result queue length")?;

        let dead_letter: usize = redis::cmd("LLEN")
            .arg(&self.dead_letter_key)
            .query_async(&mut *conn)
            .await
            .context("Failed to get dead-letter queue length")?;

        Ok(QueueStats {
            high_priority,
            normal_priority,
            delayed_retries,
            results,
            dead_letter,
        })
    }

    /// Clear queues (development/testing only).
    pub async fn clear(&self, which: &str) -> Result<()> {
        let mut keys: Vec<String> = Vec::new();

        match which {
            "tasks" => {
                keys.push(self.priority_key(Priority::High));
                keys.push(self.priority_key(Priority::Normal));
                keys.push(self.retry_key.clone());
            }
            "results" => keys.push(self.result_key.clone()),
            "dead_letter" => keys.push(self.dead_letter_key.clone()),
            "all" => {
                keys.push(self.priority_key(Priority::High));
                keys.push(self.priority_key(Priority::Normal));
                keys.push(self.retry_key.clone());
                keys.push(self.result_key.clone());
                keys.push(self.dead_letter_key.clone());
            }
            _ => anyhow::bail!("Unknown queue selector: {}", which),
        }

        let mut conn = self.conn.lock().await;

        redis::cmd("DEL")
            .arg(&keys)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to clear queues")?;

        debug!(selector = which, "cleared queues");

        Ok(())
    }
}
