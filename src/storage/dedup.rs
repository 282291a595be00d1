use anyhow::{Result, Context};
use chrono::{DateTime, Utc};
use redis::{Client, aio::MultiplexedConnection};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Suppresses repeat writes for the same product inside a trailing
/// window. The check-then-act is a single Redis `SET NX PX`, so two
/// workers racing on the same product cannot both win: exactly one gets
/// the write, the other sees the existing entry and leaves its timestamp
/// untouched.
pub struct DedupGuard {
    conn: Arc<Mutex<MultiplexedConnection>>,
    window: Duration,
}

impl DedupGuard {
    pub async fn connect(redis_url: &str, window: Duration) -> Result<Self> {
        let client = Client::open(redis_url.to_string())
            .context(format!("Failed to connect to Redis at {}", redis_url))?;

        let conn = client.get_multiplexed_async_connection().await
            .context("Failed to get Redis connection")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            window,
        })
    }

    /// True when a write for this product should proceed. A successful
    /// claim records `now` and expires after the dedup window; a failed
    /// claim means another write landed within the window.
    pub async fn should_persist(&self, product_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let key = dedup_key(product_id);

        let mut conn = self.conn.lock().await;

        let claimed: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(now.timestamp_millis())
            .arg("NX")
            .arg("PX")
            .arg(self.window.as_millis() as u64)
            .query_async(&mut *conn)
            .await
            .context("Failed to claim dedup entry")?;

        let proceed = claimed.is_some();
        if !proceed {
            debug!(product_id, "write suppressed by dedup window");
        }

        Ok(proceed)
    }

    /// Drop the claim for a product whose write never landed, so a retry
    /// within the window is not suppressed against a missing row.
    pub async fn release(&self, product_id: i64) -> Result<()> {
        let key = dedup_key(product_id);

        let mut conn = self.conn.lock().await;

        redis::cmd("DEL")
            .arg(&key)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to release dedup entry")?;

        debug!(product_id, "released dedup entry");

        Ok(())
    }
}

fn dedup_key(product_id: i64) -> String {
    format!("dedup:{}", product_id)
}
