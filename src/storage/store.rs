use anyhow::{Result, Context};
use sqlx::{Pool, Postgres, postgres::PgPoolOptions};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::cli::config::DatabaseSettings;
use crate::crawler::task::CrawlLogEntry;
use crate::storage::batch::BatchItem;

/// PostgreSQL store for observations and crawl logs.
///
/// Three append-only tables: price observations, stock observations, and
/// per-attempt crawl logs. This component never updates or deletes rows;
/// corrections arrive as new rows.
pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    /// Create a connection pool and ensure the tables exist.
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect(&settings.url)
            .await
            .context(format!("Failed to connect to PostgreSQL: {}", settings.url))?;

        let store = Self { pool };
        store.ensure_tables().await?;

        debug!("Connected to PostgreSQL database");

        Ok(store)
    }

    async fn ensure_tables(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS price_observations (
                id UUID PRIMARY KEY,
                product_id BIGINT NOT NULL,
                price DOUBLE PRECISION NOT NULL,
                discount_rate DOUBLE PRECISION,
                promotion_info TEXT,
                confidence_score DOUBLE PRECISION NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_price_observations_product_recorded
                ON price_observations (product_id, recorded_at)",
            "CREATE TABLE IF NOT EXISTS stock_observations (
                id UUID PRIMARY KEY,
                product_id BIGINT NOT NULL,
                stock_status TEXT NOT NULL,
                stock_quantity BIGINT,
                confidence_score DOUBLE PRECISION NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_stock_observations_product_recorded
                ON stock_observations (product_id, recorded_at)",
            "CREATE TABLE IF NOT EXISTS crawl_logs (
                id UUID PRIMARY KEY,
                product_id BIGINT NOT NULL,
                platform TEXT NOT NULL,
                url TEXT NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                execution_time_ms BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_crawl_logs_product_created
                ON crawl_logs (product_id, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_crawl_logs_status
                ON crawl_logs (status)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to ensure observation tables")?;
        }

        Ok(())
    }

    /// Write one accumulated batch in a single transaction. Either every
    /// price row, stock row and success log lands, or none of them do.
    pub async fn write_batch(&self, items: &[BatchItem]) -> Result<()> {
        let mut tx = self.pool.begin().await
            .context("Failed to begin batch transaction")?;

        for item in items {
            let observation = &item.observation;

            sqlx::query(
                "INSERT INTO price_observations
                    (id, product_id, price, discount_rate, promotion_info, confidence_score, recorded_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(Uuid::new_v4())
            .bind(observation.product_id)
            .bind(observation.price)
            .bind(observation.discount_rate)
            .bind(observation.promotion_info.as_deref())
            .bind(observation.confidence_score)
            .bind(observation.recorded_at)
            .execute(&mut *tx)
            .await
            .context("Failed to insert price observation")?;

            sqlx::query(
                "INSERT INTO stock_observations
                    (id, product_id, stock_status, stock_quantity, confidence_score, recorded_at)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(Uuid::new_v4())
            .bind(observation.product_id)
            .bind(observation.stock_status.as_str())
            .bind(observation.stock_quantity)
            .bind(observation.confidence_score)
            .bind(observation.recorded_at)
            .execute(&mut *tx)
            .await
            .context("Failed to insert stock observation")?;

            self.insert_log_in_tx(&mut tx, &item.log).await?;
        }

        tx.commit().await
            .context("Failed to commit batch transaction")?;

        debug!(items = items.len(), "flushed observation batch");

        Ok(())
    }

    async fn insert_log_in_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        entry: &CrawlLogEntry,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO crawl_logs
                (id, product_id, platform, url, status, error_message, execution_time_ms, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(Uuid::new_v4())
        .bind(entry.product_id)
        .bind(entry.platform.as_str())
        .bind(entry.url.as_str())
        .bind(entry.status.as_str())
        .bind(entry.error_message.as_deref())
        .bind(entry.execution_time_ms as i64)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await
        .context("Failed to insert crawl log")?;

        Ok(())
    }

    /// Single-row crawl log insert, used for partial/failed attempts and
    /// dedup-suppressed successes that bypass the batch.
    pub async fn insert_log(&self, entry: &CrawlLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO crawl_logs
                (id, product_id, platform, url, status, error_message, execution_time_ms, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(Uuid::new_v4())
        .bind(entry.product_id)
        .bind(entry.platform.as_str())
        .bind(entry.url.as_str())
        .bind(entry.status.as_str())
        .bind(entry.error_message.as_deref())
        .bind(entry.execution_time_ms as i64)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert crawl log")?;

        Ok(())
    }

    /// Fire-and-forget log insert so log visibility never couples task
    /// progress to the database.
    pub fn spawn_insert_log(self: &Arc<Self>, entry: CrawlLogEntry) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = store.insert_log(&entry).await {
                error!(
                    product_id = entry.product_id,
                    error = %e,
                    "failed to write crawl log entry"
                );
            }
        });
    }
}
