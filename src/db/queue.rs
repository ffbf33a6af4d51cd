use sqlx::SqliteConnection;

use crate::{error::Error, queue::QueueConfig};

impl QueueConfig {
    pub async fn load(
        db: &mut SqliteConnection,
        queue: impl AsRef<str>,
    ) -> Result<Option<QueueConfig>, Error> {
        Ok(
            sqlx::query_as("SELECT * FROM queue_configs WHERE queue_name = $1")
                .bind(queue.as_ref())
                .fetch_optional(db)
                .await?,
        )
    }

    /// Inserts or replaces the stored config for `queue`, keeping the original
    /// `created_at`.
    pub async fn upsert(
        &self,
        db: &mut SqliteConnection,
        queue: impl AsRef<str>,
        now: i64,
    ) -> Result<(), Error> {
        sqlx::query(
            "
            INSERT INTO queue_configs (
                queue_name, max_retries, base_delay_ms, max_delay_ms, use_jitter,
                backoff_multiplier, batch_size, processing_timeout, cleanup_interval,
                retention_period, enabled, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
            ON CONFLICT (queue_name) DO UPDATE SET
                max_retries = excluded.max_retries,
                base_delay_ms = excluded.base_delay_ms,
                max_delay_ms = excluded.max_delay_ms,
                use_jitter = excluded.use_jitter,
                backoff_multiplier = excluded.backoff_multiplier,
                batch_size = excluded.batch_size,
                processing_timeout = excluded.processing_timeout,
                cleanup_interval = excluded.cleanup_interval,
                retention_period = excluded.retention_period,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at
            ",
        )
        .bind(queue.as_ref())
        .bind(self.max_retries)
        .bind(self.base_delay_ms)
        .bind(self.max_delay_ms)
        .bind(self.use_jitter)
        .bind(self.backoff_multiplier)
        .bind(self.batch_size)
        .bind(self.processing_timeout)
        .bind(self.cleanup_interval)
        .bind(self.retention_period)
        .bind(self.enabled)
        .bind(now)
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn set_enabled(
        db: &mut SqliteConnection,
        queue: impl AsRef<str>,
        enabled: bool,
        now: i64,
    ) -> Result<(), Error> {
        let queue = queue.as_ref();

        let res = sqlx::query(
            "UPDATE queue_configs SET enabled = $2, updated_at = $3 WHERE queue_name = $1",
        )
        .bind(queue)
        .bind(enabled)
        .bind(now)
        .execute(&mut *db)
        .await?;

        if res.rows_affected() == 0 {
            let config = QueueConfig {
                enabled,
                ..QueueConfig::default()
            };
            config.upsert(db, queue, now).await?;
        }

        Ok(())
    }
}
