use sqlx::SqliteConnection;
use tokio_stream::StreamExt;

use crate::{
    error::Error,
    message::{MessageStatus, QueueMessage},
    queue::QueueStats,
};

/// A validated message ready to be written.
#[derive(Debug, Clone)]
pub struct MessageRow {
    pub queue_name: String,
    pub message_type: String,
    /// Serialized JSON payload.
    pub payload: String,
    pub priority: i64,
    pub scheduled_at: i64,
    pub created_at: i64,
    pub max_retries: i64,
    pub correlation_id: Option<String>,
    /// Serialized JSON metadata; `"null"` when absent.
    pub metadata: String,
}

const STATS_COLUMNS: &str = "
    m.queue_name AS queue_name,
    COALESCE(SUM(m.status = 'pending'), 0) AS pending,
    COALESCE(SUM(m.status = 'processing'), 0) AS processing,
    COALESCE(SUM(m.status = 'completed'), 0) AS completed,
    COALESCE(SUM(m.status = 'failed'), 0) AS failed,
    COALESCE(SUM(m.status = 'retrying'), 0) AS retrying,
    COUNT(*) AS total,
    AVG(
        CASE WHEN m.status IN ('completed', 'failed') AND m.processed_at IS NOT NULL
        THEN m.processed_at - m.created_at END
    ) AS avg_processing_ms,
    MIN(CASE WHEN m.status = 'pending' THEN m.created_at END) AS oldest_pending_at,
    (
        SELECT COUNT(*) FROM dead_letter_queue d
        WHERE d.original_queue_name = m.queue_name
    ) AS dead_letters
";

impl QueueMessage {
    pub async fn insert(db: &mut SqliteConnection, row: &MessageRow) -> Result<i64, Error> {
        let res = sqlx::query(
            "
            INSERT INTO queue_messages (
                queue_name, message_type, payload, priority, scheduled_at,
                created_at, status, retry_count, max_retries, correlation_id, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, $7, $8, $9)
            ",
        )
        .bind(&row.queue_name)
        .bind(&row.message_type)
        .bind(&row.payload)
        .bind(row.priority)
        .bind(row.scheduled_at)
        .bind(row.created_at)
        .bind(row.max_retries)
        .bind(&row.correlation_id)
        .bind(&row.metadata)
        .execute(db)
        .await?;

        Ok(res.last_insert_rowid())
    }

    pub async fn get(db: &mut SqliteConnection, id: i64) -> Result<Option<QueueMessage>, Error> {
        Ok(sqlx::query_as("SELECT * FROM queue_messages WHERE id = $1")
            .bind(id)
            .fetch_optional(db)
            .await?)
    }

    /// Pending, processing and retrying messages in `queue`.
    pub async fn live_count(db: &mut SqliteConnection, queue: &str) -> Result<i64, Error> {
        Ok(sqlx::query_scalar(
            "
            SELECT COUNT(*) FROM queue_messages
            WHERE queue_name = $1 AND status IN ('pending', 'processing', 'retrying')
            ",
        )
        .bind(queue)
        .fetch_one(db)
        .await?)
    }

    /// `processing -> completed`. Returns false if the message was not
    /// `processing`.
    pub async fn complete(db: &mut SqliteConnection, id: i64, now: i64) -> Result<bool, Error> {
        let res = sqlx::query(
            "
            UPDATE queue_messages
            SET status = 'completed', processed_at = $2
            WHERE id = $1 AND status = 'processing'
            ",
        )
        .bind(id)
        .bind(now)
        .execute(db)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    /// `processing -> retrying`.
    pub async fn schedule_retry(
        db: &mut SqliteConnection,
        id: i64,
        retry_count: i64,
        next_retry_at: i64,
        error_message: &str,
    ) -> Result<bool, Error> {
        let res = sqlx::query(
            "
            UPDATE queue_messages
            SET status = 'retrying', retry_count = $2, next_retry_at = $3, error_message = $4
            WHERE id = $1 AND status = 'processing'
            ",
        )
        .bind(id)
        .bind(retry_count)
        .bind(next_retry_at)
        .bind(error_message)
        .execute(db)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    /// `processing -> failed`.
    pub async fn fail(
        db: &mut SqliteConnection,
        id: i64,
        retry_count: i64,
        error_message: &str,
        now: i64,
    ) -> Result<bool, Error> {
        let res = sqlx::query(
            "
            UPDATE queue_messages
            SET status = 'failed', retry_count = $2, error_message = $3,
                processed_at = $4, next_retry_at = NULL
            WHERE id = $1 AND status = 'processing'
            ",
        )
        .bind(id)
        .bind(retry_count)
        .bind(error_message)
        .bind(now)
        .execute(db)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    /// Waiting messages in claim order, without claiming them.
    pub async fn peek(
        db: &mut SqliteConnection,
        queue: &str,
        limit: i64,
    ) -> Result<Vec<QueueMessage>, Error> {
        let mut stream = sqlx::query_as(
            "
            SELECT * FROM queue_messages
            WHERE queue_name = $1 AND status IN ('pending', 'retrying')
            ORDER BY priority DESC, created_at ASC, id ASC
            LIMIT $2
            ",
        )
        .bind(queue)
        .bind(limit)
        .fetch(db);

        let mut messages = Vec::new();

        while let Some(res) = stream.next().await.transpose()? {
            messages.push(res);
        }

        Ok(messages)
    }

    pub async fn find_by_correlation(
        db: &mut SqliteConnection,
        correlation_id: &str,
    ) -> Result<Vec<QueueMessage>, Error> {
        Ok(sqlx::query_as(
            "SELECT * FROM queue_messages WHERE correlation_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(correlation_id)
        .fetch_all(db)
        .await?)
    }

    pub async fn stats(
        db: &mut SqliteConnection,
        queue: &str,
    ) -> Result<Option<QueueStats>, Error> {
        Ok(sqlx::query_as(&format!(
            "SELECT {STATS_COLUMNS} FROM queue_messages m WHERE m.queue_name = $1 GROUP BY m.queue_name"
        ))
        .bind(queue)
        .fetch_optional(db)
        .await?)
    }

    pub async fn stats_all(db: &mut SqliteConnection) -> Result<Vec<QueueStats>, Error> {
        Ok(sqlx::query_as(&format!(
            "SELECT {STATS_COLUMNS} FROM queue_messages m GROUP BY m.queue_name ORDER BY m.queue_name"
        ))
        .fetch_all(db)
        .await?)
    }

    /// Row counts per status across every queue.
    pub async fn status_counts(
        db: &mut SqliteConnection,
    ) -> Result<Vec<(MessageStatus, i64)>, Error> {
        Ok(
            sqlx::query_as("SELECT status, COUNT(*) FROM queue_messages GROUP BY status")
                .fetch_all(db)
                .await?,
        )
    }

    /// `(id, queue_name, processed_at)` of messages that have been
    /// `processing` since before `cutoff`.
    pub async fn stalled(
        db: &mut SqliteConnection,
        cutoff: i64,
    ) -> Result<Vec<(i64, String, i64)>, Error> {
        Ok(sqlx::query_as(
            "
            SELECT id, queue_name, processed_at FROM queue_messages
            WHERE status = 'processing' AND processed_at < $1
            ORDER BY id
            ",
        )
        .bind(cutoff)
        .fetch_all(db)
        .await?)
    }

    pub async fn stalled_count(db: &mut SqliteConnection, cutoff: i64) -> Result<i64, Error> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_messages WHERE status = 'processing' AND processed_at < $1",
        )
        .bind(cutoff)
        .fetch_one(db)
        .await?)
    }

    /// Deletes completed and failed messages of `queue` that reached their
    /// terminal status before `cutoff`.
    pub async fn delete_terminal_before(
        db: &mut SqliteConnection,
        queue: &str,
        cutoff: i64,
    ) -> Result<u64, Error> {
        let res = sqlx::query(
            "
            DELETE FROM queue_messages
            WHERE queue_name = $1
              AND status IN ('completed', 'failed')
              AND processed_at < $2
            ",
        )
        .bind(queue)
        .bind(cutoff)
        .execute(db)
        .await?;

        Ok(res.rows_affected())
    }

    /// Deletes completed messages of every queue finished before `cutoff`.
    pub async fn delete_completed_before(
        db: &mut SqliteConnection,
        cutoff: i64,
    ) -> Result<u64, Error> {
        let res = sqlx::query(
            "DELETE FROM queue_messages WHERE status = 'completed' AND processed_at < $1",
        )
        .bind(cutoff)
        .execute(db)
        .await?;

        Ok(res.rows_affected())
    }

    pub async fn queue_names(db: &mut SqliteConnection) -> Result<Vec<String>, Error> {
        Ok(sqlx::query_scalar(
            "
            SELECT queue_name FROM queue_messages
            UNION
            SELECT queue_name FROM queue_configs
            ORDER BY queue_name
            ",
        )
        .fetch_all(db)
        .await?)
    }
}
