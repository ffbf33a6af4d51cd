use sqlx::SqliteConnection;

use crate::{
    error::Error,
    message::{DeadLetterEntry, QueueMessage},
};

impl DeadLetterEntry {
    /// Copies `message` into the dead-letter table with its final error.
    pub async fn insert(
        db: &mut SqliteConnection,
        message: &QueueMessage,
        error_message: &str,
        retry_count: i64,
        failed_at: i64,
    ) -> Result<i64, Error> {
        let res = sqlx::query(
            "
            INSERT INTO dead_letter_queue (
                original_queue_name, original_message_id, payload, error_message,
                retry_count, failed_at, correlation_id, message_type, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(&message.queue_name)
        .bind(message.id)
        .bind(sqlx::types::Json(&message.payload))
        .bind(error_message)
        .bind(retry_count)
        .bind(failed_at)
        .bind(&message.correlation_id)
        .bind(&message.message_type)
        .bind(sqlx::types::Json(&message.metadata))
        .execute(db)
        .await?;

        Ok(res.last_insert_rowid())
    }

    pub async fn get(db: &mut SqliteConnection, id: i64) -> Result<Option<DeadLetterEntry>, Error> {
        Ok(sqlx::query_as("SELECT * FROM dead_letter_queue WHERE id = $1")
            .bind(id)
            .fetch_optional(db)
            .await?)
    }

    pub async fn delete(db: &mut SqliteConnection, id: i64) -> Result<bool, Error> {
        let res = sqlx::query("DELETE FROM dead_letter_queue WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?;

        Ok(res.rows_affected() == 1)
    }

    /// Most recent failures first.
    pub async fn list(db: &mut SqliteConnection, limit: i64) -> Result<Vec<DeadLetterEntry>, Error> {
        Ok(sqlx::query_as(
            "SELECT * FROM dead_letter_queue ORDER BY failed_at DESC, id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(db)
        .await?)
    }

    pub async fn list_for_queue(
        db: &mut SqliteConnection,
        queue: &str,
        limit: i64,
    ) -> Result<Vec<DeadLetterEntry>, Error> {
        Ok(sqlx::query_as(
            "
            SELECT * FROM dead_letter_queue
            WHERE original_queue_name = $1
            ORDER BY failed_at DESC, id DESC
            LIMIT $2
            ",
        )
        .bind(queue)
        .bind(limit)
        .fetch_all(db)
        .await?)
    }

    pub async fn for_message(
        db: &mut SqliteConnection,
        message_id: i64,
    ) -> Result<Vec<DeadLetterEntry>, Error> {
        Ok(sqlx::query_as(
            "SELECT * FROM dead_letter_queue WHERE original_message_id = $1 ORDER BY id",
        )
        .bind(message_id)
        .fetch_all(db)
        .await?)
    }

    pub async fn count(db: &mut SqliteConnection) -> Result<i64, Error> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM dead_letter_queue")
            .fetch_one(db)
            .await?)
    }

    pub async fn count_for_queue(db: &mut SqliteConnection, queue: &str) -> Result<i64, Error> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM dead_letter_queue WHERE original_queue_name = $1",
        )
        .bind(queue)
        .fetch_one(db)
        .await?)
    }

    /// Drops entries of `queue` that failed before `cutoff`.
    pub async fn prune_before(
        db: &mut SqliteConnection,
        queue: &str,
        cutoff: i64,
    ) -> Result<u64, Error> {
        let res = sqlx::query(
            "DELETE FROM dead_letter_queue WHERE original_queue_name = $1 AND failed_at < $2",
        )
        .bind(queue)
        .bind(cutoff)
        .execute(db)
        .await?;

        Ok(res.rows_affected())
    }

    /// Drops entries of every queue, live or not, that failed before `cutoff`.
    pub async fn prune_all_before(db: &mut SqliteConnection, cutoff: i64) -> Result<u64, Error> {
        let res = sqlx::query("DELETE FROM dead_letter_queue WHERE failed_at < $1")
            .bind(cutoff)
            .execute(db)
            .await?;

        Ok(res.rows_affected())
    }
}
