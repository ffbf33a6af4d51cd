//! Atomic claiming of eligible messages.
//!
//! Two interchangeable strategies exist. [`ReturningClaim`] does the whole
//! select-and-mark in one `UPDATE ... RETURNING` statement, which SQLite
//! executes atomically. [`TransactionalClaim`] is for SQLite builds older than
//! 3.35 that lack `RETURNING`: it selects candidate ids and updates them by
//! primary key inside a `BEGIN IMMEDIATE` transaction, which holds the write
//! lock from the first statement so no other claimer can interleave.
//!
//! Which one is used is decided once, when the engine connects.

use std::{future::Future, pin::Pin, sync::Arc};

use serde::Deserialize;
use sqlx::{Connection, SqliteConnection, SqlitePool};

use crate::{
    db::statements::StatementCache, error::Error, message::QueueMessage, utils::placeholders,
};

/// First SQLite release with `UPDATE ... RETURNING`.
pub const RETURNING_MIN_VERSION: (u32, u32, u32) = (3, 35, 0);

/// How the claim strategy is picked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ClaimMode {
    /// Probe the store version at connect time.
    #[default]
    Auto,
    Returning,
    Transactional,
}

pub type ClaimFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<QueueMessage>, Error>> + Send + 'a>>;

/// Moves up to `batch_size` eligible messages of `queue` to `processing` and
/// returns them in claim order. Two concurrent calls never return the same
/// message.
pub trait ClaimStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn claim<'a>(
        &'a self,
        pool: &'a SqlitePool,
        queue: &'a str,
        batch_size: i64,
        now: i64,
    ) -> ClaimFuture<'a>;
}

const ELIGIBLE: &str = "
    queue_name = $1
    AND status IN ('pending', 'retrying')
    AND scheduled_at <= $2
    AND (next_retry_at IS NULL OR next_retry_at <= $2)
";

pub struct ReturningClaim;

impl ClaimStrategy for ReturningClaim {
    fn name(&self) -> &'static str {
        "returning"
    }

    fn claim<'a>(
        &'a self,
        pool: &'a SqlitePool,
        queue: &'a str,
        batch_size: i64,
        now: i64,
    ) -> ClaimFuture<'a> {
        Box::pin(async move {
            let sql = format!(
                "
                UPDATE queue_messages
                SET status = 'processing', processed_at = $2
                WHERE id IN (
                    SELECT id FROM queue_messages
                    WHERE {ELIGIBLE}
                    ORDER BY priority DESC, created_at ASC, id ASC
                    LIMIT $3
                )
                RETURNING *
                "
            );

            let mut messages: Vec<QueueMessage> = sqlx::query_as(&sql)
                .bind(queue)
                .bind(now)
                .bind(batch_size)
                .fetch_all(pool)
                .await?;

            // RETURNING makes no ordering promise.
            messages.sort_by(QueueMessage::claim_order);

            Ok(messages)
        })
    }
}

pub struct TransactionalClaim {
    statements: Arc<StatementCache>,
}

impl TransactionalClaim {
    pub fn new(statements: Arc<StatementCache>) -> Self {
        Self { statements }
    }

    async fn claim_in(
        &self,
        db: &mut SqliteConnection,
        queue: &str,
        batch_size: i64,
        now: i64,
    ) -> Result<Vec<QueueMessage>, Error> {
        let ids: Vec<i64> = sqlx::query_scalar(&format!(
            "
            SELECT id FROM queue_messages
            WHERE {ELIGIBLE}
            ORDER BY priority DESC, created_at ASC, id ASC
            LIMIT $3
            "
        ))
        .bind(queue)
        .bind(now)
        .bind(batch_size)
        .fetch_all(&mut *db)
        .await?;

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let result = self.mark_and_fetch(db, &ids, now).await;
        if result.as_ref().is_err_and(Error::is_store) {
            // Only the statements this call rendered can be suspect.
            self.statements.remove(&update_key(ids.len()));
            self.statements.remove(&select_key(ids.len()));
        }

        result
    }

    async fn mark_and_fetch(
        &self,
        db: &mut SqliteConnection,
        ids: &[i64],
        now: i64,
    ) -> Result<Vec<QueueMessage>, Error> {
        let update = self.statements.get_or_render(&update_key(ids.len()), || {
            format!(
                "
                UPDATE queue_messages
                SET status = 'processing', processed_at = $1
                WHERE status IN ('pending', 'retrying') AND id IN ({})
                ",
                placeholders(2, ids.len())
            )
        });

        let mut query = sqlx::query(&update).bind(now);
        for id in ids {
            query = query.bind(*id);
        }
        query.execute(&mut *db).await?;

        let select = self.statements.get_or_render(&select_key(ids.len()), || {
            format!(
                "
                SELECT * FROM queue_messages
                WHERE id IN ({})
                ORDER BY priority DESC, created_at ASC, id ASC
                ",
                placeholders(1, ids.len())
            )
        });

        let mut query = sqlx::query_as::<_, QueueMessage>(&select);
        for id in ids {
            query = query.bind(*id);
        }

        Ok(query.fetch_all(&mut *db).await?)
    }
}

fn update_key(n: usize) -> String {
    format!("claim_update:{n}")
}

fn select_key(n: usize) -> String {
    format!("claim_select:{n}")
}

impl ClaimStrategy for TransactionalClaim {
    fn name(&self) -> &'static str {
        "transactional"
    }

    fn claim<'a>(
        &'a self,
        pool: &'a SqlitePool,
        queue: &'a str,
        batch_size: i64,
        now: i64,
    ) -> ClaimFuture<'a> {
        Box::pin(async move {
            let mut tx = pool.begin_with("BEGIN IMMEDIATE").await?;

            match self.claim_in(&mut *tx, queue, batch_size, now).await {
                Ok(messages) => {
                    tx.commit().await?;
                    Ok(messages)
                }
                Err(e) => {
                    if e.is_store() {
                        if let Err(clear) = tx.clear_cached_statements().await {
                            tracing::warn!("Failed to clear cached statements: {clear}");
                        }
                    }
                    tx.rollback().await.ok();
                    Err(e)
                }
            }
        })
    }
}

/// Parses `"3.45.1"` into `(3, 45, 1)`.
pub fn parse_version(version: &str) -> Option<(u32, u32, u32)> {
    let mut parts = version.trim().split('.').map(|p| p.parse::<u32>().ok());
    let major = parts.next()??;
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);
    Some((major, minor, patch))
}

/// Whether the connected SQLite supports `UPDATE ... RETURNING`.
pub async fn supports_returning(pool: &SqlitePool) -> Result<bool, Error> {
    let version: String = sqlx::query_scalar("SELECT sqlite_version()")
        .fetch_one(pool)
        .await?;

    let supported = parse_version(&version)
        .map(|v| v >= RETURNING_MIN_VERSION)
        .unwrap_or(false);

    tracing::debug!(%version, supported, "probed sqlite for RETURNING support");

    Ok(supported)
}

/// Resolves `mode` against the store's capabilities.
pub async fn select_strategy(
    pool: &SqlitePool,
    mode: ClaimMode,
    statements: Arc<StatementCache>,
) -> Result<Box<dyn ClaimStrategy>, Error> {
    let returning = match mode {
        ClaimMode::Auto => supports_returning(pool).await?,
        ClaimMode::Returning => true,
        ClaimMode::Transactional => false,
    };

    Ok(if returning {
        Box::new(ReturningClaim)
    } else {
        Box::new(TransactionalClaim::new(statements))
    })
}
