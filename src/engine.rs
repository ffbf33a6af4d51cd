//! The queue engine: every state transition of a message goes through here.
//!
//! [`QueueEngine`] is a cheap, cloneable handle over the SQLite pool. It owns
//! validation, capacity limits, the per-queue config cache and the claim
//! strategy picked at connect time. Processors and the janitor each hold a
//! clone; nothing else writes to the queue tables.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use serde_json::Value;
use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    Connection, Sqlite, SqliteConnection, SqlitePool, Transaction,
};

use crate::{
    config::Config,
    db::{
        claim::{select_strategy, ClaimStrategy},
        message::MessageRow,
        statements::StatementCache,
    },
    error::Error,
    message::{
        DeadLetterEntry, EnqueueOptions, FailureOutcome, MessageStatus, NewMessage, QueueMessage,
        MAX_PRIORITY, MAX_RETRIES_LIMIT, MIN_PRIORITY,
    },
    queue::{QueueConfig, QueueStats, SystemHealth},
    retry::{self, RetryDecision},
    utils::{duration_ms, now_ms, MS_PER_DAY},
};

/// Dead-letter entries older than this are pruned regardless of queue config.
pub const DEAD_LETTER_RETENTION_MS: i64 = 30 * MS_PER_DAY;

/// Slack past a queue's processing timeout before its message may be released
/// as stalled.
pub const STALL_GRACE: Duration = Duration::from_secs(60);

/// A message `processing` for longer than this counts as stuck.
pub const STUCK_PROCESSING_AFTER: Duration = Duration::from_secs(5 * 60);

pub const MAX_STUCK_PROCESSING: i64 = 100;
pub const MAX_FAILED: i64 = 1_000;

/// Stored error messages are cut to this many characters.
const MAX_ERROR_CHARS: usize = 4_096;

/// Rows removed by one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub messages: u64,
    pub dead_letters: u64,
}

#[derive(Clone)]
pub struct QueueEngine {
    inner: Arc<Inner>,
}

struct Inner {
    db: SqlitePool,
    config: Config,
    queue_configs: papaya::HashMap<String, QueueConfig>,
    statements: Arc<StatementCache>,
    claim: Box<dyn ClaimStrategy>,
    closing: AtomicBool,
}

impl QueueEngine {
    /// Connects to a private in-memory store.
    pub async fn connect() -> Result<Self, Error> {
        Self::connect_with(Config::default()).await
    }

    pub async fn connect_with(config: Config) -> Result<Self, Error> {
        let in_memory = config.db_path().is_none();

        let opts = if let Some(path) = config.db_path() {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        } else {
            SqliteConnectOptions::new().in_memory(true)
        }
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .locking_mode(SqliteLockingMode::Normal)
        .optimize_on_close(true, None)
        .auto_vacuum(SqliteAutoVacuum::Full)
        .busy_timeout(Duration::from_secs(10))
        .statement_cache_capacity(config.statement_cache_capacity.max(1));

        // Shared-cache memory databases report lock conflicts instead of
        // waiting on them, so they get a single connection that never expires.
        let pool_opts = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
        };

        let pool = pool_opts.connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        let statements = Arc::new(StatementCache::new(config.statement_cache_capacity));
        let claim = select_strategy(&pool, config.claim_strategy, statements.clone()).await?;

        tracing::info!(
            db = config.db_path().unwrap_or(":memory:"),
            claim_strategy = claim.name(),
            "Queue engine connected"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                db: pool,
                config,
                queue_configs: papaya::HashMap::new(),
                statements,
                claim,
                closing: AtomicBool::new(false),
            }),
        })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn claim_strategy(&self) -> &'static str {
        self.inner.claim.name()
    }

    pub fn statements(&self) -> &StatementCache {
        &self.inner.statements
    }

    /// Starts a transaction that takes the write lock immediately.
    async fn begin_immediate(&self) -> Result<Transaction<'static, Sqlite>, Error> {
        Ok(self.inner.db.begin_with("BEGIN IMMEDIATE").await?)
    }

    /// Commits on success. On failure rolls back, and if the store itself
    /// failed also drops the connection's prepared statements, since a failed
    /// statement can leave its prepared form unusable.
    async fn finish<T>(
        &self,
        mut tx: Transaction<'static, Sqlite>,
        result: Result<T, Error>,
    ) -> Result<T, Error> {
        match result {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if e.is_store() {
                    if let Err(clear) = tx.clear_cached_statements().await {
                        tracing::warn!("Failed to clear cached statements: {clear}");
                    }
                }
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!("Rollback failed: {rollback}");
                }
                Err(e)
            }
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.inner.closing.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    /// Rejects further enqueues; reads and in-flight completions still work.
    pub(crate) fn begin_close(&self) {
        self.inner.closing.store(true, Ordering::Release);
    }

    pub async fn close(&self) {
        self.begin_close();
        self.inner.db.close().await;
        tracing::info!("Queue engine closed");
    }

    // Configuration

    fn cached_config(&self, queue: &str) -> Option<QueueConfig> {
        let guard = self.inner.queue_configs.guard();
        self.inner.queue_configs.get(queue, &guard).cloned()
    }

    fn cache_config(&self, queue: &str, config: QueueConfig) {
        let guard = self.inner.queue_configs.guard();
        self.inner
            .queue_configs
            .insert(queue.to_owned(), config, &guard);
    }

    fn invalidate_config(&self, queue: &str) {
        let guard = self.inner.queue_configs.guard();
        self.inner.queue_configs.remove(queue, &guard);
    }

    /// Effective config of `queue`, loading through `db` on a cache miss.
    async fn queue_config_in(
        &self,
        db: &mut SqliteConnection,
        queue: &str,
    ) -> Result<QueueConfig, Error> {
        if let Some(config) = self.cached_config(queue) {
            return Ok(config);
        }

        let config = QueueConfig::load(db, queue).await?.unwrap_or_default();
        self.cache_config(queue, config.clone());

        Ok(config)
    }

    /// Effective config of `queue`: the stored row, or the defaults.
    pub async fn queue_config(&self, queue: impl AsRef<str>) -> Result<QueueConfig, Error> {
        let mut conn = self.inner.db.acquire().await?;
        self.queue_config_in(&mut conn, queue.as_ref()).await
    }

    pub async fn configure_queue(
        &self,
        queue: impl AsRef<str>,
        config: QueueConfig,
    ) -> Result<(), Error> {
        let queue = queue.as_ref();
        validate_name("queue name", queue)?;
        config.validate()?;

        let mut conn = self.inner.db.acquire().await?;
        config.upsert(&mut conn, queue, now_ms()).await?;
        self.invalidate_config(queue);

        tracing::info!(queue, ?config, "Queue configured");

        Ok(())
    }

    async fn set_enabled(&self, queue: &str, enabled: bool) -> Result<(), Error> {
        validate_name("queue name", queue)?;

        let mut tx = self.begin_immediate().await?;
        let result = QueueConfig::set_enabled(&mut tx, queue, enabled, now_ms()).await;
        self.finish(tx, result).await?;
        self.invalidate_config(queue);

        tracing::info!(queue, enabled, "Queue toggled");

        Ok(())
    }

    /// Stops processors of `queue` from claiming. Enqueues are still accepted.
    pub async fn pause_queue(&self, queue: impl AsRef<str>) -> Result<(), Error> {
        self.set_enabled(queue.as_ref(), false).await
    }

    pub async fn resume_queue(&self, queue: impl AsRef<str>) -> Result<(), Error> {
        self.set_enabled(queue.as_ref(), true).await
    }

    // Enqueue

    async fn prepare(
        &self,
        queue: &str,
        message_type: &str,
        payload: &Value,
        options: &EnqueueOptions,
        now: i64,
    ) -> Result<MessageRow, Error> {
        validate_name("queue name", queue)?;
        validate_name("message type", message_type)?;

        let payload = serde_json::to_string(payload)?;
        let max = self.inner.config.max_payload_bytes;
        if payload.len() > max {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }

        let max_retries = match options.max_retries {
            Some(n) => n,
            None => self.queue_config(queue).await?.max_retries,
        };

        let scheduled_at = options
            .scheduled_at
            .or_else(|| options.delay_ms.map(|delay| now + delay.max(0)))
            .unwrap_or(now);

        Ok(MessageRow {
            queue_name: queue.to_owned(),
            message_type: message_type.to_owned(),
            payload,
            priority: options
                .priority
                .unwrap_or(0)
                .clamp(MIN_PRIORITY, MAX_PRIORITY),
            scheduled_at,
            created_at: now,
            max_retries: max_retries.clamp(0, MAX_RETRIES_LIMIT),
            correlation_id: options.correlation_id.clone(),
            metadata: serde_json::to_string(&options.metadata)?,
        })
    }

    async fn insert_rows_in(
        &self,
        db: &mut SqliteConnection,
        rows: &[MessageRow],
    ) -> Result<Vec<i64>, Error> {
        let mut incoming: BTreeMap<&str, i64> = BTreeMap::new();
        for row in rows {
            *incoming.entry(row.queue_name.as_str()).or_default() += 1;
        }

        let max = self.inner.config.max_queue_size;
        for (queue, count) in incoming {
            let live = QueueMessage::live_count(db, queue).await?;
            if live + count > max {
                return Err(Error::QueueFull {
                    queue: queue.to_owned(),
                    size: live,
                    max,
                });
            }
        }

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(QueueMessage::insert(db, row).await?);
        }

        Ok(ids)
    }

    async fn insert_rows(&self, rows: &[MessageRow]) -> Result<Vec<i64>, Error> {
        let mut tx = self.begin_immediate().await?;
        let result = self.insert_rows_in(&mut tx, rows).await;
        self.finish(tx, result).await
    }

    /// Inserts `rows` in one transaction. A full queue gets one cleanup pass
    /// and a second chance before the whole batch is rejected.
    async fn admit(&self, rows: &[MessageRow]) -> Result<Vec<i64>, Error> {
        match self.insert_rows(rows).await {
            Err(Error::QueueFull { queue, size, max }) => {
                tracing::warn!(%queue, size, max, "Queue at capacity, cleaning up before retry");
                self.cleanup_queue(&queue).await?;
                self.insert_rows(rows).await
            }
            other => other,
        }
    }

    #[tracing::instrument(skip_all, fields(queue = queue.as_ref()))]
    pub async fn enqueue(
        &self,
        queue: impl AsRef<str>,
        message_type: impl AsRef<str>,
        payload: Value,
        options: EnqueueOptions,
    ) -> Result<i64, Error> {
        self.ensure_open()?;

        let row = self
            .prepare(
                queue.as_ref(),
                message_type.as_ref(),
                &payload,
                &options,
                now_ms(),
            )
            .await?;

        let id = self
            .admit(std::slice::from_ref(&row))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::internal(eyre::eyre!("insert returned no id")))?;

        tracing::debug!(message_id = id, message_type = %row.message_type, "Message enqueued");

        Ok(id)
    }

    /// All-or-nothing: one invalid entry rejects the whole batch.
    pub async fn enqueue_batch(&self, messages: Vec<NewMessage>) -> Result<Vec<i64>, Error> {
        self.ensure_open()?;

        if messages.is_empty() {
            return Ok(Vec::new());
        }

        let now = now_ms();
        let mut rows = Vec::with_capacity(messages.len());
        for (index, message) in messages.iter().enumerate() {
            let row = self
                .prepare(
                    &message.queue_name,
                    &message.message_type,
                    &message.payload,
                    &message.options,
                    now,
                )
                .await
                .inspect_err(|e| tracing::warn!(index, "Rejecting batch: {e}"))?;
            rows.push(row);
        }

        let ids = self.admit(&rows).await?;

        tracing::debug!(count = ids.len(), "Batch enqueued");

        Ok(ids)
    }

    // Processing

    /// Claims up to `batch_size` eligible messages of `queue`.
    pub async fn claim(
        &self,
        queue: impl AsRef<str>,
        batch_size: i64,
    ) -> Result<Vec<QueueMessage>, Error> {
        if batch_size < 1 {
            return Ok(Vec::new());
        }

        let queue = queue.as_ref();
        let messages = self
            .inner
            .claim
            .claim(&self.inner.db, queue, batch_size, now_ms())
            .await?;

        if !messages.is_empty() {
            tracing::debug!(queue, count = messages.len(), "Claimed messages");
        }

        Ok(messages)
    }

    /// `processing -> completed`. Returns false, and changes nothing, if the
    /// message is not `processing`.
    pub async fn mark_completed(&self, id: i64) -> Result<bool, Error> {
        let mut conn = self.inner.db.acquire().await?;
        let completed = QueueMessage::complete(&mut conn, id, now_ms()).await?;

        if completed {
            tracing::debug!(message_id = id, "Message completed");
        } else {
            tracing::warn!(message_id = id, "Ignoring completion of message not in processing");
        }

        Ok(completed)
    }

    async fn mark_failed_in(
        &self,
        db: &mut SqliteConnection,
        id: i64,
        error_message: &str,
        now: i64,
    ) -> Result<FailureOutcome, Error> {
        let message = match QueueMessage::get(db, id).await? {
            Some(message) if message.status == MessageStatus::Processing => message,
            Some(message) => {
                tracing::warn!(
                    message_id = id,
                    status = %message.status,
                    "Ignoring failure of message not in processing"
                );
                return Ok(FailureOutcome::Ignored);
            }
            None => {
                tracing::warn!(message_id = id, "Ignoring failure of unknown message");
                return Ok(FailureOutcome::Ignored);
            }
        };

        let config = self.queue_config_in(db, &message.queue_name).await?;

        match retry::decide(
            message.retry_count,
            message.max_retries,
            &config.retry_policy(),
        ) {
            RetryDecision::Retry { attempt, delay_ms } => {
                let next_retry_at = now + delay_ms;
                QueueMessage::schedule_retry(db, id, attempt, next_retry_at, error_message)
                    .await?;

                tracing::info!(
                    queue = %message.queue_name,
                    message_id = id,
                    retry_count = attempt,
                    max_retries = message.max_retries,
                    delay_ms,
                    "Message failed, retry scheduled: {error_message}"
                );

                Ok(FailureOutcome::Retrying {
                    retry_count: attempt,
                    next_retry_at,
                })
            }
            RetryDecision::DeadLetter => {
                let retry_count = message.retry_count + 1;
                let dead_letter_id =
                    DeadLetterEntry::insert(db, &message, error_message, retry_count, now).await?;
                QueueMessage::fail(db, id, retry_count, error_message, now).await?;

                tracing::error!(
                    queue = %message.queue_name,
                    message_id = id,
                    message_type = %message.message_type,
                    retry_count,
                    dead_letter_id,
                    "Message moved to dead-letter queue: {error_message}"
                );

                Ok(FailureOutcome::DeadLettered { dead_letter_id })
            }
        }
    }

    /// Records a failed attempt: schedules a retry while the message has
    /// retries left, otherwise dead-letters it. Both paths are one
    /// transaction.
    pub async fn mark_failed(
        &self,
        id: i64,
        error_message: impl AsRef<str>,
    ) -> Result<FailureOutcome, Error> {
        let error_message = truncate(error_message.as_ref(), MAX_ERROR_CHARS);

        let mut tx = self.begin_immediate().await?;
        let result = self.mark_failed_in(&mut tx, id, error_message, now_ms()).await;
        self.finish(tx, result).await
    }

    /// Fails every message that has been `processing` for longer than
    /// `older_than`, as if its attempt had errored. Returns how many were
    /// released.
    ///
    /// A message is never released while its own queue's processing timeout
    /// (plus [`STALL_GRACE`]) could still be running, so a queue with a long
    /// timeout is not failed out from under its handler.
    pub async fn release_stalled(&self, older_than: Duration) -> Result<usize, Error> {
        let now = now_ms();
        let cutoff = now.saturating_sub(duration_ms(older_than));

        let stalled = {
            let mut conn = self.inner.db.acquire().await?;
            QueueMessage::stalled(&mut conn, cutoff).await?
        };

        let mut released = 0;
        for (id, queue, processed_at) in stalled {
            let config = self.queue_config(&queue).await?;
            let min_age = older_than.max(config.processing_timeout().saturating_add(STALL_GRACE));
            if now.saturating_sub(processed_at) < duration_ms(min_age) {
                tracing::trace!(message_id = id, %queue, "Still within processing timeout");
                continue;
            }

            if self.mark_failed(id, "processing stalled").await? != FailureOutcome::Ignored {
                released += 1;
            }
        }

        if released > 0 {
            tracing::warn!(released, "Released stalled messages");
        }

        Ok(released)
    }

    // Reads

    /// Waiting messages of `queue` in the order they would be claimed.
    pub async fn peek(
        &self,
        queue: impl AsRef<str>,
        limit: i64,
    ) -> Result<Vec<QueueMessage>, Error> {
        let mut conn = self.inner.db.acquire().await?;
        QueueMessage::peek(&mut conn, queue.as_ref(), limit.max(0)).await
    }

    pub async fn get_message(&self, id: i64) -> Result<Option<QueueMessage>, Error> {
        let mut conn = self.inner.db.acquire().await?;
        QueueMessage::get(&mut conn, id).await
    }

    pub async fn find_by_correlation(
        &self,
        correlation_id: impl AsRef<str>,
    ) -> Result<Vec<QueueMessage>, Error> {
        let mut conn = self.inner.db.acquire().await?;
        QueueMessage::find_by_correlation(&mut conn, correlation_id.as_ref()).await
    }

    /// Every queue that has a stored config or at least one message.
    pub async fn list_queues(&self) -> Result<Vec<String>, Error> {
        let mut conn = self.inner.db.acquire().await?;
        QueueMessage::queue_names(&mut conn).await
    }

    /// Stats for one queue, or for every known queue when `queue` is `None`.
    pub async fn get_queue_stats(&self, queue: Option<&str>) -> Result<Vec<QueueStats>, Error> {
        let mut conn = self.inner.db.acquire().await?;

        let names = match queue {
            Some(queue) => vec![queue.to_owned()],
            None => QueueMessage::queue_names(&mut conn).await?,
        };

        let mut by_queue: BTreeMap<String, QueueStats> = match queue {
            Some(queue) => QueueMessage::stats(&mut conn, queue)
                .await?
                .into_iter()
                .map(|s| (s.queue_name.clone(), s))
                .collect(),
            None => QueueMessage::stats_all(&mut conn)
                .await?
                .into_iter()
                .map(|s| (s.queue_name.clone(), s))
                .collect(),
        };

        let mut stats = Vec::with_capacity(names.len());
        for name in names {
            let entry = match by_queue.remove(&name) {
                Some(entry) => entry,
                None => QueueStats {
                    dead_letters: DeadLetterEntry::count_for_queue(&mut conn, &name).await?,
                    queue_name: name,
                    ..QueueStats::default()
                },
            };
            stats.push(entry);
        }

        Ok(stats)
    }

    pub async fn get_dead_letter_messages(&self, limit: i64) -> Result<Vec<DeadLetterEntry>, Error> {
        let mut conn = self.inner.db.acquire().await?;
        DeadLetterEntry::list(&mut conn, limit.max(0)).await
    }

    pub async fn get_dead_letters_for(
        &self,
        queue: impl AsRef<str>,
        limit: i64,
    ) -> Result<Vec<DeadLetterEntry>, Error> {
        let mut conn = self.inner.db.acquire().await?;
        DeadLetterEntry::list_for_queue(&mut conn, queue.as_ref(), limit.max(0)).await
    }

    /// Dead-letter entries copied from message `message_id`, oldest first.
    pub async fn dead_letters_for_message(
        &self,
        message_id: i64,
    ) -> Result<Vec<DeadLetterEntry>, Error> {
        let mut conn = self.inner.db.acquire().await?;
        DeadLetterEntry::for_message(&mut conn, message_id).await
    }

    // Dead letters

    async fn requeue_in(
        &self,
        db: &mut SqliteConnection,
        ids: &[i64],
        now: i64,
    ) -> Result<Vec<i64>, Error> {
        let mut requeued = Vec::with_capacity(ids.len());

        for &id in ids {
            let Some(entry) = DeadLetterEntry::get(db, id).await? else {
                tracing::warn!(dead_letter_id = id, "Dead-letter entry not found, skipping");
                continue;
            };

            let config = self.queue_config_in(db, &entry.original_queue_name).await?;

            let row = MessageRow {
                queue_name: entry.original_queue_name.clone(),
                message_type: entry.message_type.clone(),
                payload: serde_json::to_string(&entry.payload)?,
                priority: 0,
                scheduled_at: now,
                created_at: now,
                max_retries: config.max_retries.clamp(0, MAX_RETRIES_LIMIT),
                correlation_id: entry.correlation_id.clone(),
                metadata: serde_json::to_string(&entry.metadata)?,
            };

            let message_id = QueueMessage::insert(db, &row).await?;
            DeadLetterEntry::delete(db, id).await?;

            tracing::info!(
                queue = %entry.original_queue_name,
                dead_letter_id = id,
                original_message_id = entry.original_message_id,
                message_id,
                "Requeued dead-letter entry"
            );

            requeued.push(message_id);
        }

        Ok(requeued)
    }

    /// Moves dead-letter entries back into their queue as fresh `pending`
    /// messages. Unknown ids are skipped. Returns the new message ids.
    pub async fn requeue_from_dead_letter(&self, ids: &[i64]) -> Result<Vec<i64>, Error> {
        self.ensure_open()?;

        let mut tx = self.begin_immediate().await?;
        let result = self.requeue_in(&mut tx, ids, now_ms()).await;
        self.finish(tx, result).await
    }

    // Retention

    /// Deletes completed messages of every queue finished more than
    /// `older_than_days` ago.
    pub async fn purge_completed(&self, older_than_days: i64) -> Result<u64, Error> {
        if older_than_days < 0 {
            return Err(Error::invalid_parameter("older_than_days must not be negative"));
        }

        let cutoff = now_ms() - older_than_days * MS_PER_DAY;

        let mut tx = self.inner.db.begin().await?;
        let result = QueueMessage::delete_completed_before(&mut tx, cutoff).await;
        let purged = self.finish(tx, result).await?;

        tracing::info!(purged, older_than_days, "Purged completed messages");

        Ok(purged)
    }

    /// Applies `queue`'s retention period to its terminal messages and the
    /// fixed dead-letter retention to its dead letters, one transaction each.
    pub async fn cleanup_queue(&self, queue: impl AsRef<str>) -> Result<CleanupReport, Error> {
        let queue = queue.as_ref();
        let config = self.queue_config(queue).await?;
        let now = now_ms();

        let mut tx = self.inner.db.begin().await?;
        let result =
            QueueMessage::delete_terminal_before(&mut tx, queue, now - config.retention_period)
                .await;
        let messages = self.finish(tx, result).await?;

        let mut tx = self.inner.db.begin().await?;
        let result =
            DeadLetterEntry::prune_before(&mut tx, queue, now - DEAD_LETTER_RETENTION_MS).await;
        let dead_letters = self.finish(tx, result).await?;

        let report = CleanupReport {
            messages,
            dead_letters,
        };

        if messages > 0 || dead_letters > 0 {
            tracing::info!(queue, messages, dead_letters, "Cleaned up expired rows");
        }

        Ok(report)
    }

    /// Applies the dead-letter retention to every entry, including those whose
    /// queue no longer has messages or a stored config.
    pub async fn prune_dead_letters(&self) -> Result<u64, Error> {
        let mut tx = self.inner.db.begin().await?;
        let result =
            DeadLetterEntry::prune_all_before(&mut tx, now_ms() - DEAD_LETTER_RETENTION_MS).await;
        let pruned = self.finish(tx, result).await?;

        if pruned > 0 {
            tracing::info!(pruned, "Pruned expired dead letters");
        }

        Ok(pruned)
    }

    // Health

    async fn collect_health(&self) -> Result<SystemHealth, Error> {
        let mut conn = self.inner.db.acquire().await?;

        sqlx::query("SELECT 1").execute(&mut *conn).await?;

        let mut health = SystemHealth::default();
        for (status, count) in QueueMessage::status_counts(&mut conn).await? {
            match status {
                MessageStatus::Pending => health.pending = count,
                MessageStatus::Processing => health.processing = count,
                MessageStatus::Completed => health.completed = count,
                MessageStatus::Failed => health.failed = count,
                MessageStatus::Retrying => health.retrying = count,
            }
        }

        let stuck_cutoff = now_ms().saturating_sub(duration_ms(STUCK_PROCESSING_AFTER));
        health.stuck_processing = QueueMessage::stalled_count(&mut conn, stuck_cutoff).await?;
        health.dead_letters = DeadLetterEntry::count(&mut conn).await?;
        health.queues = QueueMessage::queue_names(&mut conn).await?;
        health.is_healthy =
            health.stuck_processing <= MAX_STUCK_PROCESSING && health.failed <= MAX_FAILED;

        Ok(health)
    }

    /// Aggregate counts and a healthy/unhealthy verdict. A store that cannot
    /// be queried is reported as unhealthy rather than as an error.
    pub async fn health(&self) -> SystemHealth {
        match self.collect_health().await {
            Ok(health) => health,
            Err(e) => {
                let report = snafu::Report::from_error(e).to_string();
                tracing::error!("Queue store unavailable: {report}");
                SystemHealth {
                    store_error: Some(report),
                    is_healthy: false,
                    ..SystemHealth::default()
                }
            }
        }
    }
}

fn validate_name(what: &str, value: &str) -> Result<(), Error> {
    if value.trim().is_empty() {
        return Err(Error::missing_parameter(what));
    }
    if value.len() > 255 {
        return Err(Error::invalid_parameter(format!(
            "{what} longer than 255 bytes"
        )));
    }
    Ok(())
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_validated() {
        assert!(validate_name("queue name", "patterns").is_ok());
        assert!(matches!(
            validate_name("queue name", "  "),
            Err(Error::MissingParameter { .. })
        ));
        assert!(matches!(
            validate_name("queue name", &"x".repeat(256)),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("short", 10), "short");
    }

    #[tokio::test]
    async fn in_memory_round_trip() {
        let engine = QueueEngine::connect().await.unwrap();

        let id = engine
            .enqueue(
                "patterns",
                "detect",
                serde_json::json!({ "text": "hello" }),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let claimed = engine.claim("patterns", 5).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].status, MessageStatus::Processing);

        assert!(engine.mark_completed(id).await.unwrap());
        assert!(!engine.mark_completed(id).await.unwrap());

        let message = engine.get_message(id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Completed);
        assert!(message.processed_at.is_some());
    }
}
