//! Message types and status management for the queue engine.
//!
//! Messages are the unit of background work. They are created by an enqueue,
//! claimed by a processor, and resolved as completed, retried, or failed.
//!
//! # Message Lifecycle
//!
//! 1. Messages are created in `Pending` status
//! 2. A claim moves them to `Processing`
//! 3. A successful attempt moves them to `Completed`
//! 4. A failed attempt moves them to `Retrying` while retries remain, and is
//!    claimed again once `next_retry_at` passes
//! 5. A failed attempt with no retries left moves them to `Failed` and copies
//!    them into the dead-letter table
//!
//! Nothing moves to `Completed`, `Retrying` or `Failed` without first being
//! `Processing`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::prelude::FromRow;

/// Lowest priority accepted at enqueue; lower values are clamped.
pub const MIN_PRIORITY: i64 = 0;
/// Highest priority accepted at enqueue; higher values are clamped.
pub const MAX_PRIORITY: i64 = 100;
/// Upper bound on per-message retries.
pub const MAX_RETRIES_LIMIT: i64 = 10;

/// Current status of a message in the live table.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageStatus {
    /// Waiting to be claimed, possibly not yet due
    #[sqlx(rename = "pending")]
    Pending,
    /// Claimed by a processor; an attempt is in flight
    #[sqlx(rename = "processing")]
    Processing,
    /// The last attempt succeeded
    #[sqlx(rename = "completed")]
    Completed,
    /// Retries are exhausted; a dead-letter entry exists for this message
    #[sqlx(rename = "failed")]
    Failed,
    /// The last attempt failed and another is scheduled at `next_retry_at`
    #[sqlx(rename = "retrying")]
    Retrying,
}

/// A row of the live message table.
///
/// All timestamps are epoch milliseconds.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq)]
pub struct QueueMessage {
    /// Store-assigned, monotonically increasing identifier
    pub id: i64,
    /// Name of the queue this message belongs to
    pub queue_name: String,
    /// Caller-defined tag used to pick a handler
    pub message_type: String,

    #[sqlx(json)]
    pub payload: Value,
    /// Higher values are claimed first
    pub priority: i64,
    /// Earliest time the message may be claimed
    pub scheduled_at: i64,
    pub created_at: i64,

    pub status: MessageStatus,
    /// Number of failed attempts so far
    pub retry_count: i64,
    pub max_retries: i64,
    pub error_message: Option<String>,

    /// Set when claimed, and again when the message reaches a terminal status
    pub processed_at: Option<i64>,
    pub next_retry_at: Option<i64>,

    pub correlation_id: Option<String>,

    #[sqlx(json)]
    pub metadata: Option<Value>,
}

impl QueueMessage {
    /// Claim order: priority descending, then creation ascending, then id.
    pub fn claim_order(a: &Self, b: &Self) -> std::cmp::Ordering {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    }
}

/// Per-message settings supplied at enqueue time.
///
/// Anything left unset falls back to the queue's configuration (retries) or
/// to immediate, priority-0 scheduling.
#[derive(Debug, Clone, Default, bon::Builder, Serialize, Deserialize)]
pub struct EnqueueOptions {
    pub priority: Option<i64>,
    pub max_retries: Option<i64>,
    /// Absolute epoch-ms time before which the message is not claimable.
    pub scheduled_at: Option<i64>,
    /// Relative alternative to `scheduled_at`; ignored when that is set.
    pub delay_ms: Option<i64>,
    #[builder(into)]
    pub correlation_id: Option<String>,
    pub metadata: Option<Value>,
}

/// One entry of a batch enqueue.
#[derive(Debug, Clone, bon::Builder, Serialize, Deserialize)]
pub struct NewMessage {
    #[builder(into)]
    pub queue_name: String,
    #[builder(into)]
    pub message_type: String,
    pub payload: Value,
    #[builder(default)]
    #[serde(default)]
    pub options: EnqueueOptions,
}

/// Terminal record of a message whose retries ran out.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq)]
pub struct DeadLetterEntry {
    pub id: i64,
    pub original_queue_name: String,
    pub original_message_id: i64,
    #[sqlx(json)]
    pub payload: Value,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub failed_at: i64,
    pub correlation_id: Option<String>,
    pub message_type: String,
    #[sqlx(json)]
    pub metadata: Option<Value>,
}

/// What `mark_failed` did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Another attempt is scheduled.
    Retrying { retry_count: i64, next_retry_at: i64 },
    /// Retries are exhausted; the message now lives in the dead-letter table.
    DeadLettered { dead_letter_id: i64 },
    /// The message was not `processing`, so nothing changed.
    Ignored,
}
