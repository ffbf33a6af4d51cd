use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

use crate::{retry::RetryPolicy, utils::MS_PER_DAY};

/// Per-queue policy. Queues without a stored row use [`QueueConfig::default`].
#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq, bon::Builder)]
pub struct QueueConfig {
    #[builder(default = 3)]
    pub max_retries: i64,
    #[builder(default = 1_000)]
    pub base_delay_ms: i64,
    #[builder(default = 300_000)]
    pub max_delay_ms: i64,
    #[builder(default = true)]
    pub use_jitter: bool,
    #[builder(default = 2.0)]
    pub backoff_multiplier: f64,

    #[builder(default = 10)]
    pub batch_size: i64,
    /// Milliseconds a single attempt may run before it counts as failed.
    #[builder(default = 30_000)]
    pub processing_timeout: i64,
    /// Milliseconds between janitor passes over this queue.
    #[builder(default = 3_600_000)]
    pub cleanup_interval: i64,
    /// Milliseconds a completed or failed message is kept.
    #[builder(default = 7 * MS_PER_DAY)]
    pub retention_period: i64,

    #[builder(default = true)]
    pub enabled: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl QueueConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
            use_jitter: self.use_jitter,
            multiplier: self.backoff_multiplier,
        }
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout.max(1) as u64)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval.max(0) as u64)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::Error> {
        use crate::error::Error;

        if self.base_delay_ms < 0 || self.max_delay_ms < 0 {
            return Err(Error::invalid_parameter("retry delays must not be negative"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::invalid_parameter(
                "backoff_multiplier must be a finite number >= 1",
            ));
        }
        if self.batch_size < 1 {
            return Err(Error::invalid_parameter("batch_size must be at least 1"));
        }
        if self.processing_timeout < 1 {
            return Err(Error::invalid_parameter(
                "processing_timeout must be at least 1ms",
            ));
        }
        if self.retention_period < 0 || self.cleanup_interval < 0 {
            return Err(Error::invalid_parameter(
                "retention_period and cleanup_interval must not be negative",
            ));
        }
        Ok(())
    }
}

/// Read-only counters for one queue.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    pub queue_name: String,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub retrying: i64,
    pub total: i64,
    /// Mean of `processed_at - created_at` over completed and failed rows.
    pub avg_processing_ms: Option<f64>,
    pub oldest_pending_at: Option<i64>,
    #[sqlx(default)]
    pub dead_letters: i64,
}

impl QueueStats {
    pub fn live(&self) -> i64 {
        self.pending + self.processing + self.retrying
    }
}

/// Counts used to judge the health of the whole engine.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SystemHealth {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub retrying: i64,
    /// Messages that have been `processing` longer than the stuck threshold.
    pub stuck_processing: i64,
    pub dead_letters: i64,
    pub queues: Vec<String>,
    pub processors: Vec<String>,
    /// Set when the store could not be queried.
    pub store_error: Option<String>,
    pub is_healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay_ms, 1_000);
        assert!(config.use_jitter);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.retention_period, 7 * MS_PER_DAY);
        assert!(config.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_nonsense() {
        let config = QueueConfig::builder().batch_size(0).build();
        assert!(config.validate().unwrap_err().is_validation());

        let config = QueueConfig::builder().backoff_multiplier(f64::NAN).build();
        assert!(config.validate().is_err());

        let config = QueueConfig::builder().base_delay_ms(-1).build();
        assert!(config.validate().is_err());
    }
}
