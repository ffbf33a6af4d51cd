use std::time::Duration;

use serde::Deserialize;

use crate::db::claim::ClaimMode;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,

    #[serde(default = "defaults::poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "defaults::max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "defaults::drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    #[serde(default = "defaults::janitor_interval_secs")]
    pub janitor_interval_secs: u64,

    #[serde(default = "defaults::max_queue_size")]
    pub max_queue_size: i64,
    #[serde(default = "defaults::max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default = "defaults::statement_cache_capacity")]
    pub statement_cache_capacity: usize,

    #[serde(default)]
    pub claim_strategy: ClaimMode,
}

mod defaults {
    pub const DB_PATH: &str = "mnemq.db";

    pub fn poll_interval_ms() -> u64 {
        1_000
    }

    pub fn max_concurrency() -> usize {
        10
    }

    pub fn drain_timeout_secs() -> u64 {
        30
    }

    pub fn janitor_interval_secs() -> u64 {
        60
    }

    pub fn max_queue_size() -> i64 {
        10_000
    }

    pub fn max_payload_bytes() -> usize {
        1024 * 1024
    }

    pub fn statement_cache_capacity() -> usize {
        64
    }
}

impl Config {
    /// Reads `MNEMQ_*` environment variables. Unlike [`Config::default`],
    /// which is in-memory, a loaded config always points at a file.
    pub fn load() -> eyre::Result<Self> {
        let mut config = envy::prefixed("MNEMQ_").from_env::<Self>()?;
        config
            .db_path
            .get_or_insert_with(|| defaults::DB_PATH.to_owned());
        Ok(config)
    }

    /// A config pointing at a database file, everything else defaulted.
    pub fn with_db_path(path: impl Into<String>) -> Self {
        Self {
            db_path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn db_path(&self) -> Option<&str> {
        self.db_path.as_deref()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            poll_interval_ms: defaults::poll_interval_ms(),
            max_concurrency: defaults::max_concurrency(),
            drain_timeout_secs: defaults::drain_timeout_secs(),
            janitor_interval_secs: defaults::janitor_interval_secs(),
            max_queue_size: defaults::max_queue_size(),
            max_payload_bytes: defaults::max_payload_bytes(),
            statement_cache_capacity: defaults::statement_cache_capacity(),
            claim_strategy: ClaimMode::default(),
        }
    }
}
