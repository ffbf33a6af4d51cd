//! Background retention and recovery.
//!
//! Every `janitor_interval` the janitor releases messages stuck in
//! `processing`, then runs [`QueueEngine::cleanup_queue`] for each queue whose
//! own `cleanup_interval` has elapsed since its last pass, prunes expired
//! dead letters of every queue, and logs a health summary.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{engine::QueueEngine, error::Error};

/// Messages `processing` for longer than this are assumed abandoned.
pub const STALLED_AFTER: Duration = Duration::from_secs(10 * 60);

pub struct Janitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Janitor {
    pub fn start(engine: QueueEngine) -> Self {
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            run(engine, cancel.clone()).instrument(tracing::info_span!("janitor")),
        );

        Self { cancel, handle }
    }

    /// Stops the loop, waiting for a pass already under way.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!("Janitor ended abnormally: {e}");
        }
    }
}

async fn run(engine: QueueEngine, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(engine.config().janitor_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut sweeper = Sweeper::default();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        sweeper.sweep(&engine, Instant::now()).await;
    }

    tracing::debug!("Janitor stopped");
}

/// Remembers when each queue was last cleaned.
#[derive(Default)]
struct Sweeper {
    last_cleanup: HashMap<String, Instant>,
}

impl Sweeper {
    fn due(&self, queue: &str, interval: Duration, now: Instant) -> bool {
        self.last_cleanup
            .get(queue)
            .map_or(true, |last| now.duration_since(*last) >= interval)
    }

    async fn sweep(&mut self, engine: &QueueEngine, now: Instant) {
        if let Err(e) = engine.release_stalled(STALLED_AFTER).await {
            tracing::error!(
                "Failed to release stalled messages: {}",
                snafu::Report::from_error(e)
            );
        }

        if let Err(e) = self.cleanup_due(engine, now).await {
            tracing::error!("Cleanup pass failed: {}", snafu::Report::from_error(e));
        }

        // Per-queue cleanup only sees queues that still exist.
        if let Err(e) = engine.prune_dead_letters().await {
            tracing::error!(
                "Failed to prune dead letters: {}",
                snafu::Report::from_error(e)
            );
        }

        let health = engine.health().await;
        if health.is_healthy {
            tracing::debug!(
                pending = health.pending,
                processing = health.processing,
                retrying = health.retrying,
                failed = health.failed,
                dead_letters = health.dead_letters,
                "Queue health"
            );
        } else {
            tracing::warn!(
                stuck_processing = health.stuck_processing,
                failed = health.failed,
                store_error = health.store_error.as_deref(),
                "Queue engine unhealthy"
            );
        }
    }

    async fn cleanup_due(&mut self, engine: &QueueEngine, now: Instant) -> Result<(), Error> {
        for queue in engine.list_queues().await? {
            let config = engine.queue_config(&queue).await?;
            if !self.due(&queue, config.cleanup_interval(), now) {
                continue;
            }

            // A failing queue is retried on the next tick; the others go on.
            match engine.cleanup_queue(&queue).await {
                Ok(_) => {
                    self.last_cleanup.insert(queue, now);
                }
                Err(e) => tracing::error!(
                    %queue,
                    "Queue cleanup failed: {}",
                    snafu::Report::from_error(e)
                ),
            }
        }

        Ok(())
    }
}
