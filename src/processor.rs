//! Per-queue worker pools.
//!
//! A [`Processor`] polls one queue on a fixed interval, claims as many
//! messages as it has free slots for, and runs each through a
//! [`MessageHandler`] under the queue's processing timeout. Handler errors,
//! panics and timeouts all become `mark_failed` calls; nothing a handler does
//! can stop the polling loop.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

use crate::{engine::QueueEngine, error::Error, message::QueueMessage};

/// Processes one claimed message. `Ok` completes it, `Err` fails the attempt.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, message: QueueMessage) -> BoxFuture<'static, eyre::Result<()>>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(QueueMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<()>> + Send + 'static,
{
    fn handle(&self, message: QueueMessage) -> BoxFuture<'static, eyre::Result<()>> {
        Box::pin(self(message))
    }
}

/// Dispatches on `message_type`. A message with no matching route fails like
/// any other handler error.
#[derive(Default, Clone)]
pub struct Router {
    routes: HashMap<String, Arc<dyn MessageHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, message_type: impl Into<String>, handler: impl MessageHandler) -> Self {
        self.routes.insert(message_type.into(), Arc::new(handler));
        self
    }

    pub fn message_types(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

impl MessageHandler for Router {
    fn handle(&self, message: QueueMessage) -> BoxFuture<'static, eyre::Result<()>> {
        match self.routes.get(&message.message_type) {
            Some(handler) => handler.handle(message),
            None => {
                let message_type = message.message_type;
                Box::pin(async move {
                    Err(eyre::eyre!("no handler registered for message type {message_type}"))
                })
            }
        }
    }
}

/// A running poll loop bound to one queue.
pub struct Processor {
    queue: String,
    cancel: CancellationToken,
    tracker: TaskTracker,
    poll: JoinHandle<()>,
    drain_timeout: Duration,
}

impl Processor {
    /// Spawns the poll loop. The first tick fires immediately.
    pub fn start(
        engine: QueueEngine,
        queue: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let queue = queue.into();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let drain_timeout = engine.config().drain_timeout();

        let poll = tokio::spawn(
            poll_loop(
                engine,
                queue.clone(),
                handler,
                tracker.clone(),
                cancel.clone(),
            )
            .instrument(tracing::info_span!("processor", queue = %queue)),
        );

        tracing::info!(%queue, "Processor started");

        Self {
            queue,
            cancel,
            tracker,
            poll,
            drain_timeout,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Attempts currently running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stops claiming immediately, then waits for in-flight attempts up to the
    /// drain timeout. Handlers still running after that are left to finish on
    /// their own; their results are ignored.
    pub async fn stop(self) {
        self.cancel.cancel();

        if let Err(e) = self.poll.await {
            tracing::error!(queue = %self.queue, "Poll loop ended abnormally: {e}");
        }

        self.tracker.close();

        if tokio::time::timeout(self.drain_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                queue = %self.queue,
                in_flight = self.tracker.len(),
                drain_timeout_ms = self.drain_timeout.as_millis() as u64,
                "Drain timeout elapsed with attempts still in flight"
            );
        } else {
            tracing::info!(queue = %self.queue, "Processor stopped");
        }
    }
}

async fn poll_loop(
    engine: QueueEngine,
    queue: String,
    handler: Arc<dyn MessageHandler>,
    tracker: TaskTracker,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(engine.config().poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = tick(&engine, &queue, &handler, &tracker).await {
            tracing::error!("Poll tick failed: {}", snafu::Report::from_error(e));
        }
    }
}

async fn tick(
    engine: &QueueEngine,
    queue: &str,
    handler: &Arc<dyn MessageHandler>,
    tracker: &TaskTracker,
) -> Result<(), Error> {
    let config = engine.queue_config(queue).await?;
    if !config.enabled {
        tracing::trace!("Queue paused, skipping tick");
        return Ok(());
    }

    let ceiling = engine.config().max_concurrency;
    let in_flight = tracker.len();
    if in_flight >= ceiling {
        tracing::debug!(in_flight, ceiling, "At concurrency ceiling, skipping tick");
        return Ok(());
    }

    let available = (ceiling - in_flight) as i64;
    let messages = engine.claim(queue, config.batch_size.min(available)).await?;

    let timeout = config.processing_timeout();
    for message in messages {
        let span = tracing::info_span!(
            "attempt",
            message_id = message.id,
            message_type = %message.message_type,
            retry_count = message.retry_count,
        );
        tracker.spawn(attempt(engine.clone(), handler.clone(), message, timeout).instrument(span));
    }

    Ok(())
}

/// Runs one handler call and records its outcome.
///
/// The handler runs as its own task so that a panic is contained and so that
/// a timed-out handler keeps running detached instead of being cancelled.
async fn attempt(
    engine: QueueEngine,
    handler: Arc<dyn MessageHandler>,
    message: QueueMessage,
    timeout: Duration,
) {
    let id = message.id;
    let run = tokio::spawn(handler.handle(message));

    let outcome = match tokio::time::timeout(timeout, run).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(format!("{e:#}")),
        Ok(Err(e)) if e.is_panic() => Err("handler panicked".to_owned()),
        Ok(Err(e)) => Err(format!("handler task failed: {e}")),
        Err(_) => Err(format!(
            "processing timed out after {}ms",
            timeout.as_millis()
        )),
    };

    match outcome {
        Ok(()) => {
            if let Err(e) = engine.mark_completed(id).await {
                tracing::error!(
                    "Failed to mark message completed: {}",
                    snafu::Report::from_error(e)
                );
            }
        }
        Err(reason) => {
            tracing::warn!("Attempt failed: {reason}");
            if let Err(e) = engine.mark_failed(id, &reason).await {
                tracing::error!(
                    "Failed to record failed attempt: {}",
                    snafu::Report::from_error(e)
                );
            }
        }
    }
}
