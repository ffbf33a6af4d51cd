use std::{collections::HashMap, ops::Deref, sync::Arc};

use tokio::sync::Mutex;

use crate::{
    config::Config,
    engine::QueueEngine,
    error::Error,
    janitor::Janitor,
    processor::{MessageHandler, Processor},
    queue::SystemHealth,
};

/// Owns the engine together with its processors and janitor.
///
/// Derefs to [`QueueEngine`], so every store operation is available directly.
pub struct Service {
    engine: QueueEngine,
    processors: Mutex<HashMap<String, Processor>>,
    janitor: Mutex<Option<Janitor>>,
}

impl Deref for Service {
    type Target = QueueEngine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

impl Service {
    pub async fn connect() -> Result<Self, Error> {
        Self::connect_with(Config::default()).await
    }

    /// Opens the store and starts the janitor.
    pub async fn connect_with(config: Config) -> Result<Self, Error> {
        let engine = QueueEngine::connect_with(config).await?;
        let janitor = Janitor::start(engine.clone());

        Ok(Self {
            engine,
            processors: Mutex::new(HashMap::new()),
            janitor: Mutex::new(Some(janitor)),
        })
    }

    pub fn engine(&self) -> &QueueEngine {
        &self.engine
    }

    /// Starts polling `queue` with `handler`. A queue has at most one
    /// processor; registering a second is an error.
    pub async fn register_processor(
        &self,
        queue: impl Into<String>,
        handler: impl MessageHandler,
    ) -> Result<(), Error> {
        let queue = queue.into();
        if queue.trim().is_empty() {
            return Err(Error::missing_parameter("queue name"));
        }

        let mut processors = self.processors.lock().await;
        if processors.contains_key(&queue) {
            return Err(Error::invalid_parameter(format!(
                "a processor is already registered for queue {queue}"
            )));
        }

        let processor = Processor::start(self.engine.clone(), queue.clone(), Arc::new(handler));
        processors.insert(queue, processor);

        Ok(())
    }

    /// Stops and drains the processor of `queue`. Returns false if none was
    /// registered.
    pub async fn unregister_processor(&self, queue: impl AsRef<str>) -> bool {
        let processor = self.processors.lock().await.remove(queue.as_ref());

        match processor {
            Some(processor) => {
                processor.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn processors(&self) -> Vec<String> {
        let mut names: Vec<_> = self.processors.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn get_system_health(&self) -> SystemHealth {
        let mut health = self.engine.health().await;
        health.processors = self.processors().await;
        health
    }

    /// Stops accepting work, drains every processor, stops the janitor and
    /// closes the store. Safe to call more than once.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down");

        self.engine.begin_close();

        let processors: Vec<_> = self.processors.lock().await.drain().map(|(_, p)| p).collect();
        futures_util::future::join_all(processors.into_iter().map(Processor::stop)).await;

        if let Some(janitor) = self.janitor.lock().await.take() {
            janitor.stop().await;
        }

        self.engine.close().await;
    }
}
