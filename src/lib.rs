use std::{future::Future, sync::Arc};

use config::Config;
use error::Error;
use service::Service;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod janitor;
pub mod message;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod service;
pub mod utils;

/// Returns a builder for the main application.
///
/// `processors` runs once the service is connected and is where handlers get
/// registered. The service then runs until ctrl-c and shuts down gracefully.
#[bon::builder(finish_fn = start)]
pub async fn run<P, F>(processors: P) -> eyre::Result<()>
where
    P: FnOnce(Arc<Service>) -> F,
    F: Future<Output = Result<(), Error>>,
{
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("MNEMQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("MNEMQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = Config::load()?;

    let service = Arc::new(Service::connect_with(config).await?);

    if let Err(e) = processors(service.clone()).await {
        service.shutdown().await;
        return Err(e.into());
    }

    tracing::info!(
        processors = ?service.processors().await,
        "Queue service running, press ctrl-c to stop"
    );

    let signal = tokio::signal::ctrl_c().await;

    service.shutdown().await;

    signal?;

    Ok(())
}
