//! Ingest a ports document into an in-memory store and report what was loaded.
use std::sync::Arc;

use envconfig::Envconfig;
use eyre::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use port_common::port::Port;
use port_common::repository::MemoryRepository;
use port_ingestor::config::Config;
use port_ingestor::ingestor::Ingestor;
use port_ingestor::source::SourceSelection;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env()?;

    let repository = Arc::new(MemoryRepository::<Port>::new());
    let ingestor = Ingestor::new(repository.clone(), config.ingestor_config());

    let shutdown = CancellationToken::new();
    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            tracing::warn!("received interrupt, stopping ingestion");
            interrupt.cancel();
        }
    });

    let summary = ingestor
        .run_until(SourceSelection::path(&config.ports_file), shutdown)
        .await?;

    tracing::info!(
        ports = repository.len().await,
        created = summary.created,
        updated = summary.updated,
        "loaded {}",
        config.ports_file.display()
    );

    Ok(())
}
