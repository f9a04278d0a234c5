use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use cache::ListCache;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use port_common::metrics::setup_metrics_recorder;
use port_common::port::Port;
use port_common::repository::MemoryRepository;
use port_ingestor::ingestor::Ingestor;

mod cache;
mod config;
mod handlers;

async fn shutdown(token: CancellationToken) {
    let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::error!("failed to register SIGTERM handler, {}", e);
            return;
        }
    };

    tokio::select! {
        _ = term.recv() => {},
        _ = signal::ctrl_c() => {},
    };

    tracing::info!("Shutting down gracefully...");
    token.cancel();
}

async fn listen(app: Router, bind: String, token: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!("listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown(token))
        .await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env()?;

    let recorder_handle = if config.export_prometheus {
        Some(setup_metrics_recorder()?)
    } else {
        None
    };

    let repository = Arc::new(MemoryRepository::<Port>::new());
    let ingestor = Ingestor::new(repository, config.ingest.ingestor_config());

    let token = CancellationToken::new();
    let list_cache = ListCache::new(Duration::from_secs(config.list_cache_ttl_seconds));
    let state = handlers::AppState::new(
        ingestor,
        config.ingest.ports_file.clone(),
        list_cache,
        token.clone(),
    );
    let app = handlers::app(state, recorder_handle, config.max_body_bytes);

    if let Err(e) = listen(app, config.bind(), token).await {
        tracing::error!("failed to start port-api http server, {}", e);
        return Err(e);
    }

    Ok(())
}
