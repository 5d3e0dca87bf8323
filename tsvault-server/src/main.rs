//! tsvault Server - HTTP API for the time-series storage layer

mod api;
mod config;

use anyhow::Context as _;
use config::ServerConfig;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tsvault_core::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = ServerConfig::from_env()?;

    info!("Starting tsvault server v{}", tsvault_core::VERSION);
    info!("Storage path: {:?}", config.storage.path);

    // Opening replays the WAL, so keep it off the async workers
    let storage = config.storage.clone();
    let db = tokio::task::spawn_blocking(move || Database::open(storage))
        .await?
        .context("failed to open database")?;
    let db = Arc::new(db);

    let shutdown = CancellationToken::new();
    let state = Arc::new(api::AppState::new(
        db.clone(),
        shutdown.clone(),
        config.request_timeout,
    ));
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!("tsvault server listening on http://{}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    info!("Shutting down, flushing storage");
    tokio::task::spawn_blocking(move || db.close())
        .await?
        .context("failed to close database")?;

    Ok(())
}

/// Resolves on Ctrl-C and cancels in-flight storage calls
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    shutdown.cancel();
}
