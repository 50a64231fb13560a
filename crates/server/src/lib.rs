//! Realtime chat relay
//!
//! Live direct and group chat over WebSockets with durable, append-only
//! conversation history in SQLite.

pub mod appender;
pub mod config;
pub mod error;
pub mod handlers;
pub mod history;
pub mod logging;
pub mod models;
pub mod registry;
pub mod router;
pub mod session;
pub mod store;

use anyhow::Context;
use axum::Router;
use std::sync::Arc;
use tracing::info;

use config::{AppState, RelayConfig};
use store::SqliteStore;

/// Build the application router over `state`.
pub fn app(state: AppState) -> Router {
    handlers::router(state)
}

pub async fn run() -> anyhow::Result<()> {
    let config = RelayConfig::from_env().context("invalid relay configuration")?;
    logging::init_tracing(&config);

    info!("=== Chat Relay ===");
    info!("Database: {}", config.database_url);

    let store = Arc::new(
        SqliteStore::connect(&config.database_url)
            .await
            .with_context(|| format!("failed to open store at {}", config.database_url))?,
    );

    let state = AppState::new(store.clone(), config.appender_config());
    let appender = state.appender.clone();
    let app = app(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!("Relay listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Shutting down, draining pending appends");
    appender.shutdown().await;
    store.close().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
