//! Reference backend: the SQLite store over HTTP plus a websocket change
//! feed, for running the sync layer against something real.

pub mod api;
pub mod ws;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;

use crate::store::blob::FsBlobStore;
use crate::store::sqlite::SqliteStore;

pub use api::{AppState, SharedState};

/// Configuration for the reference server.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub tables: Vec<String>,
    pub blob_dir: PathBuf,
    pub signing_secret: String,
    pub dev_mode: bool,
}

/// Build the full application router with API and WebSocket.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Start the server and run until Ctrl+C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let store = SqliteStore::open(&config.db_path, &config.tables)
        .with_context(|| format!("Failed to open store at {}", config.db_path.display()))?;
    std::fs::create_dir_all(&config.blob_dir).with_context(|| {
        format!("Failed to create blob directory {}", config.blob_dir.display())
    })?;
    let blobs = FsBlobStore::new(config.blob_dir.clone(), config.signing_secret.clone());

    let state = Arc::new(AppState::new(Arc::new(store), Arc::new(blobs)));
    let mut app = build_router(state);

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, tables = config.tables.len(), "cardsync backend listening");
    println!("cardsync backend running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for Ctrl+C; shutting down");
    }
    println!("\nShutting down...");
}
