use anyhow::{Context, Result};
use glance_core::Gallery;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod http;
mod store;
mod trainer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = config::Config::from_env();
    tracing::info!(
        data_dir = %config.data_dir.display(),
        model_dir = %config.model_dir.display(),
        threshold = config.match_threshold,
        "glanced starting"
    );

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("invalid GLANCE_LISTEN_ADDR")?;

    let store = store::CaptureStore::open(config.dataset_dir())
        .context("opening capture store")?;
    tracing::info!(dataset = %store.root().display(), "capture store ready");

    let engine = engine::spawn_engine(
        &config.detector_model_path(),
        &config.embedder_model_path(),
    )
    .context("loading inference models")?;

    let gallery = Gallery::load(&config.gallery_path()).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "could not load gallery; starting untrained");
        Gallery::empty()
    });
    tracing::info!(entries = gallery.len(), "gallery loaded");

    let state = http::AppState::new(config, store, engine, gallery);
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "glanced ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("glanced shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
