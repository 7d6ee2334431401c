mod api;
mod config;
mod error;
mod executor;
mod metrics;
mod models;
mod rooms;
mod session;
mod ws;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::{
    api::AppState,
    config::{AppConfig, LogFormat, LoggingConfig},
    executor::{CodeExecutor, ProcessExecutor},
    metrics::MetricsRegistry,
    rooms::RoomBroadcaster,
    session::SessionStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AppConfig::from_env().context("failed to build service config")?;
    init_tracing(&cfg.logging);

    let store = SessionStore::connect(&cfg.store)
        .await
        .with_context(|| format!("failed to open session store at {}", cfg.store.database_path.display()))?;

    let metrics = Arc::new(MetricsRegistry::new());
    let executor: Arc<dyn CodeExecutor> = Arc::new(ProcessExecutor::new(&cfg.executor));
    tracing::info!(
        executor = executor.name(),
        timeout_secs = cfg.executor.execution_timeout_secs,
        "executor ready"
    );
    let state = AppState {
        rooms: RoomBroadcaster::new(store, metrics.clone()),
        executor,
        metrics,
        execution_timeout_secs: cfg.executor.execution_timeout_secs,
        max_code_bytes: cfg.max_code_bytes,
        ws: cfg.ws.clone(),
    };
    let app = api::routes(state, &cfg.cors_origins);

    let listener = TcpListener::bind(cfg.bind_addr)
        .await
        .context("failed to bind listener")?;

    tracing::info!(addr = %cfg.bind_addr, "collaboration service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},hyper=warn,tower_http=warn", logging.level))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match logging.format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}
