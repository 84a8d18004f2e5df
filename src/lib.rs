//! depinguard -- streaming anomaly scoring with a tamper-evident event ledger.
//!
//! Readings flow through per-device sliding windows into a hybrid decision
//! engine (sequence score plus hard-limit rules). Anomalies are appended to a
//! hash-linked chain that can be verified end to end at any time.

pub mod aggregator;
pub mod api;
pub mod calibrate;
pub mod config;
pub mod detect;
pub mod error;
pub mod ingest;
pub mod ledger;
pub mod pipeline;
pub mod simulate;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::GuardConfig;
use crate::pipeline::{spawn_idle_sweeper, Guard};

/// Start the depinguard daemon: pipeline, idle sweep and API server.
pub async fn serve(config: GuardConfig) -> Result<()> {
    let guard = Arc::new(Guard::from_config(&config).await?);

    if let Err(e) = guard.verify_chain().check() {
        tracing::error!(error = %e, "serving with a broken ledger chain");
    }

    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.server.bind))?;

    tracing::info!(%addr, "depinguard listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    run_until(guard, &config, listener, shutdown_signal()).await
}

/// Serve the API on `listener` until `shutdown` resolves or the server
/// fails. Either way the sweeper is stopped and the mirror drained.
pub async fn run_until(
    guard: Arc<Guard>,
    config: &GuardConfig,
    listener: tokio::net::TcpListener,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let sweeper = spawn_idle_sweeper(
        guard.clone(),
        config.window.sweep_interval(),
        config.window.idle_ttl(),
    );
    let app = api::router(api::state::AppState::new(guard.clone()));

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    sweeper.abort();
    guard.flush().await;
    tracing::info!(records = guard.ledger().len(), "depinguard stopped");
    served.context("API server failed")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
