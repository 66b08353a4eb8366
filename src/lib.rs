//! anomalyd -- streaming telemetry anomaly detection.
//!
//! Sources feed a bounded Ingestion Stage that spills to SQLite under
//! pressure; workers keep per-(source, metric) windows and run pluggable
//! detectors over them; the Event Sink batches anomalies and delivers them
//! at least once to a downstream memory system.

pub mod api;
pub mod backoff;
pub mod config;
pub mod detect;
pub mod error;
pub mod health;
pub mod ingest;
pub mod metrics;
pub mod pipeline;
pub mod sink;
pub mod sources;
pub mod storage;
pub mod window;

use anyhow::{Context, Result};

use crate::config::AppConfig;
use crate::pipeline::Pipeline;

/// Start the daemon: pipeline plus the health/metrics API. Runs until
/// Ctrl-C or a pipeline-fatal error.
pub async fn serve(config: AppConfig) -> Result<()> {
    let bind = config.api.bind.clone();
    let pipeline = Pipeline::builder(config).build()?;
    let state = api::state::AppState {
        pipeline: pipeline.context(),
    };
    let handle = pipeline.start().await?;

    let addr: std::net::SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address '{bind}'"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "anomalyd listening");

    let stop_api = tokio_util::sync::CancellationToken::new();
    let server = {
        let stop_api = stop_api.clone();
        tokio::spawn(async move {
            axum::serve(listener, api::router(state))
                .with_graceful_shutdown(async move { stop_api.cancelled().await })
                .await
        })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupt received"),
        _ = handle.fatal() => tracing::error!("stopping after fatal pipeline error"),
    }

    let result = handle.shutdown().await;
    stop_api.cancel();
    server.await?.context("API server failed")?;
    result?;
    Ok(())
}
