//! Worker HTTP surfaces
//!
//! Two small TCP endpoints hosted by a worker process: the dispatch
//! listener the coordinator pushes jobs to, and the Prometheus metrics
//! exporter. Per-run control stays on the unix sockets.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dagforge_common::error::{Error, Result};
use dagforge_common::metrics::METRICS_REGISTRY;

use crate::dispatch::{DispatchJob, StatusAck};
use crate::worker::Worker;

async fn handle_dispatch_request(
    State(worker): State<Arc<Worker>>,
    Json(job): Json<DispatchJob>,
) -> (StatusCode, Json<StatusAck>) {
    // Accept fast: validation happens on the worker task; a blob that
    // fails to parse is reported through the status push path.
    info!(run_id = %job.dag_run_id, "dispatch received");
    tokio::spawn(async move {
        if let Err(err) = worker.handle_dispatch(job).await {
            warn!("dispatched run failed: {err}");
        }
    });
    (
        StatusCode::OK,
        Json(StatusAck {
            accepted: true,
            error: None,
        }),
    )
}

async fn handle_metrics() -> std::result::Result<String, (StatusCode, String)> {
    let encoder = prometheus::TextEncoder::new();
    encoder
        .encode_to_string(&METRICS_REGISTRY.gather())
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// Serve the coordinator-facing dispatch endpoint until `shutdown`
/// fires.
pub async fn serve_dispatch(
    listener: TcpListener,
    worker: Arc<Worker>,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = Router::new()
        .route("/api/v1/dispatch", post(handle_dispatch_request))
        .with_state(worker);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("dispatch server failed: {e}")))
}

/// Serve the Prometheus metrics endpoint until `shutdown` fires.
pub async fn serve_metrics(listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
    let app = Router::new().route("/metrics", get(handle_metrics));
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("metrics server failed: {e}")))
}
