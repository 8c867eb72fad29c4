//! Per-run control socket
//!
//! Each active run listens on a unix socket (path derived from the DAG
//! name and run ID) carrying a minimal HTTP surface: `GET /status`,
//! `POST /stop`, `POST /signal`. The CLI and coordinator talk to runs
//! exclusively through this surface.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, warn};

use dagforge_common::error::{Error, Result};
use dagforge_common::signals::signal_from_name;
use dagforge_core::status::DagRunStatus;

/// Produces the current run status for the socket surface.
pub type StatusSource = Arc<dyn Fn() -> DagRunStatus + Send + Sync>;

/// Shared state behind the socket handlers
#[derive(Clone)]
pub struct SockState {
    status: StatusSource,
    stop: CancellationToken,
    signals: mpsc::UnboundedSender<i32>,
}

impl SockState {
    #[must_use]
    pub fn new(
        status: StatusSource,
        stop: CancellationToken,
        signals: mpsc::UnboundedSender<i32>,
    ) -> Self {
        Self {
            status,
            stop,
            signals,
        }
    }
}

#[derive(Debug, Serialize)]
struct OkReply {
    ok: bool,
}

#[derive(Debug, Deserialize)]
struct SignalRequest {
    signal: String,
}

async fn handle_status(State(state): State<SockState>) -> Json<DagRunStatus> {
    Json((state.status)())
}

async fn handle_stop(State(state): State<SockState>) -> Json<OkReply> {
    state.stop.cancel();
    Json(OkReply { ok: true })
}

async fn handle_signal(
    State(state): State<SockState>,
    Json(request): Json<SignalRequest>,
) -> std::result::Result<Json<OkReply>, (StatusCode, String)> {
    let Some(signal) = signal_from_name(&request.signal) else {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("unknown signal {:?}", request.signal),
        ));
    };
    state
        .signals
        .send(signal)
        .map_err(|_| (StatusCode::CONFLICT, "run already finished".to_string()))?;
    Ok(Json(OkReply { ok: true }))
}

fn router(state: SockState) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/stop", post(handle_stop))
        .route("/signal", post(handle_signal))
        .with_state(state)
}

/// Serve the control surface until `shutdown` fires. The socket file is
/// removed on exit.
pub async fn serve(path: PathBuf, state: SockState, shutdown: CancellationToken) -> Result<()> {
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)
        .map_err(|e| Error::Io(std::io::Error::new(e.kind(), format!("bind {path:?}: {e}"))))?;
    let app = router(state);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, _addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!("control socket accept failed: {err}");
                        continue;
                    }
                };
                let tower_service = app.clone();
                tokio::spawn(async move {
                    let socket = TokioIo::new(stream);
                    let hyper_service =
                        hyper::service::service_fn(move |request: Request<Incoming>| {
                            tower_service.clone().oneshot(request.map(Body::new))
                        });
                    if let Err(err) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(socket, hyper_service)
                        .await
                    {
                        debug!("control socket connection error: {err}");
                    }
                });
            }
        }
    }

    let _ = std::fs::remove_file(&path);
    Ok(())
}

async fn request(
    path: &Path,
    method: hyper::Method,
    target: &str,
    body: Option<serde_json::Value>,
) -> Result<Vec<u8>> {
    let stream = UnixStream::connect(path).await.map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("connect {path:?}: {e}"),
        ))
    })?;
    let io = TokioIo::new(stream);
    let (mut sender, connection) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| Error::Internal(format!("socket handshake failed: {e}")))?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!("control socket client connection error: {err}");
        }
    });

    let payload = match body {
        Some(value) => bytes::Bytes::from(serde_json::to_vec(&value)?),
        None => bytes::Bytes::new(),
    };
    let request = Request::builder()
        .method(method)
        .uri(target)
        .header(hyper::header::HOST, "dagforge")
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(http_body_util::Full::new(payload))
        .map_err(|e| Error::Internal(format!("request build failed: {e}")))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| Error::Internal(format!("socket request failed: {e}")))?;
    let status = response.status();
    let collected = response
        .into_body()
        .collect()
        .await
        .map_err(|e| Error::Internal(format!("socket response read failed: {e}")))?;
    let body = collected.to_bytes().to_vec();
    if !status.is_success() {
        return Err(Error::Internal(format!(
            "control socket returned {status}: {}",
            String::from_utf8_lossy(&body)
        )));
    }
    Ok(body)
}

/// Fetch the current status of a run.
pub async fn get_status(path: &Path) -> Result<DagRunStatus> {
    let body = request(path, hyper::Method::GET, "/status", None).await?;
    serde_json::from_slice(&body).map_err(Error::from)
}

/// Request cancellation of a run.
pub async fn post_stop(path: &Path) -> Result<()> {
    request(path, hyper::Method::POST, "/stop", None).await?;
    Ok(())
}

/// Deliver a named signal to every running step of a run.
pub async fn post_signal(path: &Path, signal_name: &str) -> Result<()> {
    request(
        path,
        hyper::Method::POST,
        "/signal",
        Some(serde_json::json!({ "signal": signal_name })),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagforge_core::status::Status;

    fn test_state(
        stop: CancellationToken,
    ) -> (SockState, mpsc::UnboundedReceiver<i32>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let status: StatusSource = Arc::new(|| DagRunStatus {
            name: "etl".to_string(),
            dag_run_id: "run-1".to_string(),
            status: Status::Running,
            ..DagRunStatus::default()
        });
        (SockState::new(status, stop, tx), rx)
    }

    fn sock_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "dagforge-test-{name}-{}.sock",
            uuid::Uuid::new_v4().simple()
        ))
    }

    #[tokio::test]
    async fn status_round_trip() {
        let shutdown = CancellationToken::new();
        let (state, _rx) = test_state(CancellationToken::new());
        let path = sock_path("status");
        let server = tokio::spawn(serve(path.clone(), state, shutdown.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let status = get_status(&path).await.unwrap();
        assert_eq!(status.name, "etl");
        assert_eq!(status.status, Status::Running);

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stop_cancels_the_run_token() {
        let shutdown = CancellationToken::new();
        let stop = CancellationToken::new();
        let (state, _rx) = test_state(stop.clone());
        let path = sock_path("stop");
        let server = tokio::spawn(serve(path.clone(), state, shutdown.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        post_stop(&path).await.unwrap();
        assert!(stop.is_cancelled());

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn signal_is_forwarded_by_number() {
        let shutdown = CancellationToken::new();
        let (state, mut rx) = test_state(CancellationToken::new());
        let path = sock_path("signal");
        let server = tokio::spawn(serve(path.clone(), state, shutdown.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        post_signal(&path, "SIGUSR1").await.unwrap();
        assert_eq!(rx.recv().await, Some(dagforge_common::signals::SIGUSR1));

        assert!(post_signal(&path, "SIGWHATEVER").await.is_err());

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
