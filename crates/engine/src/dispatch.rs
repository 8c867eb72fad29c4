//! Dispatch decision and worker↔coordinator contracts
//!
//! Decides whether a run executes locally or is handed to a coordinator,
//! and implements the worker-side status push and log streaming. Remote
//! execution reuses the node runtime unchanged; only the stdout/stderr
//! writers gain a forwarding adapter.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use dagforge_common::config::ExecutionMode;
use dagforge_common::error::{Error, Result};
use dagforge_core::dag::Dag;
use dagforge_core::status::DagRunStatus;
use dagforge_core::step::Step;

/// Executor type that requires local storage access and must never be
/// dispatched.
pub const HITL_EXECUTOR_TYPE: &str = "hitl";

/// Per-stream buffer size before a log chunk is flushed.
pub const DEFAULT_STREAM_BUFFER: usize = 32 * 1024;

/// Whether a DAG run should be handed to the coordinator.
///
/// True iff the DAG does not force local execution, a coordinator is
/// reachable, no step requires local storage, and either the DAG selects
/// workers or the process-wide default mode is distributed.
#[must_use]
pub fn should_dispatch_to_coordinator(
    dag: &Dag,
    has_coordinator: bool,
    default_mode: ExecutionMode,
) -> bool {
    if dag.force_local || !has_coordinator {
        return false;
    }
    if dag
        .steps
        .iter()
        .any(|s| s.executor.executor_type() == HITL_EXECUTOR_TYPE)
    {
        return false;
    }
    !dag.worker_selector.is_empty() || default_mode == ExecutionMode::Distributed
}

/// Step-level variant: a step with its own worker selector dispatches
/// even when the DAG as a whole does not.
#[must_use]
pub fn should_dispatch_step(
    step: &Step,
    dag: &Dag,
    has_coordinator: bool,
    default_mode: ExecutionMode,
) -> bool {
    if dag.force_local || !has_coordinator {
        return false;
    }
    if step.executor_type() == HITL_EXECUTOR_TYPE {
        return false;
    }
    !step.worker_selector.is_empty()
        || !dag.worker_selector.is_empty()
        || default_mode == ExecutionMode::Distributed
}

/// Stream identity of a log chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Stdout,
    Stderr,
}

/// One unit of the worker→coordinator log stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogChunk {
    pub worker_id: String,
    pub dag_run_id: String,
    pub dag_name: String,
    pub step_name: String,
    pub stream_type: StreamType,
    pub data: String,
    pub sequence: u64,
    pub is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<String>,
}

/// Coordinator acknowledgement of a status push
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusAck {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Coordinator acknowledgement of a completed log stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamAck {
    pub accepted: bool,
}

/// A job pushed from the coordinator to a worker: the DAG blob plus run
/// parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchJob {
    pub dag: serde_json::Value,
    pub dag_run_id: String,
    pub params: String,
}

/// Client-streaming log channel to the coordinator
#[async_trait]
pub trait LogStream: Send {
    async fn send(&mut self, chunk: LogChunk) -> Result<()>;
    async fn close(self: Box<Self>) -> Result<StreamAck>;
}

/// Worker-side view of the coordinator RPC surface
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    /// Unary status push; the full snapshot travels on every change.
    async fn report_status(
        &self,
        worker_id: &str,
        namespace_id: &str,
        status: &DagRunStatus,
    ) -> Result<StatusAck>;

    /// Open a client-streaming log channel.
    async fn open_log_stream(&self) -> Result<Box<dyn LogStream>>;

    /// Push a job to a worker. Returns once the worker accepts.
    async fn dispatch(&self, job: DispatchJob) -> Result<()>;
}

/// HTTP implementation of the coordinator contract
pub struct HttpCoordinatorClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpCoordinatorClient {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CoordinatorClient for HttpCoordinatorClient {
    async fn report_status(
        &self,
        worker_id: &str,
        namespace_id: &str,
        status: &DagRunStatus,
    ) -> Result<StatusAck> {
        let url = format!("{}/api/v1/workers/{worker_id}/status", self.base_url);
        let response = self
            .client
            .post(&url)
            .query(&[("namespace", namespace_id)])
            .json(status)
            .send()
            .await
            .map_err(|e| Error::Coordinator(format!("status push failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Coordinator(format!(
                "status push rejected with http {}",
                response.status()
            )));
        }
        response
            .json::<StatusAck>()
            .await
            .map_err(|e| Error::Coordinator(format!("malformed status ack: {e}")))
    }

    async fn open_log_stream(&self) -> Result<Box<dyn LogStream>> {
        let (tx, rx) = mpsc::channel::<std::result::Result<Vec<u8>, std::io::Error>>(64);
        let url = format!("{}/api/v1/logs/stream", self.base_url);
        let client = self.client.clone();
        let handle: JoinHandle<Result<StreamAck>> = tokio::spawn(async move {
            let body = reqwest::Body::wrap_stream(ReceiverStream::new(rx));
            let response = client
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
                .body(body)
                .send()
                .await
                .map_err(|e| Error::Coordinator(format!("log stream failed: {e}")))?;
            if !response.status().is_success() {
                return Err(Error::Coordinator(format!(
                    "log stream rejected with http {}",
                    response.status()
                )));
            }
            response
                .json::<StreamAck>()
                .await
                .map_err(|e| Error::Coordinator(format!("malformed stream ack: {e}")))
        });
        Ok(Box::new(HttpLogStream { tx: Some(tx), handle }))
    }

    async fn dispatch(&self, job: DispatchJob) -> Result<()> {
        let url = format!("{}/api/v1/dispatch", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&job)
            .send()
            .await
            .map_err(|e| Error::Coordinator(format!("dispatch failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Coordinator(format!(
                "dispatch rejected with http {}",
                response.status()
            )));
        }
        Ok(())
    }
}

struct HttpLogStream {
    tx: Option<mpsc::Sender<std::result::Result<Vec<u8>, std::io::Error>>>,
    handle: JoinHandle<Result<StreamAck>>,
}

#[async_trait]
impl LogStream for HttpLogStream {
    async fn send(&mut self, chunk: LogChunk) -> Result<()> {
        let Some(tx) = &self.tx else {
            return Err(Error::Coordinator("log stream already closed".to_string()));
        };
        let mut line = serde_json::to_vec(&chunk)?;
        line.push(b'\n');
        tx.send(Ok(line))
            .await
            .map_err(|_| Error::Coordinator("log stream receiver dropped".to_string()))
    }

    async fn close(mut self: Box<Self>) -> Result<StreamAck> {
        self.tx.take();
        self.handle
            .await
            .map_err(|e| Error::Coordinator(format!("log stream task failed: {e}")))?
    }
}

/// Routes buffered stream chunks from node writers to a forwarding task.
pub struct LogForwarder {
    worker_id: String,
    dag_run_id: String,
    dag_name: String,
    root_ref: Option<String>,
    attempt_id: Option<String>,
    buffer_size: usize,
    tx: mpsc::UnboundedSender<LogChunk>,
    sequences: DashMap<(String, StreamType), u64>,
}

impl LogForwarder {
    /// Returns the forwarder plus the chunk receiver the transport task
    /// drains.
    #[must_use]
    pub fn new(
        worker_id: impl Into<String>,
        dag_run_id: impl Into<String>,
        dag_name: impl Into<String>,
        buffer_size: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LogChunk>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                worker_id: worker_id.into(),
                dag_run_id: dag_run_id.into(),
                dag_name: dag_name.into(),
                root_ref: None,
                attempt_id: None,
                buffer_size: if buffer_size == 0 {
                    DEFAULT_STREAM_BUFFER
                } else {
                    buffer_size
                },
                tx,
                sequences: DashMap::new(),
            }),
            rx,
        )
    }

    #[must_use]
    pub fn stdout_writer(self: &Arc<Self>, step_name: &str) -> StreamWriter {
        self.writer(step_name, StreamType::Stdout)
    }

    #[must_use]
    pub fn stderr_writer(self: &Arc<Self>, step_name: &str) -> StreamWriter {
        self.writer(step_name, StreamType::Stderr)
    }

    fn writer(self: &Arc<Self>, step_name: &str, stream_type: StreamType) -> StreamWriter {
        StreamWriter {
            forwarder: Arc::clone(self),
            step_name: step_name.to_string(),
            stream_type,
            buffer: Vec::with_capacity(self.buffer_size),
            closed: false,
        }
    }

    fn emit(&self, step_name: &str, stream_type: StreamType, data: Vec<u8>, is_final: bool) {
        let key = (step_name.to_string(), stream_type);
        let mut entry = self.sequences.entry(key).or_insert(0);
        *entry += 1;
        let chunk = LogChunk {
            worker_id: self.worker_id.clone(),
            dag_run_id: self.dag_run_id.clone(),
            dag_name: self.dag_name.clone(),
            step_name: step_name.to_string(),
            stream_type,
            data: String::from_utf8_lossy(&data).into_owned(),
            sequence: *entry,
            is_final,
            root_ref: self.root_ref.clone(),
            attempt_id: self.attempt_id.clone(),
        };
        if self.tx.send(chunk).is_err() {
            debug!("log chunk dropped: forwarder receiver gone");
        }
    }
}

/// Drain forwarder chunks into a coordinator log stream, closing it when
/// the last writer is gone.
pub async fn forward_logs(
    mut rx: mpsc::UnboundedReceiver<LogChunk>,
    mut stream: Box<dyn LogStream>,
) -> Result<StreamAck> {
    while let Some(chunk) = rx.recv().await {
        stream.send(chunk).await?;
    }
    stream.close().await
}

/// `Write` adapter that buffers per-stream output and emits chunks.
pub struct StreamWriter {
    forwarder: Arc<LogForwarder>,
    step_name: String,
    stream_type: StreamType,
    buffer: Vec<u8>,
    closed: bool,
}

impl Write for StreamWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        if self.buffer.len() >= self.forwarder.buffer_size {
            let data = std::mem::take(&mut self.buffer);
            self.forwarder
                .emit(&self.step_name, self.stream_type, data, false);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.buffer.is_empty() {
            let data = std::mem::take(&mut self.buffer);
            self.forwarder
                .emit(&self.step_name, self.stream_type, data, false);
        }
        Ok(())
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let data = std::mem::take(&mut self.buffer);
        self.forwarder
            .emit(&self.step_name, self.stream_type, data, true);
    }
}

/// Push one status snapshot, treating a non-accept as a fatal
/// status-report error. Coordinator failures never retroactively change
/// node state; callers record them and move on.
pub async fn push_status(
    coordinator: &dyn CoordinatorClient,
    worker_id: &str,
    namespace_id: &str,
    status: &DagRunStatus,
) -> Result<()> {
    let ack = coordinator
        .report_status(worker_id, namespace_id, status)
        .await?;
    if !ack.accepted {
        let reason = ack.error.unwrap_or_else(|| "unspecified".to_string());
        warn!(dag = %status.name, "coordinator rejected status: {reason}");
        return Err(Error::Coordinator(format!(
            "status report rejected: {reason}"
        )));
    }
    Ok(())
}
