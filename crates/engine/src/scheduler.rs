//! DAG run scheduler
//!
//! Drives one run to completion: picks ready steps honoring the per-run
//! concurrency limit, reacts to signals and timeouts, invokes lifecycle
//! handlers, and reduces node results into the final run status.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use dagforge_common::error::{Error, ErrorList, Result};
use dagforge_common::fileutil::{log_file_base, log_file_path, safe_name};
use dagforge_common::metrics::{DefaultMetricsCollector, MetricsCollector};
use dagforge_common::signals::{SIGKILL, SIGTERM};
use dagforge_core::dag::Dag;
use dagforge_core::executor::{SubDagReport, SubDagRunner};
use dagforge_core::params::Params;
use dagforge_core::registry;
use dagforge_core::status::{DagRunStatus, NodeSnapshot, NodeStatus, Status};
use dagforge_core::step::{Step, SubDagRun};

use crate::dispatch::{forward_logs, push_status, CoordinatorClient, LogForwarder};
use crate::eval::{self, EvalScope};
use crate::graph::{ExecutionGraph, Readiness};
use crate::logio::SharedWriter;
use crate::node::{Node, RunContext};
use crate::router::compile_router;
use crate::sock;

/// Resolves sub-DAG names to compiled DAGs. The YAML loader behind this
/// boundary is an external collaborator.
pub trait DagLocator: Send + Sync {
    fn find(&self, name: &str) -> Result<Arc<Dag>>;
}

/// Locator backed by a fixed map; used by the run host and tests.
#[derive(Default)]
pub struct InMemoryDagLocator {
    dags: DashMap<String, Arc<Dag>>,
}

impl InMemoryDagLocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, dag: Arc<Dag>) {
        self.dags.insert(dag.name.clone(), dag);
    }
}

impl DagLocator for InMemoryDagLocator {
    fn find(&self, name: &str) -> Result<Arc<Dag>> {
        self.dags
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::Configuration(format!("unknown DAG {name:?}")))
    }
}

/// Scheduler settings shared by every run
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub log_dir: PathBuf,
    pub worker_id: String,
    pub namespace: String,
    /// Expose the per-run control socket.
    pub enable_sock_server: bool,
    pub log_stream_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            log_dir: std::env::temp_dir().join("dagforge-logs"),
            worker_id: "local".to_string(),
            namespace: "default".to_string(),
            enable_sock_server: false,
            log_stream_buffer: crate::dispatch::DEFAULT_STREAM_BUFFER,
        }
    }
}

/// Final report of one run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub dag_run_id: String,
    pub status: Status,
    pub nodes: Vec<NodeSnapshot>,
    pub handlers: Vec<NodeSnapshot>,
    pub outputs: BTreeMap<String, String>,
}

impl RunReport {
    /// First node error, for surfacing nested failures upwards.
    #[must_use]
    pub fn error_summary(&self) -> Option<String> {
        self.nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Failed || n.status == NodeStatus::Aborted)
            .find_map(|n| {
                n.error
                    .as_ref()
                    .map(|e| format!("step {:?}: {e}", n.name))
            })
    }
}

struct SchedulerInner {
    config: SchedulerConfig,
    coordinator: Option<Arc<dyn CoordinatorClient>>,
    locator: Option<Arc<dyn DagLocator>>,
    metrics: Arc<dyn MetricsCollector>,
}

/// The run engine. Cheap to clone; clones share configuration.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

/// Sub-DAG runner handle injected into executors.
struct SchedulerSubDagRunner {
    scheduler: Scheduler,
}

#[async_trait::async_trait]
impl SubDagRunner for SchedulerSubDagRunner {
    async fn run_sub_dag(
        &self,
        name: &str,
        run: &SubDagRun,
        cancel: CancellationToken,
    ) -> Result<SubDagReport> {
        let locator = self
            .scheduler
            .inner
            .locator
            .clone()
            .ok_or_else(|| Error::Configuration("no DAG locator configured".to_string()))?;
        let dag = locator.find(name)?;
        let dag = apply_params(&dag, &run.params);
        let scheduler = self.scheduler.clone();
        let run_id = run.dag_run_id.clone();
        let report = Box::pin(scheduler.run_with_cancel(dag, &run_id, cancel)).await?;
        Ok(SubDagReport {
            dag_run_id: report.dag_run_id.clone(),
            status: report.status,
            outputs: report.outputs.clone(),
            error: report.error_summary(),
        })
    }
}

/// Overlay run parameters onto a DAG clone: parsed `KEY=VALUE` pairs
/// become environment entries visible to every step.
pub(crate) fn apply_params(dag: &Dag, params: &str) -> Arc<Dag> {
    if params.trim().is_empty() {
        return Arc::new(dag.clone());
    }
    let mut out = dag.clone();
    let parsed = Params::Raw(params.to_string());
    for (key, value) in parsed.as_string_map() {
        out.env.insert(key, value);
    }
    out.params_raw = params.to_string();
    out.params = parsed;
    Arc::new(out)
}

static LOADED_DOTENV: Lazy<DashSet<PathBuf>> = Lazy::new(DashSet::new);

/// Load a DAG's dotenv files once per process; repeated calls are no-ops.
fn load_dotenv(dag: &Dag) {
    for path in &dag.dotenv {
        let path = PathBuf::from(path);
        if !LOADED_DOTENV.insert(path.clone()) {
            continue;
        }
        if let Err(err) = dotenv::from_path(&path) {
            warn!(?path, "dotenv load failed: {err}");
        }
    }
}

struct RunState {
    status: RwLock<Status>,
    /// Fresh per scheduler invocation; lets the coordinator distinguish
    /// re-executions of the same run ID.
    attempt_id: String,
    started_at: RwLock<Option<DateTime<Utc>>>,
    finished_at: RwLock<Option<DateTime<Utc>>>,
    handlers: Mutex<Vec<NodeSnapshot>>,
}

impl Scheduler {
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                coordinator: None,
                locator: None,
                metrics: Arc::new(DefaultMetricsCollector),
            }),
        }
    }

    #[must_use]
    pub fn with_coordinator(self, coordinator: Arc<dyn CoordinatorClient>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config: self.inner.config.clone(),
                coordinator: Some(coordinator),
                locator: self.inner.locator.clone(),
                metrics: Arc::clone(&self.inner.metrics),
            }),
        }
    }

    #[must_use]
    pub fn with_locator(self, locator: Arc<dyn DagLocator>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config: self.inner.config.clone(),
                coordinator: self.inner.coordinator.clone(),
                locator: Some(locator),
                metrics: Arc::clone(&self.inner.metrics),
            }),
        }
    }

    /// Validate a DAG against both structural invariants and the executor
    /// registry, collecting every violation.
    pub fn validate(dag: &Dag) -> Result<()> {
        let mut errors = ErrorList::new();
        if let Err(list) = dag.validate() {
            for err in list.errors() {
                errors.push(Error::Validation(err.to_string()));
            }
        }
        for step in &dag.steps {
            if let Err(err) = registry::validate_step(step) {
                errors.push(err);
            }
            if let Some(router) = &step.router {
                if let Err(err) = compile_router(router) {
                    errors.push(Error::Validation(format!(
                        "step {:?}: {err}",
                        step.name
                    )));
                }
            }
        }
        for (hook, step) in dag.handlers() {
            if let Err(err) = registry::validate_step(step) {
                errors.push(Error::Configuration(format!("handler {hook}: {err}")));
            }
        }
        errors.into_result().map_err(Error::from)
    }

    /// Run a DAG to completion.
    pub async fn run(&self, dag: Arc<Dag>, dag_run_id: &str) -> Result<RunReport> {
        self.run_with_cancel(dag, dag_run_id, CancellationToken::new())
            .await
    }

    /// Run a DAG under an externally-owned cancellation token.
    #[instrument(skip(self, dag, external_cancel), fields(dag = %dag.name, run_id = %dag_run_id))]
    pub async fn run_with_cancel(
        &self,
        dag: Arc<Dag>,
        dag_run_id: &str,
        external_cancel: CancellationToken,
    ) -> Result<RunReport> {
        Self::validate(&dag)?;
        load_dotenv(&dag);

        // Run-level preconditions gate admission of the whole run; an
        // unmet gate rejects it before any step starts.
        if !self.check_run_preconditions(&dag).await {
            return Ok(RunReport {
                dag_run_id: dag_run_id.to_string(),
                status: Status::Rejected,
                nodes: dag
                    .steps
                    .iter()
                    .map(|s| NodeSnapshot {
                        name: s.name.clone(),
                        ..NodeSnapshot::default()
                    })
                    .collect(),
                handlers: Vec::new(),
                outputs: BTreeMap::new(),
            });
        }

        let cancel = external_cancel.child_token();
        let hard_cancel = CancellationToken::new();
        let timed_out = Arc::new(AtomicBool::new(false));

        // Initial delay, cancellation-aware.
        if dag.delay_sec > 0 {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(Duration::from_secs(dag.delay_sec)) => {}
            }
        }

        let graph = Arc::new(ExecutionGraph::build(&dag)?);
        let run_log_file = self.open_run_log(&dag, dag_run_id)?;
        let ctx = RunContext {
            dag: Arc::clone(&dag),
            run_id: dag_run_id.to_string(),
            log_dir: self.inner.config.log_dir.clone(),
            run_log_file: run_log_file.as_ref().map(|w| w.path().to_path_buf()),
            outputs: Arc::new(DashMap::new()),
            json_outputs: Arc::new(DashMap::new()),
            cancel: cancel.clone(),
            hard_cancel: hard_cancel.clone(),
            sub_runner: Some(Arc::new(SchedulerSubDagRunner {
                scheduler: self.clone(),
            })),
            log_forwarder: None,
            worker_id: Some(self.inner.config.worker_id.clone()),
        };
        let mut ctx = ctx;

        // Worker-side log streaming when a coordinator is attached.
        let mut stream_task = None;
        if let Some(coordinator) = &self.inner.coordinator {
            match coordinator.open_log_stream().await {
                Ok(stream) => {
                    let (forwarder, rx) = LogForwarder::new(
                        self.inner.config.worker_id.clone(),
                        dag_run_id.to_string(),
                        dag.name.clone(),
                        self.inner.config.log_stream_buffer,
                    );
                    ctx.log_forwarder = Some(forwarder);
                    stream_task = Some(tokio::spawn(forward_logs(rx, stream)));
                }
                Err(err) => warn!("log stream unavailable: {err}"),
            }
        }

        let run_state = Arc::new(RunState {
            status: RwLock::new(Status::Running),
            attempt_id: uuid::Uuid::new_v4().simple().to_string(),
            started_at: RwLock::new(Some(Utc::now())),
            finished_at: RwLock::new(None),
            handlers: Mutex::new(Vec::new()),
        });

        // Per-run control socket.
        let (signal_tx, signal_rx) = mpsc::unbounded_channel::<i32>();
        let sock_shutdown = CancellationToken::new();
        let mut sock_task = None;
        if self.inner.config.enable_sock_server {
            let status_graph = Arc::clone(&graph);
            let status_state = Arc::clone(&run_state);
            let status_dag = Arc::clone(&dag);
            let status_run_id = dag_run_id.to_string();
            let worker_id = self.inner.config.worker_id.clone();
            let outputs = Arc::clone(&ctx.outputs);
            let source: sock::StatusSource = Arc::new(move || {
                build_status(
                    &status_dag,
                    &status_run_id,
                    &worker_id,
                    &status_graph,
                    &status_state,
                    &outputs,
                )
            });
            let state = sock::SockState::new(source, cancel.clone(), signal_tx.clone());
            sock_task = Some(tokio::spawn(sock::serve(
                dag.sock_addr(dag_run_id),
                state,
                sock_shutdown.clone(),
            )));
        }
        drop(signal_tx);

        // Forward socket-delivered signals to running nodes.
        let signal_graph = Arc::clone(&graph);
        let signal_task = tokio::spawn(async move {
            let mut rx = signal_rx;
            while let Some(signal) = rx.recv().await {
                for node in signal_graph.nodes() {
                    if node.status() == NodeStatus::Running {
                        node.signal(signal, false);
                    }
                }
            }
        });

        // DAG-level timeout acts as a cancellation signal.
        let mut timeout_task = None;
        if let Some(limit) = dag.timeout() {
            let flag = Arc::clone(&timed_out);
            let token = cancel.clone();
            timeout_task = Some(tokio::spawn(async move {
                tokio::select! {
                    () = token.cancelled() => {}
                    () = tokio::time::sleep(limit) => {
                        flag.store(true, Ordering::SeqCst);
                        token.cancel();
                    }
                }
            }));
        }

        self.push_run_status(&dag, dag_run_id, &graph, &run_state, &ctx).await;
        self.log_run_event(&run_log_file, &format!("run {dag_run_id} started"));

        // onInit gates the whole run.
        let mut init_failed = false;
        if let Some(init_step) = &dag.handler_on.init {
            let snapshot = self
                .run_handler(&ctx, "onInit", init_step, Status::Running)
                .await;
            let failed = snapshot.status == NodeStatus::Failed
                || snapshot.status == NodeStatus::Aborted;
            run_state.handlers.lock().push(snapshot);
            if failed {
                init_failed = true;
                self.log_run_event(&run_log_file, "onInit handler failed; run aborted");
            }
        }

        let mut external_stop = false;
        if !init_failed {
            external_stop = self
                .drive_graph(&dag, &graph, &ctx, &run_state, &run_log_file)
                .await;
        }

        // Final status reduction.
        let final_status = aggregate_status(
            &graph,
            init_failed,
            external_stop,
            timed_out.load(Ordering::SeqCst),
        );
        *run_state.status.write() = final_status;

        // Handlers run after the graph with a fresh context so they
        // execute even on an aborted run.
        let handler_ctx = RunContext {
            cancel: CancellationToken::new(),
            hard_cancel: CancellationToken::new(),
            ..ctx.clone()
        };
        match final_status {
            Status::Succeeded | Status::PartiallySucceeded => {
                if let Some(step) = &dag.handler_on.success {
                    let snapshot = self
                        .run_handler(&handler_ctx, "onSuccess", step, final_status)
                        .await;
                    run_state.handlers.lock().push(snapshot);
                }
            }
            Status::Aborted => {
                if let Some(step) = &dag.handler_on.cancel {
                    let snapshot = self
                        .run_handler(&handler_ctx, "onCancel", step, final_status)
                        .await;
                    run_state.handlers.lock().push(snapshot);
                }
            }
            _ => {
                if let Some(step) = &dag.handler_on.failure {
                    let snapshot = self
                        .run_handler(&handler_ctx, "onFailure", step, final_status)
                        .await;
                    run_state.handlers.lock().push(snapshot);
                }
            }
        }
        // onExit always runs last; its failures never mutate the
        // already-computed status.
        if let Some(step) = &dag.handler_on.exit {
            let snapshot = self
                .run_handler(&handler_ctx, "onExit", step, final_status)
                .await;
            run_state.handlers.lock().push(snapshot);
        }

        *run_state.finished_at.write() = Some(Utc::now());
        self.write_outputs_file(&dag, dag_run_id, &ctx);
        self.record_metrics(final_status, &graph);
        self.log_run_event(
            &run_log_file,
            &format!("run {dag_run_id} finished with status {final_status}"),
        );

        self.push_run_status(&dag, dag_run_id, &graph, &run_state, &ctx).await;

        // Tear down background tasks.
        if let Some(task) = timeout_task {
            task.abort();
        }
        sock_shutdown.cancel();
        if let Some(task) = sock_task {
            let _ = task.await;
        }
        signal_task.abort();
        if let Some(forwarder) = ctx.log_forwarder.take() {
            drop(forwarder);
        }
        if let Some(task) = stream_task {
            match tokio::time::timeout(Duration::from_secs(5), task).await {
                Ok(Ok(Ok(_ack))) => {}
                Ok(Ok(Err(err))) => warn!("log stream close failed: {err}"),
                Ok(Err(err)) => warn!("log stream task failed: {err}"),
                Err(_) => warn!("log stream close timed out"),
            }
        }
        if let Some(log) = &run_log_file {
            let _ = log.close();
        }

        let handlers = run_state.handlers.lock().clone();
        Ok(RunReport {
            dag_run_id: dag_run_id.to_string(),
            status: final_status,
            nodes: graph.nodes().iter().map(|n| n.snapshot()).collect(),
            handlers,
            outputs: ctx
                .outputs
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        })
    }

    /// Main scheduling loop. Returns whether an external stop fired.
    async fn drive_graph(
        &self,
        dag: &Arc<Dag>,
        graph: &Arc<ExecutionGraph>,
        ctx: &RunContext,
        run_state: &Arc<RunState>,
        run_log: &Option<SharedWriter>,
    ) -> bool {
        let permits = if dag.max_active_steps == 0 {
            Semaphore::MAX_PERMITS
        } else {
            dag.max_active_steps
        };
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut join_set: JoinSet<usize> = JoinSet::new();
        let mut scheduled = vec![false; graph.len()];
        let mut cancel_handled = false;
        let mut hard_kill_task: Option<tokio::task::JoinHandle<()>> = None;

        loop {
            // Keep marking until the frontier stabilizes: a skip or block
            // can unlock decisions further downstream.
            loop {
                let mut progressed = false;
                for idx in 0..graph.len() {
                    if scheduled[idx] {
                        continue;
                    }
                    if ctx.cancel.is_cancelled() {
                        break;
                    }
                    match graph.readiness(idx) {
                        Readiness::Run => {
                            scheduled[idx] = true;
                            progressed = true;
                            let node = Arc::clone(graph.node(idx));
                            if node.is_router() {
                                node.prepare_router_input(graph.router_exit_code(idx));
                            }
                            let task_ctx = ctx.clone();
                            let permit_source = Arc::clone(&semaphore);
                            self.log_run_event(
                                run_log,
                                &format!("step {:?} scheduled", node.name()),
                            );
                            join_set.spawn(async move {
                                let Ok(_permit) = permit_source.acquire_owned().await else {
                                    return idx;
                                };
                                if task_ctx.cancel.is_cancelled()
                                    && node.status() == NodeStatus::NotStarted
                                {
                                    return idx;
                                }
                                node.run(&task_ctx).await;
                                idx
                            });
                        }
                        Readiness::Skip(cause) => {
                            scheduled[idx] = true;
                            progressed = true;
                            graph.node(idx).mark_skipped(cause);
                            self.log_run_event(
                                run_log,
                                &format!("step {:?} skipped", graph.node(idx).name()),
                            );
                        }
                        Readiness::Blocked => {
                            scheduled[idx] = true;
                            progressed = true;
                            graph.node(idx).mark_blocked();
                        }
                        Readiness::Wait => {}
                    }
                }
                if !progressed {
                    break;
                }
            }

            if join_set.is_empty() {
                break;
            }

            tokio::select! {
                joined = join_set.join_next() => {
                    if let Some(Ok(idx)) = joined {
                        let node = graph.node(idx);
                        self.log_run_event(
                            run_log,
                            &format!(
                                "step {:?} finished with status {}",
                                node.name(),
                                node.status()
                            ),
                        );
                        self.push_run_status(dag, &ctx.run_id, graph, run_state, ctx).await;
                    }
                }
                () = ctx.cancel.cancelled(), if !cancel_handled => {
                    cancel_handled = true;
                    info!(dag = %dag.name, "cancellation requested; signalling running steps");
                    for node in graph.nodes() {
                        if node.status() == NodeStatus::Running {
                            node.signal(SIGTERM, true);
                        }
                    }
                    let grace = dag.max_cleanup_time();
                    let hard = ctx.hard_cancel.clone();
                    let kill_graph = Arc::clone(graph);
                    hard_kill_task = Some(tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        hard.cancel();
                        for node in kill_graph.nodes() {
                            if node.status() == NodeStatus::Running {
                                node.signal(SIGKILL, false);
                            }
                        }
                    }));
                }
            }
        }

        if let Some(task) = hard_kill_task {
            task.abort();
        }
        cancel_handled || ctx.cancel.is_cancelled()
    }

    async fn check_run_preconditions(&self, dag: &Dag) -> bool {
        if dag.preconditions.is_empty() {
            return true;
        }
        let scope = EvalScope {
            dag_env: dag.env.clone().into_iter().collect(),
            ..EvalScope::default()
        };
        for condition in &dag.preconditions {
            match eval::eval_condition(&scope, condition).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(dag = %dag.name, condition = %condition.condition, "run precondition not met");
                    return false;
                }
                Err(err) => {
                    warn!(dag = %dag.name, "run precondition errored: {err}");
                    return false;
                }
            }
        }
        true
    }

    async fn run_handler(
        &self,
        ctx: &RunContext,
        hook: &str,
        step: &Step,
        run_status: Status,
    ) -> NodeSnapshot {
        let mut step = step.clone();
        step.env
            .insert("DAG_RUN_STATUS".to_string(), run_status.to_string());
        let node = Node::new(step);
        let status = node.run(ctx).await;
        if status == NodeStatus::Failed {
            warn!(hook, "handler failed");
        } else {
            debug!(hook, %status, "handler finished");
        }
        let mut snapshot = node.snapshot();
        snapshot.name = format!("{hook}:{}", snapshot.name);
        snapshot
    }

    fn open_run_log(&self, dag: &Dag, dag_run_id: &str) -> Result<Option<SharedWriter>> {
        let base = log_file_base(&dag.name, Utc::now(), dag_run_id);
        let path = log_file_path(&self.inner.config.log_dir, &base, ".run.log");
        match SharedWriter::open(&path) {
            Ok(writer) => Ok(Some(writer)),
            Err(err) => {
                warn!("run log unavailable: {err}");
                Ok(None)
            }
        }
    }

    fn log_run_event(&self, run_log: &Option<SharedWriter>, message: &str) {
        if let Some(writer) = run_log {
            let mut clone = writer.clone();
            use std::io::Write as _;
            let _ = writeln!(clone, "{} {message}", Utc::now().to_rfc3339());
        }
    }

    async fn push_run_status(
        &self,
        dag: &Arc<Dag>,
        dag_run_id: &str,
        graph: &Arc<ExecutionGraph>,
        run_state: &Arc<RunState>,
        ctx: &RunContext,
    ) {
        let Some(coordinator) = &self.inner.coordinator else {
            return;
        };
        let status = build_status(
            dag,
            dag_run_id,
            &self.inner.config.worker_id,
            graph,
            run_state,
            &ctx.outputs,
        );
        if let Err(err) = push_status(
            coordinator.as_ref(),
            &self.inner.config.worker_id,
            &self.inner.config.namespace,
            &status,
        )
        .await
        {
            // Surfaced but never retroactively changes node state.
            warn!(dag = %dag.name, "status push failed: {err}");
        }
    }

    fn write_outputs_file(&self, dag: &Dag, dag_run_id: &str, ctx: &RunContext) {
        if ctx.json_outputs.is_empty() {
            return;
        }
        let outputs: BTreeMap<String, String> = ctx
            .json_outputs
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let short_id: String = dag_run_id.chars().take(8).collect();
        let path = self
            .inner
            .config
            .log_dir
            .join(format!("{}.{short_id}.outputs.json", safe_name(&dag.name)));
        match serde_json::to_vec_pretty(&outputs) {
            Ok(json) => {
                if let Err(err) = std::fs::write(&path, json) {
                    warn!(?path, "outputs file write failed: {err}");
                }
            }
            Err(err) => warn!("outputs serialization failed: {err}"),
        }
    }

    fn record_metrics(&self, final_status: Status, graph: &ExecutionGraph) {
        self.inner.metrics.record_run(final_status.as_str());
        for node in graph.nodes() {
            let snapshot = node.snapshot();
            let duration = match (snapshot.started_at, snapshot.finished_at) {
                (Some(start), Some(end)) => (end - start).num_milliseconds() as f64 / 1000.0,
                _ => 0.0,
            };
            self.inner.metrics.record_step(
                snapshot.status.as_str(),
                node.step().executor_type(),
                duration.max(0.0),
            );
        }
    }
}

fn build_status(
    dag: &Dag,
    dag_run_id: &str,
    worker_id: &str,
    graph: &ExecutionGraph,
    run_state: &RunState,
    outputs: &DashMap<String, String>,
) -> DagRunStatus {
    DagRunStatus {
        name: dag.name.clone(),
        dag_run_id: dag_run_id.to_string(),
        status: *run_state.status.read(),
        worker_id: Some(worker_id.to_string()),
        attempt_id: Some(run_state.attempt_id.clone()),
        started_at: *run_state.started_at.read(),
        finished_at: *run_state.finished_at.read(),
        nodes: graph.nodes().iter().map(|n| n.snapshot()).collect(),
        handlers: run_state.handlers.lock().clone(),
        output_variables: outputs
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect(),
    }
}

/// Reduce node statuses into the run status.
///
/// External stops abort the run; timeouts fail it; any lingering failure
/// (continued or not) fails it; any partially-succeeded node marks the
/// whole run partial; skipped nodes never block success.
fn aggregate_status(
    graph: &ExecutionGraph,
    init_failed: bool,
    external_stop: bool,
    timed_out: bool,
) -> Status {
    if init_failed {
        return Status::Failed;
    }
    let mut any_failed = false;
    let mut any_aborted = false;
    let mut any_partial = false;
    for node in graph.nodes() {
        match node.status() {
            NodeStatus::Failed => any_failed = true,
            NodeStatus::Aborted => any_aborted = true,
            NodeStatus::PartiallySucceeded => any_partial = true,
            _ => {}
        }
    }
    if external_stop && !timed_out {
        return Status::Aborted;
    }
    if timed_out {
        return Status::Failed;
    }
    if any_aborted {
        return Status::Aborted;
    }
    if any_failed {
        return Status::Failed;
    }
    if any_partial {
        return Status::PartiallySucceeded;
    }
    Status::Succeeded
}
