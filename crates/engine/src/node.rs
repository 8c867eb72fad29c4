//! Per-step node runtime
//!
//! A node drives one step through its lifecycle: preconditions, IO setup,
//! command evaluation, executor runs with retry and repeat policies,
//! output capture, continue-on classification and teardown. The owning
//! step task is the only mutator; observers read snapshots through the
//! state lock.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dagforge_common::error::{Error, Result};
use dagforge_common::fileutil::log_file_base;
use dagforge_common::signals::{is_termination_signal, signal_from_name, SIGTERM};
use dagforge_core::dag::Dag;
use dagforge_core::executor::{ExecCtx, Executor, SubDagRunner};
use dagforge_core::policy::RepeatMode;
use dagforge_core::registry;
use dagforge_core::status::{NodeSnapshot, NodeStatus};
use dagforge_core::step::{Command, Step, SubDagRun, CMD_ARG_SEPARATOR};

use crate::dispatch::LogForwarder;
use crate::eval::{self, EvalOptions, EvalScope};
use crate::logio::{open_redirect, NodeLog, SharedWriter, TeeWriter};
use crate::router::{compile_router, CompiledRouter};
use crate::subrun::build_sub_runs;

/// Exit code recorded when a step exceeds its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Why a node ended up skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipCause {
    /// A precondition returned false or errored.
    Precondition,
    /// A router upstream did not select this step.
    RouterUnselected,
    /// Every successful path to this step was skipped.
    Cascade,
}

/// Shared context of one DAG run, passed to every node task.
#[derive(Clone)]
pub struct RunContext {
    pub dag: Arc<Dag>,
    pub run_id: String,
    pub log_dir: PathBuf,
    /// Scheduler-level run log, published to steps as `DAG_RUN_LOG_FILE`.
    pub run_log_file: Option<PathBuf>,
    /// Output variables captured by earlier steps.
    pub outputs: Arc<DashMap<String, String>>,
    /// Outputs destined for the shared outputs file, key-rewritten and
    /// with omitted entries already filtered.
    pub json_outputs: Arc<DashMap<String, String>>,
    /// Graceful stop: scheduling halts, policy sleeps return, executors
    /// keep running until signalled or hard-cancelled.
    pub cancel: CancellationToken,
    /// Hard kill: running executors terminate their work immediately.
    /// Fired by the scheduler once the cleanup grace period expires.
    pub hard_cancel: CancellationToken,
    pub sub_runner: Option<Arc<dyn SubDagRunner>>,
    pub log_forwarder: Option<Arc<LogForwarder>>,
    pub worker_id: Option<String>,
}

#[derive(Debug, Default)]
struct NodeState {
    status: NodeStatus,
    exit_code: i32,
    retry_count: u32,
    done_count: u32,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    stdout_path: Option<PathBuf>,
    stderr_path: Option<PathBuf>,
    continue_matched: Option<bool>,
    status_override: Option<NodeStatus>,
    router_targets: Option<Vec<String>>,
    router_exit_code: i32,
    skip_cause: Option<SkipCause>,
    sub_runs: Vec<SubDagRun>,
    output_value: Option<String>,
    /// The node will never run in this pass: a dependency failed or
    /// aborted without releasing it. Distinct from terminal states; the
    /// status stays NotStarted.
    blocked: bool,
}

/// Runtime instance of one step within one run
pub struct Node {
    step: Step,
    state: RwLock<NodeState>,
    log: Mutex<Option<NodeLog>>,
    stdout_redirect: Mutex<Option<SharedWriter>>,
    stderr_redirect: Mutex<Option<SharedWriter>>,
    evaluated: OnceCell<Step>,
    compiled_router: OnceCell<CompiledRouter>,
    active_executor: Mutex<Option<Arc<dyn Executor>>>,
}

impl Node {
    #[must_use]
    pub fn new(step: Step) -> Self {
        Self {
            step,
            state: RwLock::new(NodeState::default()),
            log: Mutex::new(None),
            stdout_redirect: Mutex::new(None),
            stderr_redirect: Mutex::new(None),
            evaluated: OnceCell::new(),
            compiled_router: OnceCell::new(),
            active_executor: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn step(&self) -> &Step {
        &self.step
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.step.name
    }

    #[must_use]
    pub fn status(&self) -> NodeStatus {
        self.state.read().status
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.state.read().exit_code
    }

    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.state.read().retry_count
    }

    #[must_use]
    pub fn skip_cause(&self) -> Option<SkipCause> {
        self.state.read().skip_cause
    }

    /// Whether a failed/skipped node released its successors; `None`
    /// before classification ran.
    #[must_use]
    pub fn continue_matched(&self) -> Option<bool> {
        self.state.read().continue_matched
    }

    /// Targets chosen by this node's router, once it has run.
    #[must_use]
    pub fn router_targets(&self) -> Option<Vec<String>> {
        self.state.read().router_targets.clone()
    }

    #[must_use]
    pub fn is_router(&self) -> bool {
        self.step.router.is_some()
    }

    /// Supply the exit-code input for a router step before it runs.
    pub fn prepare_router_input(&self, exit_code: i32) {
        self.state.write().router_exit_code = exit_code;
    }

    /// Mark the node permanently unschedulable; it stays NotStarted.
    pub fn mark_blocked(&self) {
        self.state.write().blocked = true;
    }

    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.state.read().blocked
    }

    /// Mark the node skipped without running it (router deactivation or
    /// skip cascade).
    pub fn mark_skipped(&self, cause: SkipCause) {
        let mut state = self.state.write();
        if !state.status.is_terminal() {
            state.status = NodeStatus::Skipped;
            state.skip_cause = Some(cause);
            state.finished_at = Some(Utc::now());
        }
    }

    /// Point-in-time snapshot for status reporting.
    #[must_use]
    pub fn snapshot(&self) -> NodeSnapshot {
        let state = self.state.read();
        NodeSnapshot {
            name: self.step.name.clone(),
            status: state.status,
            exit_code: state.exit_code,
            retry_count: state.retry_count,
            repeat_count: state.done_count,
            error: state.error.clone(),
            started_at: state.started_at,
            finished_at: state.finished_at,
            stdout_file: state.stdout_path.as_ref().map(|p| p.display().to_string()),
            stderr_file: state.stderr_path.as_ref().map(|p| p.display().to_string()),
            sub_runs: state.sub_runs.clone(),
        }
    }

    /// Forward a signal to the running executor.
    ///
    /// With `allow_override`, a step-declared `signal_on_stop` replaces
    /// the requested signal. Termination signals transition the node to
    /// `Aborted`; an aborted node never becomes successful afterwards.
    pub fn signal(&self, signal: i32, allow_override: bool) {
        let actual = if allow_override {
            signal_from_name(&self.step.signal_on_stop).unwrap_or(signal)
        } else {
            signal
        };
        let executor = self.active_executor.lock().clone();
        if let Some(executor) = executor {
            if let Err(err) = executor.kill(actual) {
                warn!(step = %self.step.name, signal = actual, "signal delivery failed: {err}");
            }
        }
        if is_termination_signal(signal) {
            let mut state = self.state.write();
            if state.status == NodeStatus::Running {
                state.status = NodeStatus::Aborted;
            }
        }
    }

    fn eval_scope(&self, ctx: &RunContext) -> EvalScope {
        EvalScope {
            step_env: self.step.env.clone().into_iter().collect(),
            outputs: Arc::clone(&ctx.outputs),
            dag_env: ctx.dag.env.clone().into_iter().collect(),
            shell: self.step.shell.clone(),
            shell_args: self.step.shell_args.clone(),
        }
    }

    fn set_failed(&self, exit_code: i32, message: String) {
        let mut state = self.state.write();
        if state.status != NodeStatus::Aborted {
            state.status = NodeStatus::Failed;
        }
        state.exit_code = exit_code;
        state.error = Some(message);
    }

    /// Execute the node lifecycle once, returning the final status.
    pub async fn run(&self, ctx: &RunContext) -> NodeStatus {
        // Preconditions gate everything, including IO setup.
        let scope = self.eval_scope(ctx);
        for condition in &self.step.preconditions {
            match eval::eval_condition(&scope, condition).await {
                Ok(true) => {}
                Ok(false) => {
                    let message = condition
                        .error_message
                        .clone()
                        .unwrap_or_else(|| format!("condition {:?} not met", condition.condition));
                    self.finish_skipped(SkipCause::Precondition, message);
                    return self.status();
                }
                Err(err) => {
                    self.finish_skipped(SkipCause::Precondition, err.to_string());
                    return self.status();
                }
            }
        }

        if let Err(err) = self.setup(ctx) {
            self.set_failed(1, format!("setup failed: {err}"));
            self.finish(ctx);
            return self.status();
        }

        {
            let mut state = self.state.write();
            state.status = NodeStatus::Running;
            state.started_at = Some(Utc::now());
        }

        if self.is_router() {
            self.run_router(ctx).await;
        } else {
            self.run_with_policies(ctx).await;
        }

        self.capture_output(ctx);
        self.classify_continue(ctx);
        self.finish(ctx);
        self.status()
    }

    fn finish_skipped(&self, cause: SkipCause, message: String) {
        let mut state = self.state.write();
        state.status = NodeStatus::Skipped;
        state.skip_cause = Some(cause);
        state.error = Some(message);
        state.finished_at = Some(Utc::now());
    }

    fn setup(&self, ctx: &RunContext) -> Result<()> {
        let base = log_file_base(&self.step.name, Utc::now(), &ctx.run_id);
        let mode = ctx.dag.effective_log_output(&self.step);
        let mut log = NodeLog::open(&ctx.log_dir, &base, mode)?;
        log.start_flusher();
        {
            let mut state = self.state.write();
            state.stdout_path = Some(log.stdout_path());
            state.stderr_path = Some(log.stderr_path());
        }
        if !self.step.stdout.is_empty() {
            *self.stdout_redirect.lock() =
                Some(open_redirect(&self.step.stdout, self.working_dir().as_deref())?);
        }
        if !self.step.stderr.is_empty() {
            *self.stderr_redirect.lock() =
                Some(open_redirect(&self.step.stderr, self.working_dir().as_deref())?);
        }
        *self.log.lock() = Some(log);
        Ok(())
    }

    fn working_dir(&self) -> Option<PathBuf> {
        if self.step.dir.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.step.dir))
        }
    }

    async fn run_router(&self, ctx: &RunContext) {
        let Some(config) = &self.step.router else {
            return;
        };
        let compiled = match self
            .compiled_router
            .get_or_try_init(|| compile_router(config))
        {
            Ok(compiled) => compiled,
            Err(err) => {
                self.set_failed(1, format!("router compile failed: {err}"));
                return;
            }
        };

        let scope = self.eval_scope(ctx);
        let exit_code = self.state.read().router_exit_code;
        let opts = EvalOptions::default().without_os_env_expansion();
        let value = match eval::eval_string(&scope, &config.value, &opts).await {
            Ok(value) => value,
            Err(err) => {
                self.set_failed(1, err.to_string());
                return;
            }
        };
        let value = if value == "@exitCode" {
            exit_code.to_string()
        } else {
            value
        };

        match compiled.select(&value, exit_code) {
            Ok(targets) => {
                if let Some(log) = self.log.lock().as_mut() {
                    let _ = writeln!(log.stdout, "{}", targets.join("\n"));
                }
                let mut state = self.state.write();
                state.router_targets = Some(targets);
                if state.status != NodeStatus::Aborted {
                    state.status = NodeStatus::Succeeded;
                    state.exit_code = 0;
                }
            }
            Err(err) => self.set_failed(1, format!("router evaluation failed: {err}")),
        }
    }

    async fn run_with_policies(&self, ctx: &RunContext) {
        let retry_policy = match self.effective_retry_policy(ctx).await {
            Ok(policy) => policy,
            Err(err) => {
                self.set_failed(1, err.to_string());
                return;
            }
        };
        let repeat_policy = self.step.repeat_policy.clone();

        loop {
            // Retry loop: one executor attempt per pass.
            loop {
                if ctx.cancel.is_cancelled() {
                    self.abort_with("run cancelled");
                    return;
                }
                match self.execute_once(ctx).await {
                    Ok(()) => {
                        let mut state = self.state.write();
                        if state.status != NodeStatus::Aborted {
                            state.status =
                                state.status_override.take().unwrap_or(NodeStatus::Succeeded);
                            state.exit_code = 0;
                            state.error = None;
                        }
                        break;
                    }
                    Err(Error::Cancelled(message)) => {
                        self.abort_with(&message);
                        return;
                    }
                    Err(err) => {
                        let code = err.exit_code().unwrap_or(1);
                        {
                            let mut state = self.state.write();
                            state.exit_code = code;
                            state.error = Some(err.to_string());
                            if let Some(overridden) = state.status_override.take() {
                                state.status = overridden;
                                if overridden.is_success() {
                                    break;
                                }
                            }
                        }
                        if self.status() == NodeStatus::Aborted {
                            return;
                        }
                        let attempted = self.retry_count();
                        if retry_policy.enabled()
                            && retry_policy.should_retry(code)
                            && attempted < retry_policy.limit
                        {
                            let delay = retry_policy.delay(attempted + 1);
                            debug!(
                                step = %self.step.name,
                                attempt = attempted + 1,
                                ?delay,
                                "retrying after exit code {code}"
                            );
                            if !self.sleep_cancellable(ctx, delay).await {
                                self.abort_with("cancelled during retry wait");
                                return;
                            }
                            self.state.write().retry_count += 1;
                            continue;
                        }
                        let mut state = self.state.write();
                        if state.status != NodeStatus::Aborted
                            && !state.status.is_success()
                        {
                            state.status = NodeStatus::Failed;
                        }
                        break;
                    }
                }
            }

            // Repeat loop: proceed only after terminal success or an
            // honored continue-on.
            if !repeat_policy.enabled() {
                return;
            }
            let status = self.status();
            let proceed = status.is_success()
                || (status == NodeStatus::Failed && self.evaluate_continue(ctx));
            if !proceed {
                return;
            }
            let executions = self.state.read().done_count + 1;
            if repeat_policy.limit > 0 && executions >= repeat_policy.limit {
                return;
            }
            let should_repeat = match self.repeat_decision(ctx, &repeat_policy).await {
                Ok(decision) => decision,
                Err(err) => {
                    warn!(step = %self.step.name, "repeat condition failed: {err}");
                    false
                }
            };
            if !should_repeat {
                return;
            }
            let delay = repeat_policy.delay(executions);
            if !self.sleep_cancellable(ctx, delay).await {
                self.abort_with("cancelled during repeat wait");
                return;
            }
            let mut state = self.state.write();
            state.done_count += 1;
            state.status = NodeStatus::Running;
            state.continue_matched = None;
            state.error = None;
        }
    }

    async fn repeat_decision(
        &self,
        ctx: &RunContext,
        policy: &dagforge_core::policy::RepeatPolicy,
    ) -> Result<bool> {
        let holds = if let Some(condition) = &policy.condition {
            eval::eval_condition(&self.eval_scope(ctx), condition).await?
        } else if !policy.exit_code.is_empty() {
            policy.exit_code.contains(&self.exit_code())
        } else {
            // Unconditional while-repeat, bounded only by the limit.
            true
        };
        Ok(match policy.repeat_mode {
            Some(RepeatMode::While) => holds,
            Some(RepeatMode::Until) => !holds,
            None => false,
        })
    }

    /// Returns false if cancellation fired during the sleep.
    async fn sleep_cancellable(&self, ctx: &RunContext, delay: Duration) -> bool {
        if delay.is_zero() {
            return !ctx.cancel.is_cancelled();
        }
        tokio::select! {
            () = ctx.cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    fn abort_with(&self, message: &str) {
        let mut state = self.state.write();
        state.status = NodeStatus::Aborted;
        if state.error.is_none() {
            state.error = Some(message.to_string());
        }
    }

    async fn effective_retry_policy(
        &self,
        ctx: &RunContext,
    ) -> Result<dagforge_core::policy::RetryPolicy> {
        let mut policy = self.step.retry_policy.clone();
        let scope = self.eval_scope(ctx);
        let opts = EvalOptions::default().without_os_env_expansion();
        if let Some(limit_str) = &policy.limit_str {
            let evaluated = eval::eval_string(&scope, limit_str, &opts).await?;
            policy.limit = evaluated.trim().parse().map_err(|_| {
                Error::Evaluation(format!("retry limit {evaluated:?} is not a number"))
            })?;
        }
        if let Some(interval_str) = &policy.interval_sec_str {
            let evaluated = eval::eval_string(&scope, interval_str, &opts).await?;
            policy.interval_sec = evaluated.trim().parse().map_err(|_| {
                Error::Evaluation(format!("retry interval {evaluated:?} is not a number"))
            })?;
        }
        Ok(policy)
    }

    async fn execute_once(&self, ctx: &RunContext) -> Result<()> {
        let evaluated = self.evaluated_step(ctx).await?;
        let exec_ctx = self.build_exec_ctx(ctx, &evaluated);
        let mut executor = registry::create_executor(&exec_ctx, &evaluated)?;

        executor.set_stdout(self.stdout_sink(ctx)?);
        executor.set_stderr(self.stderr_sink(ctx)?);

        if evaluated.sub_dag.is_some() {
            let (repeated, iteration) = {
                let state = self.state.read();
                (state.done_count > 0, state.done_count)
            };
            let scope = self.eval_scope(ctx);
            let runs =
                build_sub_runs(&scope, &evaluated, &ctx.run_id, repeated, iteration).await?;
            self.state.write().sub_runs = runs.clone();
            if evaluated.parallel.is_some() {
                executor.set_sub_runs(runs)?;
            } else if let Some(run) = runs.into_iter().next() {
                executor.set_sub_run(run)?;
            }
        }

        let executor: Arc<dyn Executor> = Arc::from(executor);
        *self.active_executor.lock() = Some(Arc::clone(&executor));

        let run_result = if self.step.timeout_sec > 0 {
            let limit = Duration::from_secs(self.step.timeout_sec);
            match tokio::time::timeout(limit, executor.run(ctx.hard_cancel.child_token())).await {
                Ok(result) => result,
                Err(_) => {
                    let _ = executor.kill(SIGTERM);
                    Err(Error::Execution {
                        code: TIMEOUT_EXIT_CODE,
                        message: format!("step timed out after {}s", self.step.timeout_sec),
                    })
                }
            }
        } else {
            executor.run(ctx.hard_cancel.child_token()).await
        };

        if let Some(status) = executor.determine_node_status() {
            self.state.write().status_override = Some(status);
        }
        *self.active_executor.lock() = None;

        match run_result {
            Ok(()) => Ok(()),
            Err(Error::Cancelled(message)) => Err(Error::Cancelled(message)),
            Err(err) => {
                let code = executor.exit_code().or(err.exit_code()).unwrap_or(1);
                Err(Error::Execution {
                    code,
                    message: err.to_string(),
                })
            }
        }
    }

    /// Command evaluation runs once per node instance and is reused by
    /// retries and repeats.
    async fn evaluated_step(&self, ctx: &RunContext) -> Result<Step> {
        if let Some(step) = self.evaluated.get() {
            return Ok(step.clone());
        }
        let evaluated = self.evaluate_step(ctx).await?;
        Ok(self.evaluated.get_or_init(|| evaluated).clone())
    }

    async fn evaluate_step(&self, ctx: &RunContext) -> Result<Step> {
        let mut step = self.step.clone();
        let scope = self.eval_scope(ctx);
        let executor_type = step.executor_type().to_string();
        let policy = registry::eval_policy(&executor_type);
        let is_command = executor_type == "command";

        let mut opts = EvalOptions::default().without_os_env_expansion();
        if policy.only_replace_vars {
            opts = opts.only_replace_vars();
        }
        if policy.without_expand_shell {
            opts = opts.without_expand_shell();
        }

        let mut commands = Vec::with_capacity(step.commands.len());
        for command in &step.commands {
            commands.push(self.evaluate_command(&scope, command, is_command, &opts).await?);
        }
        step.commands = commands;

        if !step.script.is_empty() {
            let script_opts = if is_command {
                // Shell expansion is deferred to the shell itself.
                EvalOptions::default()
                    .without_os_env_expansion()
                    .only_replace_vars()
            } else {
                opts.clone()
            };
            step.script = eval::eval_string(&scope, &step.script, &script_opts).await?;
        }

        if !step.executor.config.is_null() {
            step.executor.config =
                eval::eval_object(&scope, &step.executor.config, &opts).await?;
        }

        Ok(step)
    }

    async fn evaluate_command(
        &self,
        scope: &EvalScope,
        command: &Command,
        is_command_executor: bool,
        opts: &EvalOptions,
    ) -> Result<Command> {
        let mut out = command.clone();

        if !command.cmd_args_sys.is_empty() {
            let mut parts = command.cmd_args_sys.split(CMD_ARG_SEPARATOR);
            let head = parts.next().unwrap_or_default();
            out.command = eval::eval_string(scope, head, opts).await?;
            let mut args = Vec::new();
            for part in parts {
                args.push(eval::eval_string(scope, part, opts).await?);
            }
            out.args = args;
            if is_command_executor {
                let joined = shlex::try_join(out.args.iter().map(String::as_str))
                    .map_err(|e| Error::Evaluation(format!("command join failed: {e}")))?;
                out.cmd_with_args = if joined.is_empty() {
                    out.command.clone()
                } else {
                    format!("{} {joined}", out.command)
                };
            }
            return Ok(out);
        }

        if !command.cmd_with_args.is_empty() {
            let whole = eval::eval_string(scope, &command.cmd_with_args, opts).await?;
            if is_command_executor {
                // Passed through as a shell string.
                out.cmd_with_args = whole;
                out.command.clear();
                out.args.clear();
            } else {
                let mut parts = shlex::split(&whole).ok_or_else(|| {
                    Error::Evaluation(format!("cannot split command line {whole:?}"))
                })?;
                if parts.is_empty() {
                    return Err(Error::Evaluation("empty command line".to_string()));
                }
                out.command = parts.remove(0);
                out.args = parts;
                out.cmd_with_args = whole;
            }
            return Ok(out);
        }

        out.command = eval::eval_string(scope, &command.command, opts).await?;
        let mut args = Vec::new();
        for arg in &command.args {
            args.push(eval::eval_string(scope, arg, opts).await?);
        }
        out.args = args;
        Ok(out)
    }

    fn build_exec_ctx(&self, ctx: &RunContext, evaluated: &Step) -> ExecCtx {
        let state = self.state.read();
        ExecCtx {
            dag_name: ctx.dag.name.clone(),
            dag_run_id: ctx.run_id.clone(),
            shell: evaluated.shell.clone(),
            shell_args: evaluated.shell_args.clone(),
            working_dir: self.working_dir(),
            env: self.publish_env(ctx, &state),
            stdout_path: state.stdout_path.clone(),
            stderr_path: state.stderr_path.clone(),
            max_output_size: ctx.dag.max_output_size(),
            sub_runner: ctx.sub_runner.clone(),
        }
    }

    fn publish_env(&self, ctx: &RunContext, state: &NodeState) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = vec![
            ("DAG_NAME".to_string(), ctx.dag.name.clone()),
            ("DAG_RUN_ID".to_string(), ctx.run_id.clone()),
            ("DAG_RUN_STEP_NAME".to_string(), self.step.name.clone()),
        ];
        if let Some(run_log) = &ctx.run_log_file {
            env.push(("DAG_RUN_LOG_FILE".to_string(), run_log.display().to_string()));
        }
        if let Some(path) = &state.stdout_path {
            env.push((
                "DAG_RUN_STEP_STDOUT_FILE".to_string(),
                path.display().to_string(),
            ));
        }
        if let Some(path) = &state.stderr_path {
            env.push((
                "DAG_RUN_STEP_STDERR_FILE".to_string(),
                path.display().to_string(),
            ));
        }
        for (key, value) in &ctx.dag.env {
            env.push((key.clone(), value.clone()));
        }
        for (key, value) in &self.step.env {
            env.push((key.clone(), value.clone()));
        }
        for entry in ctx.outputs.iter() {
            env.push((entry.key().clone(), entry.value().clone()));
        }
        env
    }

    fn stdout_sink(&self, ctx: &RunContext) -> Result<Box<dyn Write + Send>> {
        let log = self.log.lock();
        let base = log
            .as_ref()
            .map(|l| l.stdout.clone())
            .ok_or_else(|| Error::Internal("node log not open".to_string()))?;
        drop(log);
        let mut sink: Box<dyn Write + Send> = Box::new(base);
        if let Some(redirect) = self.stdout_redirect.lock().clone() {
            sink = Box::new(TeeWriter::new(sink, Box::new(redirect)));
        }
        if let Some(forwarder) = &ctx.log_forwarder {
            sink = Box::new(TeeWriter::new(
                sink,
                Box::new(forwarder.stdout_writer(&self.step.name)),
            ));
        }
        Ok(sink)
    }

    fn stderr_sink(&self, ctx: &RunContext) -> Result<Box<dyn Write + Send>> {
        let log = self.log.lock();
        let base = log
            .as_ref()
            .map(|l| l.stderr.clone())
            .ok_or_else(|| Error::Internal("node log not open".to_string()))?;
        drop(log);
        let mut sink: Box<dyn Write + Send> = Box::new(base);
        if let Some(redirect) = self.stderr_redirect.lock().clone() {
            sink = Box::new(TeeWriter::new(sink, Box::new(redirect)));
        }
        if let Some(forwarder) = &ctx.log_forwarder {
            sink = Box::new(TeeWriter::new(
                sink,
                Box::new(forwarder.stderr_writer(&self.step.name)),
            ));
        }
        Ok(sink)
    }

    fn capture_output(&self, ctx: &RunContext) {
        if self.step.output.is_empty() {
            return;
        }
        let log = self.log.lock();
        let Some(log) = log.as_ref() else { return };
        match log.stdout.read_to_string_capped(ctx.dag.max_output_size()) {
            Ok(raw) => {
                let value = raw.trim_end_matches('\n').to_string();
                self.state.write().output_value = Some(value.clone());
                ctx.outputs.insert(self.step.output.clone(), value.clone());
                if !self.step.output_omit {
                    let key = if self.step.output_key.is_empty() {
                        self.step.output.clone()
                    } else {
                        to_camel_case(&self.step.output_key)
                    };
                    ctx.json_outputs.insert(key, value);
                }
            }
            Err(err) => {
                warn!(step = %self.step.name, "output capture failed: {err}");
            }
        }
    }

    /// Whether the node's continue-on policy releases its successors.
    /// Computed once and cached; `mark_success` rewrites the status here.
    fn classify_continue(&self, ctx: &RunContext) {
        let status = self.status();
        match status {
            NodeStatus::Failed => {
                let matched = self.evaluate_continue(ctx);
                let mut state = self.state.write();
                state.continue_matched = Some(matched);
                if matched && self.step.continue_on.mark_success {
                    state.status = NodeStatus::Succeeded;
                }
            }
            NodeStatus::Skipped => {
                let mut state = self.state.write();
                state.continue_matched = Some(self.step.continue_on.skipped);
            }
            _ => {}
        }
    }

    fn evaluate_continue(&self, ctx: &RunContext) -> bool {
        if let Some(cached) = self.state.read().continue_matched {
            return cached;
        }
        let continue_on = &self.step.continue_on;
        if !continue_on.is_set() {
            return false;
        }
        if continue_on.failure {
            return true;
        }
        if continue_on.exit_code.contains(&self.exit_code()) {
            return true;
        }
        if continue_on.output.is_empty() {
            return false;
        }
        let log = self.log.lock();
        let Some(log) = log.as_ref() else {
            return false;
        };
        let Ok(stdout) = log.stdout.read_to_string_capped(ctx.dag.max_output_size()) else {
            return false;
        };
        for pattern in &continue_on.output {
            if let Some(expr) = pattern.strip_prefix("regexp:") {
                match Regex::new(expr) {
                    Ok(regex) => {
                        if stdout.lines().any(|line| regex.is_match(line)) {
                            return true;
                        }
                    }
                    Err(err) => {
                        warn!(step = %self.step.name, "bad continue-on pattern {expr:?}: {err}");
                    }
                }
            } else if stdout.lines().any(|line| line.contains(pattern.as_str())) {
                return true;
            }
        }
        false
    }

    fn finish(&self, _ctx: &RunContext) {
        if let Some(log) = self.log.lock().as_mut() {
            let _ = log.close();
        }
        if let Some(redirect) = self.stdout_redirect.lock().as_ref() {
            let _ = redirect.close();
        }
        if let Some(redirect) = self.stderr_redirect.lock().as_ref() {
            let _ = redirect.close();
        }
        let mut state = self.state.write();
        if state.finished_at.is_none() {
            state.finished_at = Some(Utc::now());
        }
    }
}

/// Rewrite `snake_case` / `kebab-case` keys as camelCase.
#[must_use]
pub fn to_camel_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut upper_next = false;
    for ch in input.chars() {
        if ch == '_' || ch == '-' {
            upper_next = true;
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_scope_with(key: &str, value: &str) -> EvalScope {
        let mut scope = EvalScope::default();
        scope.dag_env.insert(key.to_string(), value.to_string());
        scope
    }

    #[tokio::test]
    async fn presplit_commands_evaluate_per_argument() {
        let node = Node::new(Step::named("eval"));
        let scope = eval_scope_with("TARGET", "prod");
        let opts = EvalOptions::default().without_os_env_expansion();
        let command = Command {
            cmd_args_sys: format!(
                "deploy{sep}--target{sep}${{TARGET}}",
                sep = CMD_ARG_SEPARATOR
            ),
            ..Command::default()
        };
        let out = node
            .evaluate_command(&scope, &command, true, &opts)
            .await
            .unwrap();
        assert_eq!(out.command, "deploy");
        assert_eq!(out.args, vec!["--target", "prod"]);
        assert_eq!(out.cmd_with_args, "deploy --target prod");
    }

    #[tokio::test]
    async fn whole_string_commands_split_for_non_shell_executors() {
        let node = Node::new(Step::named("eval"));
        let scope = eval_scope_with("TARGET", "prod");
        let opts = EvalOptions::default().without_os_env_expansion();
        let command = Command::shell_string("docker run ${TARGET}");

        let split = node
            .evaluate_command(&scope, &command, false, &opts)
            .await
            .unwrap();
        assert_eq!(split.command, "docker");
        assert_eq!(split.args, vec!["run", "prod"]);

        // The command executor receives the line as a shell string.
        let passthrough = node
            .evaluate_command(&scope, &command, true, &opts)
            .await
            .unwrap();
        assert!(passthrough.command.is_empty());
        assert_eq!(passthrough.cmd_with_args, "docker run prod");
    }

    #[tokio::test]
    async fn explicit_command_and_args_evaluate_independently() {
        let node = Node::new(Step::named("eval"));
        let scope = eval_scope_with("TARGET", "prod");
        let opts = EvalOptions::default().without_os_env_expansion();
        let command = Command::with_args(
            "kubectl",
            vec!["apply".to_string(), "-f".to_string(), "${TARGET}.yaml".to_string()],
        );
        let out = node
            .evaluate_command(&scope, &command, true, &opts)
            .await
            .unwrap();
        assert_eq!(out.command, "kubectl");
        assert_eq!(out.args, vec!["apply", "-f", "prod.yaml"]);
    }

    #[test]
    fn camel_case_rewrite() {
        assert_eq!(to_camel_case("build_result"), "buildResult");
        assert_eq!(to_camel_case("build-result-code"), "buildResultCode");
        assert_eq!(to_camel_case("already"), "already");
    }

    #[test]
    fn aborted_node_never_becomes_successful() {
        let node = Node::new(Step::named("s"));
        {
            let mut state = node.state.write();
            state.status = NodeStatus::Running;
        }
        node.signal(SIGTERM, false);
        assert_eq!(node.status(), NodeStatus::Aborted);

        // A late success classification must not override the abort.
        {
            let mut state = node.state.write();
            if state.status != NodeStatus::Aborted {
                state.status = NodeStatus::Succeeded;
            }
        }
        assert_eq!(node.status(), NodeStatus::Aborted);
    }

    #[test]
    fn mark_skipped_respects_terminal_states() {
        let node = Node::new(Step::named("s"));
        node.mark_skipped(SkipCause::RouterUnselected);
        assert_eq!(node.status(), NodeStatus::Skipped);
        assert_eq!(node.skip_cause(), Some(SkipCause::RouterUnselected));

        let done = Node::new(Step::named("t"));
        done.state.write().status = NodeStatus::Succeeded;
        done.mark_skipped(SkipCause::Cascade);
        assert_eq!(done.status(), NodeStatus::Succeeded);
    }

    #[test]
    fn snapshot_reflects_state() {
        let node = Node::new(Step::named("snap"));
        {
            let mut state = node.state.write();
            state.status = NodeStatus::Failed;
            state.exit_code = 3;
            state.retry_count = 2;
            state.error = Some("boom".to_string());
        }
        let snapshot = node.snapshot();
        assert_eq!(snapshot.name, "snap");
        assert_eq!(snapshot.status, NodeStatus::Failed);
        assert_eq!(snapshot.exit_code, 3);
        assert_eq!(snapshot.retry_count, 2);
        assert_eq!(snapshot.error.as_deref(), Some("boom"));
    }
}
