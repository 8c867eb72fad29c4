//! Executor contract and capability records
//!
//! Executors are pluggable runners behind a common contract; optional
//! behaviors (exit codes, status overrides, sub-DAG binding) are default
//! methods rather than an inheritance tree. Dispatch is a registry
//! lookup.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use dagforge_common::error::{Error, Result};

use crate::status::{NodeStatus, Status};
use crate::step::{Step, SubDagRun};

/// Output sink wired into an executor before it runs.
pub type OutputSink = Box<dyn Write + Send>;

/// The common executor contract.
///
/// `run` takes `&self`: executors keep their mutable run state behind
/// interior mutability so `kill` can reach a running instance from the
/// signal path.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute the step once. Cancellation of the token must interrupt
    /// the work promptly.
    async fn run(&self, cancel: CancellationToken) -> Result<()>;

    /// Wire the stdout sink. Called once before `run`.
    fn set_stdout(&mut self, writer: OutputSink);

    /// Wire the stderr sink. Called once before `run`.
    fn set_stderr(&mut self, writer: OutputSink);

    /// Forward a signal to the running work.
    fn kill(&self, signal: i32) -> Result<()>;

    /// Exit code of the last run, when the executor tracks one.
    fn exit_code(&self) -> Option<i32> {
        None
    }

    /// Override the node status derived from the run result. Used by the
    /// parallel executor to report partial success.
    fn determine_node_status(&self) -> Option<NodeStatus> {
        None
    }

    /// Bind a single nested run. Only sub-DAG-capable executors accept
    /// this.
    fn set_sub_run(&mut self, _run: SubDagRun) -> Result<()> {
        Err(Error::Configuration(
            "executor does not support sub-DAG runs".to_string(),
        ))
    }

    /// Bind the full fan-out list. Only parallel-capable executors accept
    /// this.
    fn set_sub_runs(&mut self, _runs: Vec<SubDagRun>) -> Result<()> {
        Err(Error::Configuration(
            "executor does not support parallel sub-DAG runs".to_string(),
        ))
    }
}

/// Result of one nested DAG run
#[derive(Debug, Clone)]
pub struct SubDagReport {
    pub dag_run_id: String,
    pub status: Status,
    pub outputs: BTreeMap<String, String>,
    pub error: Option<String>,
}

/// Launches nested DAG runs on behalf of sub-DAG and parallel executors.
/// Implemented by the scheduler; injected through [`ExecCtx`].
#[async_trait]
pub trait SubDagRunner: Send + Sync {
    async fn run_sub_dag(
        &self,
        name: &str,
        run: &SubDagRun,
        cancel: CancellationToken,
    ) -> Result<SubDagReport>;
}

/// Per-step execution context handed to executor factories.
#[derive(Clone, Default)]
pub struct ExecCtx {
    pub dag_name: String,
    pub dag_run_id: String,
    pub shell: String,
    pub shell_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Fully-resolved environment published to the step process.
    pub env: Vec<(String, String)>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    pub max_output_size: usize,
    pub sub_runner: Option<Arc<dyn SubDagRunner>>,
}

impl ExecCtx {
    /// Shell binary, falling back to `$SHELL` then `sh`.
    #[must_use]
    pub fn effective_shell(&self) -> String {
        if !self.shell.is_empty() {
            return self.shell.clone();
        }
        std::env::var("SHELL").unwrap_or_else(|_| "sh".to_string())
    }
}

/// Capability flags consulted by build-time checks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub command: bool,
    pub multiple_commands: bool,
    pub script: bool,
    pub shell: bool,
    pub container: bool,
    pub sub_dag: bool,
    pub worker_selector: bool,
    pub llm: bool,
}

/// Evaluation flags contributed by an executor type. OS-environment
/// expansion is always withheld regardless of these flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalPolicy {
    pub only_replace_vars: bool,
    pub without_expand_shell: bool,
}

/// Constructs an executor instance for an evaluated step.
pub type ExecutorFactory =
    Arc<dyn Fn(&ExecCtx, &Step) -> Result<Box<dyn Executor>> + Send + Sync>;

/// Build-time validation hook for a step of this executor type.
pub type StepValidator = Arc<dyn Fn(&Step) -> Result<()> + Send + Sync>;
