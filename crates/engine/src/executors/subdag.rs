//! Sub-DAG executor
//!
//! Runs one nested DAG through the scheduler-provided runner and surfaces
//! the child's outputs on the parent step's stdout.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use dagforge_common::error::{Error, Result};
use dagforge_core::executor::{ExecCtx, Executor, OutputSink, SubDagRunner};
use dagforge_core::status::NodeStatus;
use dagforge_core::step::{Step, SubDagRun};

/// Executor for a single nested DAG run
pub struct SubDagExecutor {
    child_name: String,
    runner: Option<Arc<dyn SubDagRunner>>,
    run: Mutex<Option<SubDagRun>>,
    stdout: Mutex<Option<OutputSink>>,
    result_status: Mutex<Option<NodeStatus>>,
    kill_token: CancellationToken,
}

impl SubDagExecutor {
    pub fn new(ctx: &ExecCtx, step: &Step) -> Result<Self> {
        let child_name = step
            .sub_dag
            .as_ref()
            .map(|s| s.name.clone())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                Error::Configuration(format!("step {:?}: sub-DAG name missing", step.name))
            })?;
        Ok(Self {
            child_name,
            runner: ctx.sub_runner.clone(),
            run: Mutex::new(None),
            stdout: Mutex::new(None),
            result_status: Mutex::new(None),
            kill_token: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl Executor for SubDagExecutor {
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let runner = self.runner.clone().ok_or_else(|| {
            Error::Configuration("no sub-DAG runner available in this context".to_string())
        })?;
        let run = self
            .run
            .lock()
            .clone()
            .ok_or_else(|| Error::Internal("sub-DAG run not bound".to_string()))?;

        // Propagate both parent cancellation and explicit kills.
        let linked = self.kill_token.clone();
        let parent = cancel.clone();
        let forward = tokio::spawn(async move {
            parent.cancelled().await;
            linked.cancel();
        });

        let report = runner
            .run_sub_dag(&self.child_name, &run, self.kill_token.child_token())
            .await;
        forward.abort();

        let report = report?;
        if let Some(writer) = self.stdout.lock().as_mut() {
            if let Ok(outputs) = serde_json::to_string(&report.outputs) {
                let _ = writeln!(writer, "{outputs}");
            }
        }

        let node_status = match report.status {
            s if s.is_success() => {
                if s == dagforge_core::status::Status::PartiallySucceeded {
                    NodeStatus::PartiallySucceeded
                } else {
                    NodeStatus::Succeeded
                }
            }
            dagforge_core::status::Status::Aborted => NodeStatus::Aborted,
            _ => NodeStatus::Failed,
        };
        *self.result_status.lock() = Some(node_status);

        if cancel.is_cancelled() {
            return Err(Error::Cancelled("sub-DAG run cancelled".to_string()));
        }
        if report.status.is_success() {
            Ok(())
        } else {
            Err(Error::Execution {
                code: 1,
                message: report
                    .error
                    .unwrap_or_else(|| format!("sub-DAG {:?} failed", self.child_name)),
            })
        }
    }

    fn set_stdout(&mut self, writer: OutputSink) {
        *self.stdout.lock() = Some(writer);
    }

    fn set_stderr(&mut self, _writer: OutputSink) {}

    fn kill(&self, _signal: i32) -> Result<()> {
        self.kill_token.cancel();
        Ok(())
    }

    fn determine_node_status(&self) -> Option<NodeStatus> {
        *self.result_status.lock()
    }

    fn set_sub_run(&mut self, run: SubDagRun) -> Result<()> {
        *self.run.lock() = Some(run);
        Ok(())
    }
}
