//! Parallel fan-out executor
//!
//! Spawns one nested run per bound item, gated by a semaphore sized to
//! the step's `maxConcurrent`, and always emits an aggregated JSON
//! summary on stdout, partial failures included.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use dagforge_common::error::{Error, Result};
use dagforge_core::executor::{ExecCtx, Executor, OutputSink, SubDagRunner};
use dagforge_core::status::{NodeStatus, Status};
use dagforge_core::step::{Step, SubDagRun};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChildResult {
    dag_run_id: String,
    params: String,
    status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct Summary {
    total: usize,
    succeeded: usize,
    failed: usize,
}

#[derive(Debug, Serialize)]
struct Aggregate {
    summary: Summary,
    results: Vec<ChildResult>,
    outputs: Vec<BTreeMap<String, String>>,
}

/// Executor fanning a sub-DAG out over parallel items
pub struct ParallelExecutor {
    child_name: String,
    max_concurrent: usize,
    runner: Option<Arc<dyn SubDagRunner>>,
    runs: Mutex<Vec<SubDagRun>>,
    stdout: Mutex<Option<OutputSink>>,
    node_status: Mutex<Option<NodeStatus>>,
    kill_token: CancellationToken,
}

impl ParallelExecutor {
    pub fn new(ctx: &ExecCtx, step: &Step) -> Result<Self> {
        let child_name = step
            .sub_dag
            .as_ref()
            .map(|s| s.name.clone())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                Error::Configuration(format!("step {:?}: sub-DAG name missing", step.name))
            })?;
        let max_concurrent = step
            .parallel
            .as_ref()
            .map_or(10, |p| p.max_concurrent.max(1));
        Ok(Self {
            child_name,
            max_concurrent,
            runner: ctx.sub_runner.clone(),
            runs: Mutex::new(Vec::new()),
            stdout: Mutex::new(None),
            node_status: Mutex::new(None),
            kill_token: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl Executor for ParallelExecutor {
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let runner = self.runner.clone().ok_or_else(|| {
            Error::Configuration("no sub-DAG runner available in this context".to_string())
        })?;
        let runs = self.runs.lock().clone();
        if runs.is_empty() {
            return Err(Error::Internal("parallel runs not bound".to_string()));
        }

        let linked = self.kill_token.clone();
        let parent = cancel.clone();
        let forward = tokio::spawn(async move {
            parent.cancelled().await;
            linked.cancel();
        });

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut join_set = JoinSet::new();
        for (idx, run) in runs.iter().cloned().enumerate() {
            let runner = Arc::clone(&runner);
            let semaphore = Arc::clone(&semaphore);
            let child_name = self.child_name.clone();
            let token = self.kill_token.child_token();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = runner.run_sub_dag(&child_name, &run, token).await;
                (idx, run, result)
            });
        }

        let mut slots: Vec<Option<(SubDagRun, Result<dagforge_core::executor::SubDagReport>)>> =
            (0..runs.len()).map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, run, result)) => slots[idx] = Some((run, result)),
                Err(err) => {
                    // A panicked child task counts as a failed run; the
                    // slot keeps its None and is reported below.
                    tracing::warn!("parallel child task failed: {err}");
                }
            }
        }
        forward.abort();

        let mut results = Vec::with_capacity(runs.len());
        let mut outputs = Vec::new();
        let mut succeeded = 0usize;
        let mut all_clean = true;
        for (idx, slot) in slots.into_iter().enumerate() {
            match slot {
                Some((run, Ok(report))) => {
                    if report.status.is_success() {
                        succeeded += 1;
                        if report.status != Status::Succeeded {
                            all_clean = false;
                        }
                        outputs.push(report.outputs.clone());
                    } else {
                        all_clean = false;
                    }
                    results.push(ChildResult {
                        dag_run_id: run.dag_run_id,
                        params: run.params,
                        status: report.status,
                        error: report.error,
                    });
                }
                Some((run, Err(err))) => {
                    all_clean = false;
                    results.push(ChildResult {
                        dag_run_id: run.dag_run_id,
                        params: run.params,
                        status: Status::Failed,
                        error: Some(err.to_string()),
                    });
                }
                None => {
                    all_clean = false;
                    results.push(ChildResult {
                        dag_run_id: runs[idx].dag_run_id.clone(),
                        params: runs[idx].params.clone(),
                        status: Status::Failed,
                        error: Some("child task aborted".to_string()),
                    });
                }
            }
        }

        let total = results.len();
        let aggregate = Aggregate {
            summary: Summary {
                total,
                succeeded,
                failed: total - succeeded,
            },
            results,
            outputs,
        };
        if let Some(writer) = self.stdout.lock().as_mut() {
            if let Ok(json) = serde_json::to_string(&aggregate) {
                let _ = writeln!(writer, "{json}");
            }
            let _ = writer.flush();
        }

        let status = if succeeded == total && all_clean {
            NodeStatus::Succeeded
        } else if succeeded > 0 {
            NodeStatus::PartiallySucceeded
        } else {
            NodeStatus::Failed
        };
        *self.node_status.lock() = Some(status);

        if cancel.is_cancelled() {
            return Err(Error::Cancelled("parallel run cancelled".to_string()));
        }
        match status {
            NodeStatus::Succeeded => Ok(()),
            _ => Err(Error::Execution {
                code: 1,
                message: format!(
                    "{} of {total} parallel runs failed",
                    total - succeeded
                ),
            }),
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
        *self.node_status.lock()
    }

    fn set_sub_runs(&mut self, runs: Vec<SubDagRun>) -> Result<()> {
        *self.runs.lock() = runs;
        Ok(())
    }
}
