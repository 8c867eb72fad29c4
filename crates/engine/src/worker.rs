//! Worker-side dispatch handling
//!
//! A worker accepts jobs pushed by the coordinator: each job carries the
//! compiled DAG blob and run parameters. Execution goes through the same
//! scheduler as local runs; status and logs flow back through the
//! coordinator contracts wired into the scheduler.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use dagforge_common::error::{Error, Result};
use dagforge_core::dag::Dag;

use crate::dispatch::DispatchJob;
use crate::scheduler::{apply_params, RunReport, Scheduler};

/// Executes coordinator-dispatched jobs on this process.
pub struct Worker {
    worker_id: String,
    scheduler: Scheduler,
}

impl Worker {
    #[must_use]
    pub fn new(worker_id: impl Into<String>, scheduler: Scheduler) -> Self {
        Self {
            worker_id: worker_id.into(),
            scheduler,
        }
    }

    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Accept and execute one dispatched job.
    ///
    /// The DAG blob is parsed and validated before the job is considered
    /// accepted; a malformed blob is a configuration error the
    /// coordinator sees immediately.
    #[instrument(skip(self, job), fields(worker = %self.worker_id, run_id = %job.dag_run_id))]
    pub async fn handle_dispatch(&self, job: DispatchJob) -> Result<RunReport> {
        let dag: Dag = serde_json::from_value(job.dag)
            .map_err(|e| Error::Configuration(format!("malformed DAG blob: {e}")))?;
        Scheduler::validate(&dag)?;
        let dag = apply_params(&dag, &job.params);
        info!(dag = %dag.name, "job accepted");
        self.scheduler.run(dag, &job.dag_run_id).await
    }

    /// Like [`Worker::handle_dispatch`] under an externally-owned
    /// cancellation token, so the coordinator can withdraw a job.
    pub async fn handle_dispatch_with_cancel(
        &self,
        job: DispatchJob,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let dag: Dag = serde_json::from_value(job.dag)
            .map_err(|e| Error::Configuration(format!("malformed DAG blob: {e}")))?;
        Scheduler::validate(&dag)?;
        let dag = apply_params(&dag, &job.params);
        self.scheduler
            .run_with_cancel(dag, &job.dag_run_id, cancel)
            .await
    }
}

/// Convenience constructor joining a scheduler with its worker identity.
#[must_use]
pub fn local_worker(scheduler: Scheduler, worker_id: &str) -> Arc<Worker> {
    Arc::new(Worker::new(worker_id, scheduler))
}
