//! Long-lived run daemon
//!
//! Sits between trigger sources (the cron matcher, the API, dispatched
//! jobs) and the scheduler: every trigger passes through the DAG's queue,
//! and when a run finishes the queue's parked runs replay serially.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use dagforge_common::error::Result;
use dagforge_core::dag::Dag;
use dagforge_core::status::Status;

use crate::queue::{Admission, RunQueue};
use crate::scheduler::{RunReport, Scheduler};

/// What happened to a submitted trigger
#[derive(Debug)]
pub enum SubmitOutcome {
    /// The run executed; parked runs that drained behind it are included
    /// in submission order.
    Completed(Vec<RunReport>),
    /// The queue was full and the overlap policy parked the run; it will
    /// execute when a slot frees.
    Parked,
    /// The queue was full and the overlap policy dropped the run.
    Rejected,
}

impl SubmitOutcome {
    /// Status to record for the trigger itself.
    #[must_use]
    pub fn trigger_status(&self) -> Status {
        match self {
            SubmitOutcome::Completed(reports) => {
                reports.first().map_or(Status::Succeeded, |r| r.status)
            }
            SubmitOutcome::Parked => Status::Queued,
            SubmitOutcome::Rejected => Status::Rejected,
        }
    }
}

/// Drives triggered runs through queue admission and the scheduler.
pub struct RunDaemon {
    scheduler: Scheduler,
    queue: Arc<RunQueue>,
    cancel: CancellationToken,
}

impl RunDaemon {
    #[must_use]
    pub fn new(scheduler: Scheduler, queue: Arc<RunQueue>) -> Self {
        Self {
            scheduler,
            queue,
            cancel: CancellationToken::new(),
        }
    }

    /// Token cancelling every run started by this daemon.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request shutdown: running DAGs receive the run-level cancel path.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Submit one trigger for a DAG.
    ///
    /// An admitted run executes to completion on this task; afterwards
    /// any parked runs of the same queue drain serially, so
    /// `OverlapPolicy::All` keeps overlapping runs strictly ordered.
    #[instrument(skip(self, dag), fields(dag = %dag.name, run_id = %dag_run_id))]
    pub async fn submit(&self, dag: Arc<Dag>, dag_run_id: &str) -> Result<SubmitOutcome> {
        match self.queue.try_admit(&dag, dag_run_id, Utc::now()) {
            Admission::Skipped => {
                info!("trigger dropped by overlap policy");
                Ok(SubmitOutcome::Rejected)
            }
            Admission::Queued => {
                info!("trigger parked behind an active run");
                Ok(SubmitOutcome::Parked)
            }
            Admission::Started => {
                let mut reports = Vec::new();
                let first = self
                    .scheduler
                    .run_with_cancel(Arc::clone(&dag), dag_run_id, self.cancel.child_token())
                    .await;
                match first {
                    Ok(report) => reports.push(report),
                    Err(err) => {
                        self.queue.release(&dag);
                        return Err(err);
                    }
                }

                // Drain parked runs serially; each release re-admits the
                // next one before we execute it.
                loop {
                    let Some(pending) = self.queue.release(&dag) else {
                        break;
                    };
                    if self.cancel.is_cancelled() {
                        warn!(run_id = %pending.dag_run_id, "parked run dropped at shutdown");
                        break;
                    }
                    let replay = self
                        .scheduler
                        .run_with_cancel(
                            Arc::clone(&dag),
                            &pending.dag_run_id,
                            self.cancel.child_token(),
                        )
                        .await;
                    match replay {
                        Ok(report) => reports.push(report),
                        Err(err) => {
                            warn!(run_id = %pending.dag_run_id, "parked run failed: {err}");
                            break;
                        }
                    }
                }
                Ok(SubmitOutcome::Completed(reports))
            }
        }
    }
}
