//! Run admission and overlap control
//!
//! Each DAG's runs pass through a named queue. A queue admits up to the
//! DAG's `max_active_runs` (default: one, runs are serial per queue).
//! When a new trigger fires while the queue is full, the overlap policy
//! decides: `skip` drops the trigger, `all` parks it and replays it
//! FIFO as slots free up.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use priority_queue::PriorityQueue;

use dagforge_common::metrics::MetricsCollector;
use dagforge_core::dag::Dag;
use dagforge_core::schedule::OverlapPolicy;

/// Outcome of an admission attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A slot was free; the caller starts the run now.
    Started,
    /// The queue is full and the overlap policy parks the run.
    Queued,
    /// The queue is full and the overlap policy drops the run.
    Skipped,
}

/// Priority wrapper ordering parked runs oldest-first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueOrder {
    enqueued_ms: i64,
}

impl Ord for QueueOrder {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // PriorityQueue pops the maximum; older runs must win.
        other.enqueued_ms.cmp(&self.enqueued_ms)
    }
}

impl PartialOrd for QueueOrder {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A run waiting for a queue slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRun {
    pub dag_name: String,
    pub dag_run_id: String,
    pub enqueued_at: DateTime<Utc>,
}

/// Tracks active and parked runs per queue
pub struct RunQueue {
    active: DashMap<String, usize>,
    pending: Mutex<HashMap<String, PriorityQueue<String, QueueOrder>>>,
    parked: DashMap<String, PendingRun>,
    metrics: Option<std::sync::Arc<dyn MetricsCollector>>,
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RunQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: DashMap::new(),
            pending: Mutex::new(HashMap::new()),
            parked: DashMap::new(),
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: std::sync::Arc<dyn MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn capacity_of(dag: &Dag) -> usize {
        if dag.max_active_runs == 0 {
            1
        } else {
            dag.max_active_runs
        }
    }

    fn record_gauge(&self, queue: &str) {
        if let Some(metrics) = &self.metrics {
            let count = self.active.get(queue).map_or(0, |e| *e.value());
            metrics.set_active_runs(queue, count as f64);
        }
    }

    /// Attempt to admit a run into its DAG's queue.
    pub fn try_admit(&self, dag: &Dag, dag_run_id: &str, at: DateTime<Utc>) -> Admission {
        let queue = dag.queue_name().to_string();
        let capacity = Self::capacity_of(dag);
        let mut entry = self.active.entry(queue.clone()).or_insert(0);
        if *entry < capacity {
            *entry += 1;
            drop(entry);
            self.record_gauge(&queue);
            return Admission::Started;
        }
        drop(entry);

        match dag.overlap_policy {
            OverlapPolicy::Skip => Admission::Skipped,
            OverlapPolicy::All => {
                let key = format!("{queue}/{dag_run_id}");
                self.parked.insert(
                    key,
                    PendingRun {
                        dag_name: dag.name.clone(),
                        dag_run_id: dag_run_id.to_string(),
                        enqueued_at: at,
                    },
                );
                self.pending
                    .lock()
                    .entry(queue)
                    .or_default()
                    .push(
                        dag_run_id.to_string(),
                        QueueOrder {
                            enqueued_ms: at.timestamp_millis(),
                        },
                    );
                Admission::Queued
            }
        }
    }

    /// Release a finished run's slot. Returns the next parked run of the
    /// same queue, already re-admitted, if one was waiting.
    pub fn release(&self, dag: &Dag) -> Option<PendingRun> {
        let queue = dag.queue_name().to_string();
        if let Some(mut entry) = self.active.get_mut(&queue) {
            *entry = entry.saturating_sub(1);
        }

        let next = {
            let mut pending = self.pending.lock();
            let q = pending.get_mut(&queue)?;
            let (run_id, _) = q.pop()?;
            Some(run_id)
        };
        let run_id = next?;
        let key = format!("{queue}/{run_id}");
        let parked = self.parked.remove(&key).map(|(_, run)| run);

        if parked.is_some() {
            if let Some(mut entry) = self.active.get_mut(&queue) {
                *entry += 1;
            }
        }
        self.record_gauge(&queue);
        parked
    }

    /// Runs currently active in a queue.
    #[must_use]
    pub fn active_count(&self, queue: &str) -> usize {
        self.active.get(queue).map_or(0, |e| *e.value())
    }

    /// Runs currently parked in a queue.
    #[must_use]
    pub fn pending_count(&self, queue: &str) -> usize {
        self.pending
            .lock()
            .get(queue)
            .map_or(0, PriorityQueue::len)
    }
}
