//! Watermark persistence and catch-up planning
//!
//! The scheduler records, per DAG, the last time a scheduled run was
//! fired. After downtime the catch-up window and misfire policy decide
//! which missed ticks are replayed. The cron matcher producing the tick
//! list is an external collaborator.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::warn;

use dagforge_common::error::{Error, Result};
use dagforge_core::dag::Dag;
use dagforge_core::schedule::{CatchupPolicy, MisfirePolicy, SchedulerState};

use crate::queue::{Admission, RunQueue};

/// Persistence boundary for scheduler watermarks. `save` is atomic; a
/// missing or corrupt store loads as a fresh version-1 state.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn load(&self) -> Result<SchedulerState>;
    async fn save(&self, state: &SchedulerState) -> Result<()>;
}

/// JSON-file-backed store with temp-file + rename atomicity
pub struct FileWatermarkStore {
    path: PathBuf,
}

impl FileWatermarkStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn load(&self) -> Result<SchedulerState> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SchedulerState::default());
            }
            Err(err) => return Err(Error::Io(err)),
        };
        match serde_json::from_slice::<SchedulerState>(&bytes) {
            Ok(state) => Ok(state),
            Err(err) => {
                warn!(path = ?self.path, "corrupt watermark store, starting fresh: {err}");
                Ok(SchedulerState::default())
            }
        }
    }

    async fn save(&self, state: &SchedulerState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state)?;
        let dir = self
            .path
            .parent()
            .map(std::path::Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        tokio::fs::create_dir_all(&dir).await?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            std::io::Write::write_all(&mut tmp, &json)?;
            tmp.persist(&path)
                .map_err(|e| Error::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Internal(format!("watermark save task failed: {e}")))?
    }
}

/// In-memory store for tests and single-shot runs
#[derive(Default)]
pub struct InMemoryWatermarkStore {
    state: Mutex<SchedulerState>,
}

#[async_trait]
impl WatermarkStore for InMemoryWatermarkStore {
    async fn load(&self) -> Result<SchedulerState> {
        Ok(self.state.lock().clone())
    }

    async fn save(&self, state: &SchedulerState) -> Result<()> {
        *self.state.lock() = state.clone();
        Ok(())
    }
}

/// Misfire policy effectively in force for a DAG: an explicit policy
/// wins; otherwise the legacy catchup flag maps onto one.
#[must_use]
pub fn resolved_misfire_policy(dag: &Dag) -> MisfirePolicy {
    if dag.misfire_policy != MisfirePolicy::Ignore {
        return dag.misfire_policy;
    }
    match dag.catchup_policy {
        CatchupPolicy::Off => MisfirePolicy::Ignore,
        CatchupPolicy::Latest => MisfirePolicy::RunLatest,
        CatchupPolicy::All => MisfirePolicy::RunAll,
    }
}

/// Select which missed ticks are replayed.
///
/// Ticks outside the catch-up window are always dropped. `Ignore`
/// replays nothing; `RunOnce` replays the earliest missed tick;
/// `RunLatest` the most recent; `RunAll` every one, oldest first.
#[must_use]
pub fn plan_catchup(
    missed: &[DateTime<Utc>],
    policy: MisfirePolicy,
    window: Option<Duration>,
    now: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    let mut in_window: Vec<DateTime<Utc>> = missed
        .iter()
        .copied()
        .filter(|tick| match window {
            Some(window) => {
                let age = now.signed_duration_since(*tick);
                age.to_std().map_or(true, |age| age <= window)
            }
            None => true,
        })
        .collect();
    in_window.sort_unstable();

    match policy {
        MisfirePolicy::Ignore => Vec::new(),
        MisfirePolicy::RunOnce => in_window.into_iter().take(1).collect(),
        MisfirePolicy::RunLatest => in_window.into_iter().last().into_iter().collect(),
        MisfirePolicy::RunAll => in_window,
    }
}

/// Deterministic run ID for a scheduled tick of a DAG.
#[must_use]
pub fn scheduled_run_id(dag_name: &str, tick: DateTime<Utc>) -> String {
    format!(
        "{:x}",
        md5::compute(format!("{dag_name}:{}", tick.timestamp_millis()))
    )
}

/// Replay a DAG's missed schedule ticks through its queue.
///
/// Ticks selected by the misfire policy are admitted one by one; the
/// overlap policy decides what happens when the queue is already full.
/// The watermark advances past every observed tick, fired or not, so a
/// restart does not reconsider the same misfires.
pub async fn replay_missed_ticks(
    dag: &Dag,
    missed: &[DateTime<Utc>],
    now: DateTime<Utc>,
    store: &dyn WatermarkStore,
    queue: &RunQueue,
) -> Result<Vec<(DateTime<Utc>, Admission)>> {
    let policy = resolved_misfire_policy(dag);
    let window = dag.catchup_window_duration();
    let ticks = plan_catchup(missed, policy, window, now);

    let mut outcomes = Vec::with_capacity(ticks.len());
    for tick in ticks {
        let run_id = scheduled_run_id(&dag.name, tick);
        let admission = queue.try_admit(dag, &run_id, tick);
        outcomes.push((tick, admission));
    }

    if let Some(latest) = missed.iter().max() {
        let mut state = store.load().await?;
        state.record(&dag.name, *latest);
        store.save(&state).await?;
    }
    Ok(outcomes)
}
