//! Schedule policies and scheduler watermark state
//!
//! The cron matcher that produces run triggers is an external
//! collaborator; these types define how missed and overlapping triggers
//! are handled and what the scheduler persists between restarts.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dagforge_common::error::Error;

/// One schedule entry on a DAG
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Schedule {
    pub expression: String,
}

/// Whether missed schedule ticks are replayed after downtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CatchupPolicy {
    #[default]
    Off,
    Latest,
    All,
}

impl CatchupPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CatchupPolicy::Off => "off",
            CatchupPolicy::Latest => "latest",
            CatchupPolicy::All => "all",
        }
    }
}

impl std::fmt::Display for CatchupPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CatchupPolicy {
    type Err = Error;

    /// Case-insensitive; legacy boolean spellings are accepted: `false`
    /// and empty mean `off`, `true` means `all`.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_lowercase().as_str() {
            "" | "off" | "false" => Ok(CatchupPolicy::Off),
            "latest" => Ok(CatchupPolicy::Latest),
            "all" | "true" => Ok(CatchupPolicy::All),
            other => Err(Error::Validation(format!(
                "unknown catchup policy {other:?}"
            ))),
        }
    }
}

/// What to do about ticks missed while the scheduler was down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum MisfirePolicy {
    #[default]
    Ignore,
    RunOnce,
    RunLatest,
    RunAll,
}

impl MisfirePolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MisfirePolicy::Ignore => "ignore",
            MisfirePolicy::RunOnce => "runOnce",
            MisfirePolicy::RunLatest => "runLatest",
            MisfirePolicy::RunAll => "runAll",
        }
    }
}

impl std::fmt::Display for MisfirePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MisfirePolicy {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_lowercase().as_str() {
            "" | "ignore" => Ok(MisfirePolicy::Ignore),
            "runonce" => Ok(MisfirePolicy::RunOnce),
            "runlatest" => Ok(MisfirePolicy::RunLatest),
            "runall" => Ok(MisfirePolicy::RunAll),
            other => Err(Error::Validation(format!(
                "unknown misfire policy {other:?}"
            ))),
        }
    }
}

/// Behavior when a schedule tick fires while a prior run is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    #[default]
    Skip,
    All,
}

impl OverlapPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OverlapPolicy::Skip => "skip",
            OverlapPolicy::All => "all",
        }
    }
}

impl std::fmt::Display for OverlapPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverlapPolicy {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_lowercase().as_str() {
            "" | "skip" => Ok(OverlapPolicy::Skip),
            "all" => Ok(OverlapPolicy::All),
            other => Err(Error::Validation(format!(
                "unknown overlap policy {other:?}"
            ))),
        }
    }
}

/// Current watermark state version
pub const SCHEDULER_STATE_VERSION: u32 = 1;

/// Per-DAG scheduling watermarks persisted by the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerState {
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_tick: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dags: BTreeMap<String, DateTime<Utc>>,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            version: SCHEDULER_STATE_VERSION,
            last_tick: None,
            dags: BTreeMap::new(),
        }
    }
}

impl SchedulerState {
    #[must_use]
    pub fn last_scheduled(&self, dag_name: &str) -> Option<DateTime<Utc>> {
        self.dags.get(dag_name).copied()
    }

    pub fn record(&mut self, dag_name: &str, at: DateTime<Utc>) {
        self.dags.insert(dag_name.to_string(), at);
        self.last_tick = Some(at.max(self.last_tick.unwrap_or(at)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catchup_round_trips() {
        for policy in [CatchupPolicy::Off, CatchupPolicy::Latest, CatchupPolicy::All] {
            assert_eq!(policy.as_str().parse::<CatchupPolicy>().unwrap(), policy);
        }
    }

    #[test]
    fn catchup_legacy_spellings() {
        assert_eq!("false".parse::<CatchupPolicy>().unwrap(), CatchupPolicy::Off);
        assert_eq!("true".parse::<CatchupPolicy>().unwrap(), CatchupPolicy::All);
        assert_eq!("".parse::<CatchupPolicy>().unwrap(), CatchupPolicy::Off);
        assert_eq!("LATEST".parse::<CatchupPolicy>().unwrap(), CatchupPolicy::Latest);
    }

    #[test]
    fn misfire_round_trips() {
        for policy in [
            MisfirePolicy::Ignore,
            MisfirePolicy::RunOnce,
            MisfirePolicy::RunLatest,
            MisfirePolicy::RunAll,
        ] {
            assert_eq!(policy.as_str().parse::<MisfirePolicy>().unwrap(), policy);
        }
    }

    #[test]
    fn overlap_defaults_to_skip() {
        assert_eq!("".parse::<OverlapPolicy>().unwrap(), OverlapPolicy::Skip);
        assert_eq!("all".parse::<OverlapPolicy>().unwrap(), OverlapPolicy::All);
    }

    #[test]
    fn state_records_watermarks() {
        let mut state = SchedulerState::default();
        assert_eq!(state.version, SCHEDULER_STATE_VERSION);
        let t0 = Utc::now();
        state.record("etl", t0);
        assert_eq!(state.last_scheduled("etl"), Some(t0));
        assert_eq!(state.last_scheduled("other"), None);
        assert_eq!(state.last_tick, Some(t0));
    }
}
