//! Run and node status enums plus status snapshots

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::step::SubDagRun;

/// Overall status of one DAG run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    NotStarted,
    Running,
    Failed,
    Aborted,
    Succeeded,
    Queued,
    PartiallySucceeded,
    Waiting,
    Rejected,
}

impl Status {
    /// A run that still occupies a slot in its queue.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Status::Running | Status::Queued | Status::Waiting)
    }

    /// Partial successes are never collapsed into plain success, but both
    /// count as a successful outcome for downstream gating.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Status::Succeeded | Status::PartiallySucceeded)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Status::NotStarted => "not_started",
            Status::Running => "running",
            Status::Failed => "failed",
            Status::Aborted => "aborted",
            Status::Succeeded => "succeeded",
            Status::Queued => "queued",
            Status::PartiallySucceeded => "partially_succeeded",
            Status::Waiting => "waiting",
            Status::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one node (step instance) within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    NotStarted,
    Running,
    Failed,
    Aborted,
    Succeeded,
    Queued,
    PartiallySucceeded,
    Waiting,
    Rejected,
    Skipped,
}

impl NodeStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Failed
                | NodeStatus::Aborted
                | NodeStatus::Succeeded
                | NodeStatus::PartiallySucceeded
                | NodeStatus::Rejected
                | NodeStatus::Skipped
        )
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, NodeStatus::Succeeded | NodeStatus::PartiallySucceeded)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::NotStarted => "not_started",
            NodeStatus::Running => "running",
            NodeStatus::Failed => "failed",
            NodeStatus::Aborted => "aborted",
            NodeStatus::Succeeded => "succeeded",
            NodeStatus::Queued => "queued",
            NodeStatus::PartiallySucceeded => "partially_succeeded",
            NodeStatus::Waiting => "waiting",
            NodeStatus::Rejected => "rejected",
            NodeStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time snapshot of one node, suitable for status reporting
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    pub name: String,
    pub status: NodeStatus,
    pub exit_code: i32,
    pub retry_count: u32,
    pub repeat_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_file: Option<String>,
    /// Nested runs launched by this node's sub-DAG or fan-out.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_runs: Vec<SubDagRun>,
}

/// Full status snapshot of a DAG run, pushed to the coordinator on every
/// status change and served from the control socket.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DagRunStatus {
    pub name: String,
    pub dag_run_id: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub nodes: Vec<NodeSnapshot>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handlers: Vec<NodeSnapshot>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_variables: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_statuses() {
        for status in [Status::Running, Status::Queued, Status::Waiting] {
            assert!(status.is_active(), "{status} should be active");
        }
        for status in [
            Status::NotStarted,
            Status::Failed,
            Status::Aborted,
            Status::Succeeded,
            Status::PartiallySucceeded,
            Status::Rejected,
        ] {
            assert!(!status.is_active(), "{status} should not be active");
        }
    }

    #[test]
    fn success_statuses() {
        assert!(Status::Succeeded.is_success());
        assert!(Status::PartiallySucceeded.is_success());
        assert!(!Status::Failed.is_success());
        assert!(!Status::Running.is_success());
    }

    #[test]
    fn node_terminal_statuses() {
        assert!(NodeStatus::Skipped.is_terminal());
        assert!(NodeStatus::PartiallySucceeded.is_terminal());
        assert!(!NodeStatus::Running.is_terminal());
        assert!(!NodeStatus::NotStarted.is_terminal());
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&Status::PartiallySucceeded).unwrap();
        assert_eq!(json, "\"partially_succeeded\"");
        let back: Status = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Status::PartiallySucceeded);
    }
}
