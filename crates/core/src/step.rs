//! Declarative step model

use std::collections::BTreeMap;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use dagforge_common::error::Error;

use crate::condition::Condition;
use crate::policy::{ContinueOn, RepeatPolicy, RetryPolicy};

/// Separator used in the pre-split command form. Arguments joined with
/// this marker survive evaluation without shell-style re-tokenization.
pub const CMD_ARG_SEPARATOR: char = '\u{1f}';

/// Step IDs must look like identifiers and stay clear of the variable
/// namespace reserved for the evaluator.
static ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new("^[A-Za-z][A-Za-z0-9_-]*$").unwrap());

pub const RESERVED_IDS: &[&str] = &[
    "env", "params", "args", "stdout", "stderr", "output", "outputs",
];

/// One command of a step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Command {
    pub command: String,
    pub args: Vec<String>,
    /// Display string; also the evaluation source when args are not
    /// pre-split.
    pub cmd_with_args: String,
    /// Pre-split form joined with [`CMD_ARG_SEPARATOR`].
    pub cmd_args_sys: String,
}

impl Command {
    #[must_use]
    pub fn shell_string(command: impl Into<String>) -> Self {
        let cmd_with_args = command.into();
        Self {
            cmd_with_args,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_args(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            ..Self::default()
        }
    }
}

/// Executor selection plus free-form configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutorConfig {
    #[serde(rename = "type")]
    pub type_name: String,
    pub config: serde_json::Value,
    pub metadata: BTreeMap<String, String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            type_name: String::new(),
            config: serde_json::Value::Null,
            metadata: BTreeMap::new(),
        }
    }
}

impl ExecutorConfig {
    /// Resolved executor type; the default executor runs commands.
    #[must_use]
    pub fn executor_type(&self) -> &str {
        if self.type_name.is_empty() {
            "command"
        } else {
            &self.type_name
        }
    }
}

/// Reference to a nested DAG launched by a step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SubDag {
    pub name: String,
    /// Parameter template, evaluated per item when the step is parallel.
    pub params: String,
}

/// One nested run derived from a step's sub-DAG configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubDagRun {
    pub dag_run_id: String,
    pub params: String,
    #[serde(default)]
    pub repeated: bool,
}

/// Hard cap on expanded parallel items
pub const MAX_PARALLEL_ITEMS: usize = 1000;

fn default_max_concurrent() -> usize {
    10
}

/// Fan-out configuration for a parallel step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ParallelConfig {
    /// Variable reference resolved at run time into the item list.
    pub variable: String,
    /// Literal items; each either a scalar value or a parameter map.
    pub items: Vec<ParallelItem>,
    pub max_concurrent: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            variable: String::new(),
            items: Vec::new(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl ParallelConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.variable.is_empty() && self.items.is_empty() {
            return Err(Error::Validation(
                "parallel requires either a variable or items".to_string(),
            ));
        }
        if self.max_concurrent == 0 {
            return Err(Error::Validation(
                "parallel maxConcurrent must be greater than 0".to_string(),
            ));
        }
        if self.items.len() > MAX_PARALLEL_ITEMS {
            return Err(Error::Validation(format!(
                "parallel items exceed the cap of {MAX_PARALLEL_ITEMS}"
            )));
        }
        Ok(())
    }
}

/// One declared parallel item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParallelItem {
    Value(String),
    Params(BTreeMap<String, serde_json::Value>),
}

/// Destination layout for a step's stdout/stderr
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    /// Distinct `.out` and `.err` files
    #[default]
    Separate,
    /// A single `.log` file with interleaved writes
    Merged,
}

/// Router step mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RouterMode {
    #[default]
    #[serde(rename = "exclusive")]
    Exclusive,
    #[serde(rename = "multi-select")]
    MultiSelect,
}

/// Pattern-routed activation of downstream steps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RouterConfig {
    /// Template expression evaluated once when the router runs.
    pub value: String,
    /// Pattern → target step names, insertion-ordered.
    pub routes: IndexMap<String, Vec<String>>,
    pub mode: RouterMode,
    /// Targets fired when no route matches.
    pub default: Vec<String>,
}

/// Container settings for a step or DAG
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContainerConfig {
    pub image: String,
    pub pull_policy: String,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<String>,
    pub work_dir: String,
    pub user: String,
}

/// LLM invocation settings carried on agent/chat steps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub prompt: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

/// Agent-loop settings for `agent`-typed steps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    pub instructions: String,
    pub max_iterations: u32,
    pub tools: Vec<String>,
}

/// A single unit of work within a DAG
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Step {
    pub name: String,
    /// Optional stable identifier usable in `depends` references.
    pub id: String,
    pub description: String,
    pub env: BTreeMap<String, String>,
    pub commands: Vec<Command>,
    pub script: String,
    pub shell: String,
    pub shell_args: Vec<String>,
    pub dir: String,
    pub executor: ExecutorConfig,
    pub depends: Vec<String>,
    pub preconditions: Vec<Condition>,
    pub continue_on: ContinueOn,
    pub retry_policy: RetryPolicy,
    pub repeat_policy: RepeatPolicy,
    /// Signal name sent to the executor on stop (default SIGTERM).
    pub signal_on_stop: String,
    pub sub_dag: Option<SubDag>,
    pub parallel: Option<ParallelConfig>,
    /// Redirect files, layered on top of the run log files.
    pub stdout: String,
    pub stderr: String,
    pub log_output: Option<LogOutput>,
    /// Name of the output variable capturing this step's stdout.
    pub output: String,
    /// camelCase rewrite applied to the captured output key.
    pub output_key: String,
    /// Exclude the captured output from the shared outputs file.
    pub output_omit: bool,
    pub worker_selector: BTreeMap<String, String>,
    pub timeout_sec: u64,
    pub container: Option<ContainerConfig>,
    pub router: Option<RouterConfig>,
    pub llm: Option<LlmConfig>,
    pub agent: Option<AgentConfig>,
}

impl Step {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn has_id(&self) -> bool {
        !self.id.is_empty()
    }

    /// Shell for this step, falling back to `$SHELL` then `sh`.
    #[must_use]
    pub fn effective_shell(&self) -> String {
        if !self.shell.is_empty() {
            return self.shell.clone();
        }
        std::env::var("SHELL").unwrap_or_else(|_| "sh".to_string())
    }

    /// Executor type driving this step. An explicit type wins; otherwise
    /// the step shape selects the parallel, sub-DAG or router engine,
    /// falling back to the command executor.
    #[must_use]
    pub fn executor_type(&self) -> &str {
        if !self.executor.type_name.is_empty() {
            return &self.executor.type_name;
        }
        if self.parallel.is_some() {
            return "parallel";
        }
        if self.sub_dag.is_some() {
            return "dag";
        }
        if self.router.is_some() {
            return "router";
        }
        "command"
    }

    /// Structural checks local to one step; graph-level invariants live in
    /// DAG validation.
    pub fn validate(&self) -> Vec<Error> {
        let mut errors = Vec::new();
        if self.name.is_empty() {
            errors.push(Error::Validation("step name must not be empty".to_string()));
        }
        if self.has_id() {
            if !ID_PATTERN.is_match(&self.id) {
                errors.push(Error::Validation(format!(
                    "step {:?}: id {:?} must match ^[A-Za-z][A-Za-z0-9_-]*$",
                    self.name, self.id
                )));
            }
            if RESERVED_IDS.contains(&self.id.as_str()) {
                errors.push(Error::Validation(format!(
                    "step {:?}: id {:?} is reserved",
                    self.name, self.id
                )));
            }
        }
        if let Some(parallel) = &self.parallel {
            if let Err(err) = parallel.validate() {
                errors.push(Error::Validation(format!("step {:?}: {err}", self.name)));
            }
            if self.sub_dag.is_none() {
                errors.push(Error::Validation(format!(
                    "step {:?}: parallel requires a sub-DAG",
                    self.name
                )));
            }
        }
        if let Some(router) = &self.router {
            if router.value.is_empty() {
                errors.push(Error::Validation(format!(
                    "step {:?}: router requires a value expression",
                    self.name
                )));
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ids_pass() {
        for id in ["build", "Step_1", "a-b-c", "X9"] {
            let mut step = Step::named("s");
            step.id = id.to_string();
            assert!(step.validate().is_empty(), "{id} should be valid");
        }
    }

    #[test]
    fn invalid_ids_fail() {
        for id in ["1abc", "-dash", "with space", "env", "outputs"] {
            let mut step = Step::named("s");
            step.id = id.to_string();
            assert!(!step.validate().is_empty(), "{id} should be rejected");
        }
    }

    #[test]
    fn parallel_without_source_is_rejected() {
        let mut step = Step::named("fanout");
        step.parallel = Some(ParallelConfig::default());
        step.sub_dag = Some(SubDag {
            name: "child".to_string(),
            params: String::new(),
        });
        assert!(!step.validate().is_empty());
    }

    #[test]
    fn parallel_requires_sub_dag() {
        let mut step = Step::named("fanout");
        step.parallel = Some(ParallelConfig {
            items: vec![ParallelItem::Value("a".to_string())],
            ..ParallelConfig::default()
        });
        assert!(!step.validate().is_empty());
    }

    #[test]
    fn executor_type_defaults_to_command() {
        let step = Step::named("s");
        assert_eq!(step.executor.executor_type(), "command");
    }

    #[test]
    fn executor_type_inferred_from_shape() {
        let mut step = Step::named("s");
        step.router = Some(RouterConfig::default());
        assert_eq!(step.executor_type(), "router");

        step.sub_dag = Some(SubDag {
            name: "child".to_string(),
            params: String::new(),
        });
        assert_eq!(step.executor_type(), "dag");

        step.parallel = Some(ParallelConfig::default());
        assert_eq!(step.executor_type(), "parallel");

        step.executor.type_name = "docker".to_string();
        assert_eq!(step.executor_type(), "docker");
    }

    #[test]
    fn explicit_shell_wins() {
        let mut step = Step::named("s");
        step.shell = "bash".to_string();
        assert_eq!(step.effective_shell(), "bash");
    }

    #[test]
    fn parallel_items_deserialize_both_shapes() {
        let config: ParallelConfig = serde_json::from_str(
            r#"{"items": ["a", {"REGION": "eu"}], "maxConcurrent": 2}"#,
        )
        .unwrap();
        assert_eq!(config.items.len(), 2);
        assert!(matches!(config.items[0], ParallelItem::Value(_)));
        assert!(matches!(config.items[1], ParallelItem::Params(_)));
        assert_eq!(config.max_concurrent, 2);
    }

    #[test]
    fn parallel_default_concurrency_is_ten() {
        let config: ParallelConfig = serde_json::from_str(r#"{"variable": "${ITEMS}"}"#).unwrap();
        assert_eq!(config.max_concurrent, 10);
    }
}
