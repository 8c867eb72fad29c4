//! Compiled workflow model and build-time validation

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use once_cell::sync::Lazy;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use regex::Regex;
use secrecy::Secret;
use serde::{Deserialize, Serialize};

use dagforge_common::duration::parse_duration;
use dagforge_common::error::{Error, ErrorList};
use dagforge_common::sock;

use crate::condition::Condition;
use crate::params::Params;
use crate::schedule::{CatchupPolicy, MisfirePolicy, OverlapPolicy, Schedule};
use crate::step::{ContainerConfig, LogOutput, Step};

/// DAG names are path- and socket-safe.
pub const MAX_DAG_NAME_LEN: usize = 40;

static NAME_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new("^[A-Za-z0-9_.-]+$").unwrap());

/// Default cap on a step's scanned stdout when matching continue-on
/// output patterns.
pub const DEFAULT_MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Default grace period between a stop request and a hard kill.
pub const DEFAULT_MAX_CLEANUP_TIME_MS: u64 = 5000;

/// Traversal mode of a DAG
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DagType {
    /// Dependency-ordered execution
    #[default]
    Graph,
    /// Declaration-ordered execution; missing depends are synthesized
    Chain,
    /// Agent-driven execution
    Agent,
}

/// Lifecycle handlers invoked at fixed points of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HandlerOn {
    pub init: Option<Step>,
    pub success: Option<Step>,
    pub failure: Option<Step>,
    pub cancel: Option<Step>,
    pub exit: Option<Step>,
    /// Reserved for human-in-the-loop gates.
    pub wait: Option<Step>,
}

/// SSH endpoint credentials
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SshConfig {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub key_file: String,
    pub password: Option<Secret<String>>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            host: String::new(),
            port: 22,
            key_file: String::new(),
            password: None,
        }
    }
}

/// S3 bucket binding
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint: String,
    pub access_key_id: Option<Secret<String>>,
    pub secret_access_key: Option<Secret<String>>,
}

/// Redis endpoint binding
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RedisConfig {
    pub address: String,
    pub db: u32,
    pub password: Option<Secret<String>>,
}

/// LLM provider binding
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LlmProviderConfig {
    pub provider: String,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<Secret<String>>,
}

/// Container registry credentials
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegistryAuth {
    pub username: String,
    pub password: Option<Secret<String>>,
}

/// SMTP credentials for notification handlers
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<Secret<String>>,
}

/// The compiled workflow
///
/// Immutable after build; validation collects every violation instead of
/// stopping at the first. Secret-bearing fields are never serialized.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Dag {
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub dag_type: DagType,
    pub steps: Vec<Step>,
    /// Run-level gates; any unmet condition rejects the whole run before
    /// a single step starts.
    pub preconditions: Vec<Condition>,
    pub handler_on: HandlerOn,
    /// Per-run step concurrency; 0 means unbounded.
    pub max_active_steps: usize,
    /// Concurrent runs admitted for this DAG's queue; 0 means unbounded.
    pub max_active_runs: usize,
    pub timeout_sec: u64,
    pub delay_sec: u64,
    pub schedule: Vec<Schedule>,
    /// Compact duration string bounding catch-up replay, e.g. `2h`.
    pub catchup_window: String,
    pub catchup_policy: CatchupPolicy,
    pub misfire_policy: MisfirePolicy,
    pub overlap_policy: OverlapPolicy,
    pub worker_selector: BTreeMap<String, String>,
    pub force_local: bool,
    pub container: Option<ContainerConfig>,
    pub queue: String,
    #[serde(skip_serializing)]
    pub env: BTreeMap<String, String>,
    pub dotenv: Vec<String>,
    #[serde(skip_serializing)]
    pub params: Params,
    #[serde(skip_serializing)]
    pub params_raw: String,
    #[serde(skip_serializing)]
    pub ssh_registry: BTreeMap<String, SshConfig>,
    #[serde(skip_serializing)]
    pub s3_registry: BTreeMap<String, S3Config>,
    #[serde(skip_serializing)]
    pub llm_registry: BTreeMap<String, LlmProviderConfig>,
    #[serde(skip_serializing)]
    pub redis_registry: BTreeMap<String, RedisConfig>,
    #[serde(skip_serializing)]
    pub registry_auths: BTreeMap<String, RegistryAuth>,
    #[serde(skip_serializing)]
    pub smtp: Option<SmtpConfig>,
    pub max_output_size: usize,
    pub max_cleanup_time_ms: u64,
    pub log_output: Option<LogOutput>,
}

impl Dag {
    /// Queue this DAG's runs are admitted through; defaults to the DAG
    /// name.
    #[must_use]
    pub fn queue_name(&self) -> &str {
        if self.queue.is_empty() {
            &self.name
        } else {
            &self.queue
        }
    }

    #[must_use]
    pub fn sock_addr(&self, dag_run_id: &str) -> PathBuf {
        sock::sock_addr(&self.name, dag_run_id)
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_sec > 0).then(|| Duration::from_secs(self.timeout_sec))
    }

    #[must_use]
    pub fn max_cleanup_time(&self) -> Duration {
        let ms = if self.max_cleanup_time_ms == 0 {
            DEFAULT_MAX_CLEANUP_TIME_MS
        } else {
            self.max_cleanup_time_ms
        };
        Duration::from_millis(ms)
    }

    #[must_use]
    pub fn max_output_size(&self) -> usize {
        if self.max_output_size == 0 {
            DEFAULT_MAX_OUTPUT_SIZE
        } else {
            self.max_output_size
        }
    }

    #[must_use]
    pub fn catchup_window_duration(&self) -> Option<Duration> {
        parse_duration(&self.catchup_window).ok()
    }

    /// Step lookup by name.
    #[must_use]
    pub fn step_by_name(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Resolve a dependency reference (step name or step ID) to the step
    /// name.
    #[must_use]
    pub fn resolve_reference(&self, reference: &str) -> Option<&str> {
        if let Some(step) = self.steps.iter().find(|s| s.name == reference) {
            return Some(&step.name);
        }
        self.steps
            .iter()
            .find(|s| s.has_id() && s.id == reference)
            .map(|s| s.name.as_str())
    }

    /// Stream layout for a step: step setting wins over the DAG setting,
    /// which wins over the separate-files default.
    #[must_use]
    pub fn effective_log_output(&self, step: &Step) -> LogOutput {
        step.log_output
            .or(self.log_output)
            .unwrap_or(LogOutput::Separate)
    }

    /// Container settings for a step: the step's own container wins over
    /// the DAG-level one.
    #[must_use]
    pub fn effective_container<'a>(&'a self, step: &'a Step) -> Option<&'a ContainerConfig> {
        step.container.as_ref().or(self.container.as_ref())
    }

    /// Validate the whole DAG, collecting every violation.
    pub fn validate(&self) -> Result<(), ErrorList> {
        let mut errors = ErrorList::new();

        if self.name.is_empty() {
            errors.push(Error::Validation("dag name must not be empty".to_string()));
        } else {
            if self.name.len() > MAX_DAG_NAME_LEN {
                errors.push(Error::Validation(format!(
                    "dag name {:?} exceeds {MAX_DAG_NAME_LEN} characters",
                    self.name
                )));
            }
            if !NAME_PATTERN.is_match(&self.name) {
                errors.push(Error::Validation(format!(
                    "dag name {:?} may only contain [A-Za-z0-9_.-]",
                    self.name
                )));
            }
        }

        if !self.catchup_window.is_empty() {
            if let Err(err) = parse_duration(&self.catchup_window) {
                errors.push(err);
            }
        }

        let mut names: HashMap<&str, usize> = HashMap::new();
        let mut ids: HashMap<&str, usize> = HashMap::new();
        for step in &self.steps {
            for err in step.validate() {
                errors.push(err);
            }
            *names.entry(step.name.as_str()).or_default() += 1;
            if step.has_id() {
                *ids.entry(step.id.as_str()).or_default() += 1;
            }
        }
        for (name, count) in &names {
            if *count > 1 {
                errors.push(Error::Validation(format!("duplicate step name {name:?}")));
            }
        }
        for (id, count) in &ids {
            if *count > 1 {
                errors.push(Error::Validation(format!("duplicate step id {id:?}")));
            }
            if names.contains_key(id) {
                errors.push(Error::Validation(format!(
                    "step id {id:?} collides with another step's name"
                )));
            }
        }

        for step in &self.steps {
            for dep in &step.depends {
                if self.resolve_reference(dep).is_none() {
                    errors.push(Error::Validation(format!(
                        "step {:?}: depends reference {dep:?} does not resolve",
                        step.name
                    )));
                }
            }
            if let Some(router) = &step.router {
                let targets = router
                    .routes
                    .values()
                    .flatten()
                    .chain(router.default.iter());
                for target in targets {
                    if self.resolve_reference(target).is_none() {
                        errors.push(Error::Validation(format!(
                            "step {:?}: router target {target:?} does not resolve",
                            step.name
                        )));
                    }
                }
            }
        }

        if self.has_cycle() {
            errors.push(Error::Validation("dependency graph contains a cycle".to_string()));
        }

        errors.into_result()
    }

    fn has_cycle(&self) -> bool {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut index = HashMap::new();
        for step in &self.steps {
            let idx = graph.add_node(step.name.as_str());
            index.insert(step.name.as_str(), idx);
        }
        for step in &self.steps {
            for dep in &step.depends {
                let Some(dep_name) = self.resolve_reference(dep) else {
                    continue;
                };
                if let (Some(&from), Some(&to)) =
                    (index.get(dep_name), index.get(step.name.as_str()))
                {
                    graph.add_edge(from, to, ());
                }
            }
        }
        is_cyclic_directed(&graph)
    }

    /// Handlers in their invocation order, paired with their hook names.
    #[must_use]
    pub fn handlers(&self) -> Vec<(&'static str, &Step)> {
        let mut out = Vec::new();
        let pairs = [
            ("onInit", self.handler_on.init.as_ref()),
            ("onSuccess", self.handler_on.success.as_ref()),
            ("onFailure", self.handler_on.failure.as_ref()),
            ("onCancel", self.handler_on.cancel.as_ref()),
            ("onExit", self.handler_on.exit.as_ref()),
            ("onWait", self.handler_on.wait.as_ref()),
        ];
        for (name, step) in pairs {
            if let Some(step) = step {
                out.push((name, step));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::Command;

    fn step(name: &str, depends: &[&str]) -> Step {
        let mut step = Step::named(name);
        step.commands = vec![Command::shell_string("true")];
        step.depends = depends.iter().map(ToString::to_string).collect();
        step
    }

    fn dag(steps: Vec<Step>) -> Dag {
        Dag {
            name: "test-dag".to_string(),
            steps,
            ..Dag::default()
        }
    }

    #[test]
    fn valid_diamond_passes() {
        let d = dag(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ]);
        assert!(d.validate().is_ok());
    }

    #[test]
    fn duplicate_names_are_collected() {
        let d = dag(vec![step("a", &[]), step("a", &[])]);
        let errors = d.validate().unwrap_err();
        assert!(errors.to_string().contains("duplicate step name"));
    }

    #[test]
    fn unresolved_depends_fails() {
        let d = dag(vec![step("a", &["missing"])]);
        assert!(d.validate().is_err());
    }

    #[test]
    fn depends_resolve_through_ids() {
        let mut first = step("build-all", &[]);
        first.id = "build".to_string();
        let d = dag(vec![first, step("test", &["build"])]);
        assert!(d.validate().is_ok());
        assert_eq!(d.resolve_reference("build"), Some("build-all"));
    }

    #[test]
    fn id_colliding_with_name_fails() {
        let mut first = step("deploy", &[]);
        first.id = "check".to_string();
        let d = dag(vec![first, step("check", &[])]);
        let errors = d.validate().unwrap_err();
        assert!(errors.to_string().contains("collides"));
    }

    #[test]
    fn cycle_is_detected() {
        let d = dag(vec![step("a", &["b"]), step("b", &["a"])]);
        let errors = d.validate().unwrap_err();
        assert!(errors.to_string().contains("cycle"));
    }

    #[test]
    fn long_or_odd_names_fail() {
        let mut d = dag(vec![step("a", &[])]);
        d.name = "x".repeat(41);
        assert!(d.validate().is_err());
        d.name = "has space".to_string();
        assert!(d.validate().is_err());
    }

    #[test]
    fn multiple_violations_are_all_reported() {
        let mut d = dag(vec![step("a", &["missing"]), step("a", &[])]);
        d.name = "bad name".to_string();
        let errors = d.validate().unwrap_err();
        assert!(errors.len() >= 3, "expected ≥3 errors, got {}", errors.len());
    }

    #[test]
    fn log_output_priority() {
        let mut d = dag(vec![step("a", &[])]);
        assert_eq!(d.effective_log_output(&d.steps[0]), LogOutput::Separate);
        d.log_output = Some(LogOutput::Merged);
        assert_eq!(d.effective_log_output(&d.steps[0]), LogOutput::Merged);
        let mut s = d.steps[0].clone();
        s.log_output = Some(LogOutput::Separate);
        assert_eq!(d.effective_log_output(&s), LogOutput::Separate);
    }

    #[test]
    fn secrets_never_serialize() {
        let mut d = dag(vec![step("a", &[])]);
        d.env.insert("TOKEN".to_string(), "secret-token".to_string());
        d.params = Params::Raw("PASSWORD=hunter2".to_string());
        d.params_raw = "PASSWORD=hunter2".to_string();
        d.ssh_registry.insert(
            "prod".to_string(),
            SshConfig {
                host: "bastion".to_string(),
                password: Some(Secret::new("sshpw".to_string())),
                ..SshConfig::default()
            },
        );
        let json = serde_json::to_string(&d).unwrap();
        assert!(!json.contains("secret-token"));
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("sshpw"));
        assert!(!json.contains("bastion"));

        let back: Dag = serde_json::from_str(&json).unwrap();
        assert!(back.env.is_empty());
        assert!(back.params.is_empty());
        assert!(back.ssh_registry.is_empty());
    }

    #[test]
    fn container_priority_step_over_dag() {
        let mut d = dag(vec![step("a", &[])]);
        assert!(d.effective_container(&d.steps[0]).is_none());

        d.container = Some(ContainerConfig {
            image: "dag-wide:1".to_string(),
            ..ContainerConfig::default()
        });
        assert_eq!(
            d.effective_container(&d.steps[0]).unwrap().image,
            "dag-wide:1"
        );

        let mut s = d.steps[0].clone();
        s.container = Some(ContainerConfig {
            image: "step-own:2".to_string(),
            ..ContainerConfig::default()
        });
        assert_eq!(d.effective_container(&s).unwrap().image, "step-own:2");
    }

    #[test]
    fn queue_falls_back_to_name() {
        let mut d = dag(vec![step("a", &[])]);
        assert_eq!(d.queue_name(), "test-dag");
        d.queue = "batch".to_string();
        assert_eq!(d.queue_name(), "batch");
    }

    #[test]
    fn defaults_for_limits() {
        let d = dag(vec![step("a", &[])]);
        assert_eq!(d.max_output_size(), DEFAULT_MAX_OUTPUT_SIZE);
        assert_eq!(d.max_cleanup_time(), Duration::from_millis(5000));
        assert_eq!(d.timeout(), None);
    }
}
