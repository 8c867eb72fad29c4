//! Template evaluation
//!
//! Expands variable references (`${NAME}`, `$NAME`) and backtick command
//! substitutions inside evaluable string fields, and evaluates step
//! preconditions. Name resolution is layered: explicit overrides, step
//! env, output variables from earlier steps, DAG env, then the process
//! environment when OS expansion is allowed.

pub mod expr;

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;

use dagforge_common::error::{Error, Result};
use dagforge_core::condition::Condition;

static VAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap()
});

static BACKTICK_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]+)`").unwrap());

/// Flags controlling one evaluation call
#[derive(Debug, Clone, Default)]
pub struct EvalOptions {
    /// Variable substitution only: no command substitution, no process
    /// environment.
    pub only_replace_vars: bool,
    /// Skip variable expansion entirely.
    pub without_expand_env: bool,
    /// Skip backtick command substitution.
    pub without_expand_shell: bool,
    /// Exclude the process environment from name resolution.
    pub without_os_env_expansion: bool,
    /// Override layers consulted before any scope level.
    pub variables: Vec<HashMap<String, String>>,
}

impl EvalOptions {
    #[must_use]
    pub fn only_replace_vars(mut self) -> Self {
        self.only_replace_vars = true;
        self
    }

    #[must_use]
    pub fn without_expand_env(mut self) -> Self {
        self.without_expand_env = true;
        self
    }

    #[must_use]
    pub fn without_expand_shell(mut self) -> Self {
        self.without_expand_shell = true;
        self
    }

    #[must_use]
    pub fn without_os_env_expansion(mut self) -> Self {
        self.without_os_env_expansion = true;
        self
    }

    #[must_use]
    pub fn with_variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables.push(variables);
        self
    }
}

/// Name-resolution layers for one step evaluation
#[derive(Clone, Default)]
pub struct EvalScope {
    pub step_env: HashMap<String, String>,
    /// Output variables produced by earlier steps in the same run.
    pub outputs: Arc<DashMap<String, String>>,
    pub dag_env: HashMap<String, String>,
    pub shell: String,
    pub shell_args: Vec<String>,
}

impl EvalScope {
    fn lookup(&self, name: &str, opts: &EvalOptions) -> Option<String> {
        for layer in &opts.variables {
            if let Some(value) = layer.get(name) {
                return Some(value.clone());
            }
        }
        if let Some(value) = self.step_env.get(name) {
            return Some(value.clone());
        }
        if let Some(value) = self.outputs.get(name) {
            return Some(value.value().clone());
        }
        if let Some(value) = self.dag_env.get(name) {
            return Some(value.clone());
        }
        if opts.without_os_env_expansion || opts.only_replace_vars {
            return None;
        }
        std::env::var(name).ok()
    }

    fn effective_shell(&self) -> (String, Vec<String>) {
        let shell = if self.shell.is_empty() {
            std::env::var("SHELL").unwrap_or_else(|_| "sh".to_string())
        } else {
            self.shell.clone()
        };
        let args = if self.shell_args.is_empty() {
            vec!["-c".to_string()]
        } else {
            self.shell_args.clone()
        };
        (shell, args)
    }
}

/// Expand variable references and command substitutions in one string.
pub async fn eval_string(scope: &EvalScope, input: &str, opts: &EvalOptions) -> Result<String> {
    let mut value = input.to_string();
    if !opts.without_expand_env {
        value = expand_variables(scope, &value, opts);
    }
    if !opts.only_replace_vars && !opts.without_expand_shell {
        value = expand_substitutions(scope, &value).await?;
    }
    Ok(value)
}

/// Recursively evaluate every string leaf of a JSON configuration value.
pub fn eval_object<'a>(
    scope: &'a EvalScope,
    value: &'a serde_json::Value,
    opts: &'a EvalOptions,
) -> BoxFuture<'a, Result<serde_json::Value>> {
    Box::pin(async move {
        match value {
            serde_json::Value::String(s) => {
                Ok(serde_json::Value::String(eval_string(scope, s, opts).await?))
            }
            serde_json::Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(eval_object(scope, item, opts).await?);
                }
                Ok(serde_json::Value::Array(out))
            }
            serde_json::Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, item) in map {
                    out.insert(key.clone(), eval_object(scope, item, opts).await?);
                }
                Ok(serde_json::Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    })
}

fn expand_variables(scope: &EvalScope, input: &str, opts: &EvalOptions) -> String {
    VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            scope
                .lookup(name, opts)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

async fn expand_substitutions(scope: &EvalScope, input: &str) -> Result<String> {
    if !input.contains('`') {
        return Ok(input.to_string());
    }
    let mut out = String::with_capacity(input.len());
    let mut last = 0usize;
    for caps in BACKTICK_PATTERN.captures_iter(input) {
        let whole = caps.get(0).unwrap();
        let snippet = &caps[1];
        out.push_str(&input[last..whole.start()]);
        out.push_str(&run_snippet(scope, snippet).await?);
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}

/// Run one backtick snippet under the scope's shell, capturing stdout with
/// the trailing newline stripped.
async fn run_snippet(scope: &EvalScope, snippet: &str) -> Result<String> {
    let (shell, args) = scope.effective_shell();
    let output = tokio::process::Command::new(&shell)
        .args(&args)
        .arg(snippet)
        .output()
        .await
        .map_err(|e| Error::Evaluation(format!("command substitution {snippet:?}: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Evaluation(format!(
            "command substitution {snippet:?} exited with {}: {}",
            output.status.code().unwrap_or(-1),
            stderr.trim()
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.trim_end_matches('\n').to_string())
}

/// Evaluate a condition: expand its text, run it under the scope's shell,
/// and apply the expected-output and negate rules.
pub async fn eval_condition(scope: &EvalScope, condition: &Condition) -> Result<bool> {
    let command = eval_string(
        scope,
        &condition.condition,
        &EvalOptions::default().without_expand_shell(),
    )
    .await?;

    let (shell, args) = scope.effective_shell();
    let output = tokio::process::Command::new(&shell)
        .args(&args)
        .arg(&command)
        .output()
        .await
        .map_err(|e| Error::Precondition(format!("condition {:?}: {e}", condition.condition)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut met = output.status.success();
    if condition.has_expected() {
        let expected = eval_string(scope, &condition.expected, &EvalOptions::default()).await?;
        met = met && stdout.trim() == expected;
    }
    if condition.negate {
        met = !met;
    }
    Ok(met)
}

/// Like [`eval_condition`] but unmet conditions become an error carrying
/// the original condition text and evaluated output.
pub async fn check_condition(scope: &EvalScope, condition: &Condition) -> Result<()> {
    if eval_condition(scope, condition).await? {
        return Ok(());
    }
    let message = condition.error_message.clone().unwrap_or_else(|| {
        if condition.has_expected() {
            format!(
                "condition {:?} did not produce expected output {:?}",
                condition.condition, condition.expected
            )
        } else {
            format!("condition {:?} was not met", condition.condition)
        }
    });
    Err(Error::Precondition(message))
}
