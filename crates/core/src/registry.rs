//! Process-wide executor registry
//!
//! Maps executor type names to factories, optional step validators,
//! capability records and optional JSON schemas for their config blocks.
//! Registrations happen at process init, before any scheduler runs; the
//! registry is read-mostly afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use parking_lot::RwLock;

use dagforge_common::error::{Error, Result};

use crate::executor::{
    Capabilities, EvalPolicy, ExecCtx, Executor, ExecutorFactory, StepValidator,
};
use crate::step::Step;

/// One executor type's registration record
#[derive(Clone)]
pub struct ExecutorRegistration {
    pub factory: ExecutorFactory,
    pub validator: Option<StepValidator>,
    pub capabilities: Capabilities,
    pub eval_policy: EvalPolicy,
    /// JSON schema validated lazily, once per type, against step config.
    pub config_schema: Option<serde_json::Value>,
}

static REGISTRY: Lazy<RwLock<HashMap<String, ExecutorRegistration>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

static COMPILED_SCHEMAS: Lazy<DashMap<String, Arc<JSONSchema>>> = Lazy::new(DashMap::new);

/// Register an executor type. Later registrations replace earlier ones.
pub fn register_executor(type_name: &str, registration: ExecutorRegistration) {
    COMPILED_SCHEMAS.remove(type_name);
    REGISTRY
        .write()
        .insert(type_name.to_string(), registration);
}

/// Fetch a type's registration record.
#[must_use]
pub fn lookup_executor(type_name: &str) -> Option<ExecutorRegistration> {
    REGISTRY.read().get(type_name).cloned()
}

/// Capability record for a type; unregistered types get the strict empty
/// default.
#[must_use]
pub fn capabilities(type_name: &str) -> Capabilities {
    REGISTRY
        .read()
        .get(type_name)
        .map(|r| r.capabilities)
        .unwrap_or_default()
}

/// Evaluation flags contributed by the capability record.
#[must_use]
pub fn eval_policy(type_name: &str) -> EvalPolicy {
    REGISTRY
        .read()
        .get(type_name)
        .map(|r| r.eval_policy)
        .unwrap_or_default()
}

/// Instantiate an executor for an evaluated step.
pub fn create_executor(ctx: &ExecCtx, step: &Step) -> Result<Box<dyn Executor>> {
    let type_name = step.executor_type();
    let registration = lookup_executor(type_name).ok_or_else(|| {
        Error::Configuration(format!("unresolved executor type {type_name:?}"))
    })?;
    (registration.factory)(ctx, step)
}

/// Build-time validation of one step against its executor type: the type
/// must resolve, capabilities must cover what the step uses, the
/// registered validator must pass, and the config must satisfy the
/// type's schema.
pub fn validate_step(step: &Step) -> Result<()> {
    let type_name = step.executor_type();
    let registration = lookup_executor(type_name).ok_or_else(|| {
        Error::Configuration(format!("unresolved executor type {type_name:?}"))
    })?;

    check_capabilities(step, type_name, registration.capabilities)?;

    if let Some(validator) = &registration.validator {
        validator(step)?;
    }

    if let Some(schema) = &registration.config_schema {
        if !step.executor.config.is_null() {
            let compiled = compiled_schema(type_name, schema)?;
            let result = compiled.validate(&step.executor.config);
            if let Err(violations) = result {
                let reasons = violations
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(Error::Configuration(format!(
                    "invalid {type_name} config: {reasons}"
                )));
            }
        }
    }

    Ok(())
}

fn check_capabilities(step: &Step, type_name: &str, caps: Capabilities) -> Result<()> {
    let reject = |feature: &str| {
        Err(Error::Configuration(format!(
            "step {:?}: executor {type_name:?} does not support {feature}",
            step.name
        )))
    };
    if step.commands.len() > 1 && !caps.multiple_commands {
        return reject("multiple commands");
    }
    if !step.script.is_empty() && !caps.script {
        return reject("scripts");
    }
    if step.container.is_some() && !caps.container {
        return reject("containers");
    }
    if (step.sub_dag.is_some() || step.parallel.is_some()) && !caps.sub_dag {
        return reject("sub-DAG runs");
    }
    if !step.worker_selector.is_empty() && !caps.worker_selector {
        return reject("worker selectors");
    }
    if step.llm.is_some() && !caps.llm {
        return reject("llm configuration");
    }
    Ok(())
}

fn compiled_schema(type_name: &str, schema: &serde_json::Value) -> Result<Arc<JSONSchema>> {
    if let Some(compiled) = COMPILED_SCHEMAS.get(type_name) {
        return Ok(Arc::clone(&compiled));
    }
    let compiled = JSONSchema::compile(schema).map_err(|e| {
        Error::Configuration(format!("invalid {type_name} config schema: {e}"))
    })?;
    let compiled = Arc::new(compiled);
    COMPILED_SCHEMAS.insert(type_name.to_string(), Arc::clone(&compiled));
    Ok(compiled)
}
