//! Sub-DAG run construction
//!
//! Turns a step's sub-DAG reference plus optional parallel configuration
//! into the list of nested runs, deduplicated by deterministic run ID.
//! Identical effective params collapse into one run within a parent step.

use std::collections::HashMap;

use indexmap::IndexMap;

use dagforge_common::error::{Error, Result};
use dagforge_core::step::{ParallelItem, Step, SubDagRun, MAX_PARALLEL_ITEMS};

use crate::eval::{eval_string, EvalOptions, EvalScope};

/// Deterministic ID for one nested run.
///
/// Repeated parent iterations carry the iteration index so repeat history
/// stays distinguishable while identical params within one iteration
/// still dedupe.
#[must_use]
pub fn sub_run_id(parent_run_id: &str, params: &str, repeated: bool, iteration: u32) -> String {
    let seed = if repeated {
        format!("{parent_run_id}:{params}:repeat:{iteration}")
    } else {
        format!("{parent_run_id}:{params}")
    };
    format!("{:x}", md5::compute(seed))
}

/// Build the nested-run list for a step.
pub async fn build_sub_runs(
    scope: &EvalScope,
    step: &Step,
    parent_run_id: &str,
    repeated: bool,
    iteration: u32,
) -> Result<Vec<SubDagRun>> {
    let Some(sub_dag) = &step.sub_dag else {
        return Err(Error::Configuration(format!(
            "step {:?} has no sub-DAG configured",
            step.name
        )));
    };

    let opts = EvalOptions::default().without_os_env_expansion();

    let Some(parallel) = &step.parallel else {
        let params = eval_string(scope, &sub_dag.params, &opts).await?;
        return Ok(vec![SubDagRun {
            dag_run_id: sub_run_id(parent_run_id, &params, repeated, iteration),
            params,
            repeated,
        }]);
    };

    let items = if parallel.variable.is_empty() {
        let mut out = Vec::with_capacity(parallel.items.len());
        for item in &parallel.items {
            out.push(resolve_item(scope, item, &opts).await?);
        }
        out
    } else {
        let value = eval_string(scope, &parallel.variable, &opts).await?;
        split_items(&value)
    };

    if items.is_empty() {
        return Err(Error::Validation(format!(
            "step {:?}: parallel expansion produced no items",
            step.name
        )));
    }
    if items.len() > MAX_PARALLEL_ITEMS {
        return Err(Error::Validation(format!(
            "step {:?}: parallel expansion produced {} items, cap is {MAX_PARALLEL_ITEMS}",
            step.name,
            items.len()
        )));
    }

    let mut runs: IndexMap<String, SubDagRun> = IndexMap::new();
    for item in items {
        let params = if sub_dag.params.is_empty() {
            item.clone()
        } else {
            let binding = HashMap::from([("ITEM".to_string(), item.clone())]);
            let item_opts = opts.clone().with_variables(binding);
            eval_string(scope, &sub_dag.params, &item_opts).await?
        };
        let dag_run_id = sub_run_id(parent_run_id, &params, repeated, iteration);
        runs.entry(dag_run_id.clone()).or_insert(SubDagRun {
            dag_run_id,
            params,
            repeated,
        });
    }
    Ok(runs.into_values().collect())
}

async fn resolve_item(
    scope: &EvalScope,
    item: &ParallelItem,
    opts: &EvalOptions,
) -> Result<String> {
    match item {
        ParallelItem::Value(value) => eval_string(scope, value, opts).await,
        ParallelItem::Params(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                let evaluated = crate::eval::eval_object(scope, value, opts).await?;
                out.insert(key.clone(), evaluated);
            }
            serde_json::to_string(&serde_json::Value::Object(out)).map_err(Error::from)
        }
    }
}

/// Smart separator for a variable-sourced item list: JSON array first,
/// then newlines, then commas, falling back to a single item.
#[must_use]
pub fn split_items(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed.starts_with('[') {
        if let Ok(serde_json::Value::Array(items)) = serde_json::from_str(trimmed) {
            return items
                .iter()
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
        }
    }
    if trimmed.contains('\n') {
        return trimmed
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect();
    }
    if trimmed.contains(',') {
        return trimmed
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(ToString::to_string)
            .collect();
    }
    vec![trimmed.to_string()]
}
