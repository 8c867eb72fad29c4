//! Pattern-routed step activation
//!
//! A router step evaluates its value once and activates downstream steps
//! by matching the value against compiled patterns. All pattern
//! compilation happens at DAG build time with the expression-evaluator
//! guards applied.

use indexmap::IndexSet;
use regex::{Regex, RegexBuilder};

use dagforge_common::error::{Error, Result};
use dagforge_core::step::{RouterConfig, RouterMode};

use crate::eval::expr::{check_blocklist, compile_expression, looks_like_expression, ExprContext, Expression};

/// Upper bound on a regex pattern source.
pub const MAX_REGEX_PATTERN_LEN: usize = 1024;

/// Bound on compiled-regex size; keeps pattern compilation far below the
/// 5-second budget.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

#[derive(Debug, Clone)]
enum Pattern {
    Exact(String),
    Regex(Regex),
    Set(Vec<String>),
    Expr(Expression),
}

impl Pattern {
    fn rank(&self) -> u8 {
        match self {
            Pattern::Regex(_) => 0,
            Pattern::Set(_) => 1,
            Pattern::Exact(_) | Pattern::Expr(_) => 2,
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledRoute {
    source: String,
    pattern: Pattern,
    targets: Vec<String>,
    declared_index: usize,
}

/// A router with all patterns compiled
#[derive(Debug, Clone)]
pub struct CompiledRouter {
    mode: RouterMode,
    /// Deterministic match order: regex > array > alphabetical.
    ordered: Vec<CompiledRoute>,
    default_targets: Vec<String>,
}

/// Compile every route pattern of a router configuration.
pub fn compile_router(config: &RouterConfig) -> Result<CompiledRouter> {
    let mut routes = Vec::with_capacity(config.routes.len());
    for (declared_index, (source, targets)) in config.routes.iter().enumerate() {
        let pattern = compile_pattern(source)?;
        routes.push(CompiledRoute {
            source: source.clone(),
            pattern,
            targets: targets.clone(),
            declared_index,
        });
    }

    let mut ordered = routes;
    ordered.sort_by(|a, b| {
        a.pattern
            .rank()
            .cmp(&b.pattern.rank())
            .then_with(|| a.source.cmp(&b.source))
    });

    Ok(CompiledRouter {
        mode: config.mode,
        ordered,
        default_targets: config.default.clone(),
    })
}

fn compile_pattern(source: &str) -> Result<Pattern> {
    let trimmed = source.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('/') && trimmed.ends_with('/') {
        let body = &trimmed[1..trimmed.len() - 1];
        if body.len() > MAX_REGEX_PATTERN_LEN {
            return Err(Error::Validation(format!(
                "regex pattern exceeds {MAX_REGEX_PATTERN_LEN} bytes"
            )));
        }
        check_blocklist(body)?;
        let regex = RegexBuilder::new(body)
            .size_limit(REGEX_SIZE_LIMIT)
            .build()
            .map_err(|e| Error::Validation(format!("invalid regex pattern {body:?}: {e}")))?;
        return Ok(Pattern::Regex(regex));
    }
    if trimmed.starts_with('[') && trimmed.ends_with(']') {
        let body = &trimmed[1..trimmed.len() - 1];
        let members = body
            .split(',')
            .map(|m| m.trim().trim_matches('\'').trim_matches('"').to_string())
            .filter(|m| !m.is_empty())
            .collect::<Vec<_>>();
        if members.is_empty() {
            return Err(Error::Validation(format!(
                "array pattern {source:?} has no members"
            )));
        }
        return Ok(Pattern::Set(members));
    }
    if looks_like_expression(trimmed) {
        return Ok(Pattern::Expr(compile_expression(trimmed)?));
    }
    Ok(Pattern::Exact(trimmed.to_string()))
}

impl CompiledRouter {
    /// Select the target steps activated for an evaluated value.
    ///
    /// Exclusive mode fires the first match under the deterministic
    /// ordering; multi-select fires every match, deduplicating targets in
    /// declaration order. No match falls back to the default targets.
    pub fn select(&self, value: &str, exit_code: i32) -> Result<Vec<String>> {
        let ctx = ExprContext {
            value: value.to_string(),
            exit_code,
        };
        match self.mode {
            RouterMode::Exclusive => {
                for route in &self.ordered {
                    if route_matches(route, value, &ctx)? {
                        return Ok(route.targets.clone());
                    }
                }
                Ok(self.default_targets.clone())
            }
            RouterMode::MultiSelect => {
                let mut declared: Vec<&CompiledRoute> = self.ordered.iter().collect();
                declared.sort_by_key(|r| r.declared_index);
                let mut selected: IndexSet<String> = IndexSet::new();
                let mut any = false;
                for route in declared {
                    if route_matches(route, value, &ctx)? {
                        any = true;
                        for target in &route.targets {
                            selected.insert(target.clone());
                        }
                    }
                }
                if !any {
                    return Ok(self.default_targets.clone());
                }
                Ok(selected.into_iter().collect())
            }
        }
    }
}

fn route_matches(route: &CompiledRoute, value: &str, ctx: &ExprContext) -> Result<bool> {
    match &route.pattern {
        Pattern::Exact(expected) => Ok(value == expected),
        Pattern::Regex(regex) => Ok(regex.is_match(value)),
        Pattern::Set(members) => Ok(members.iter().any(|m| m == value)),
        Pattern::Expr(expr) => expr.evaluate(ctx),
    }
}
