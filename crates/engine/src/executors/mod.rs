//! Built-in executors and their registrations

pub mod command;
pub mod parallel;
pub mod subdag;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use dagforge_common::error::{Error, Result};
use dagforge_core::executor::{Capabilities, EvalPolicy, Executor, OutputSink};
use dagforge_core::registry::{register_executor, ExecutorRegistration};

use crate::router::compile_router;

pub use command::CommandExecutor;
pub use parallel::ParallelExecutor;
pub use subdag::SubDagExecutor;

/// Router steps are pure control flow; the node runtime computes the
/// selection, this executor exists so the type resolves and validates.
struct RouterExecutor;

#[async_trait]
impl Executor for RouterExecutor {
    async fn run(&self, _cancel: CancellationToken) -> Result<()> {
        Ok(())
    }
    fn set_stdout(&mut self, _writer: OutputSink) {}
    fn set_stderr(&mut self, _writer: OutputSink) {}
    fn kill(&self, _signal: i32) -> Result<()> {
        Ok(())
    }
}

/// Register the built-in executor types. Call once at process init,
/// before any scheduler runs.
pub fn register_builtin_executors() {
    register_executor(
        "command",
        ExecutorRegistration {
            factory: Arc::new(|ctx, step| {
                Ok(Box::new(CommandExecutor::new(ctx.clone(), step.clone())))
            }),
            validator: Some(Arc::new(|step| {
                if step.commands.is_empty() && step.script.is_empty() {
                    return Err(Error::Configuration(format!(
                        "step {:?} has neither commands nor a script",
                        step.name
                    )));
                }
                Ok(())
            })),
            capabilities: Capabilities {
                command: true,
                multiple_commands: true,
                script: true,
                shell: true,
                worker_selector: true,
                ..Capabilities::default()
            },
            eval_policy: EvalPolicy::default(),
            config_schema: None,
        },
    );

    register_executor(
        "dag",
        ExecutorRegistration {
            factory: Arc::new(|ctx, step| {
                Ok(Box::new(SubDagExecutor::new(ctx, step)?))
            }),
            validator: Some(Arc::new(|step| {
                if step.sub_dag.as_ref().map_or(true, |s| s.name.is_empty()) {
                    return Err(Error::Configuration(format!(
                        "step {:?}: sub-DAG executor requires a DAG name",
                        step.name
                    )));
                }
                Ok(())
            })),
            capabilities: Capabilities {
                sub_dag: true,
                worker_selector: true,
                ..Capabilities::default()
            },
            eval_policy: EvalPolicy::default(),
            config_schema: None,
        },
    );

    register_executor(
        "parallel",
        ExecutorRegistration {
            factory: Arc::new(|ctx, step| {
                Ok(Box::new(ParallelExecutor::new(ctx, step)?))
            }),
            validator: Some(Arc::new(|step| {
                let Some(parallel) = &step.parallel else {
                    return Err(Error::Configuration(format!(
                        "step {:?}: parallel executor requires a parallel block",
                        step.name
                    )));
                };
                parallel.validate().map_err(|e| {
                    Error::Configuration(format!("step {:?}: {e}", step.name))
                })?;
                if step.sub_dag.as_ref().map_or(true, |s| s.name.is_empty()) {
                    return Err(Error::Configuration(format!(
                        "step {:?}: parallel executor requires a sub-DAG name",
                        step.name
                    )));
                }
                Ok(())
            })),
            capabilities: Capabilities {
                sub_dag: true,
                worker_selector: true,
                ..Capabilities::default()
            },
            eval_policy: EvalPolicy::default(),
            config_schema: None,
        },
    );

    // Human-in-the-loop gates resolve and validate like any other type,
    // but execution needs the interactive runtime and always stays local.
    register_executor(
        "hitl",
        ExecutorRegistration {
            factory: Arc::new(|_ctx, step| {
                Err(Error::Configuration(format!(
                    "step {:?}: human-in-the-loop steps require the interactive runtime",
                    step.name
                )))
            }),
            validator: None,
            capabilities: Capabilities {
                command: true,
                ..Capabilities::default()
            },
            eval_policy: EvalPolicy::default(),
            config_schema: None,
        },
    );

    register_executor(
        "router",
        ExecutorRegistration {
            factory: Arc::new(|_ctx, _step| Ok(Box::new(RouterExecutor))),
            validator: Some(Arc::new(|step| {
                let Some(router) = &step.router else {
                    return Err(Error::Configuration(format!(
                        "step {:?}: router executor requires a router block",
                        step.name
                    )));
                };
                compile_router(router).map(|_| ()).map_err(|e| {
                    Error::Configuration(format!("step {:?}: {e}", step.name))
                })
            })),
            capabilities: Capabilities::default(),
            eval_policy: EvalPolicy {
                // Router values are matched, not executed.
                without_expand_shell: true,
                ..EvalPolicy::default()
            },
            config_schema: None,
        },
    );
}
