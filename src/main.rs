//! dagforge run host
//!
//! Loads a compiled DAG (JSON) and drives it to completion through the
//! scheduler, exposing the per-run control socket while active.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Arg, Command};

use dagforge_common::{config::Config, metrics, telemetry};
use dagforge_core::dag::Dag;
use dagforge_engine::dispatch::{should_dispatch_to_coordinator, HttpCoordinatorClient};
use dagforge_engine::executors::register_builtin_executors;
use dagforge_engine::scheduler::{InMemoryDagLocator, Scheduler, SchedulerConfig};

fn load_dags(path: &PathBuf) -> Result<Vec<Arc<Dag>>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading DAG file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    let dags: Vec<Dag> = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value)?,
        other => vec![serde_json::from_value(other)?],
    };
    if dags.is_empty() {
        bail!("DAG file {} contains no DAGs", path.display());
    }
    Ok(dags.into_iter().map(Arc::new).collect())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("dagforge")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Workflow orchestrator execution core")
        .subcommand(
            Command::new("run")
                .about("Execute a compiled DAG")
                .arg(
                    Arg::new("file")
                        .required(true)
                        .value_name("DAG_JSON")
                        .help("Compiled DAG file; an array runs the first entry, the rest resolve sub-DAG references"),
                )
                .arg(
                    Arg::new("run-id")
                        .long("run-id")
                        .value_name("ID")
                        .help("Run ID (defaults to a fresh UUID)"),
                ),
        )
        .subcommand(
            Command::new("validate")
                .about("Validate a compiled DAG without running it")
                .arg(Arg::new("file").required(true).value_name("DAG_JSON")),
        )
        .get_matches();

    let config = Config::load().unwrap_or_default();
    if let Err(errors) = config.validate() {
        bail!("invalid configuration: {}", errors.join("; "));
    }
    telemetry::init_telemetry(&config.observability).ok();
    let metrics_shutdown = tokio_util::sync::CancellationToken::new();
    if config.observability.metrics_enabled {
        metrics::init_metrics().ok();
        if config.observability.metrics_port > 0 {
            let listener = tokio::net::TcpListener::bind((
                "0.0.0.0",
                config.observability.metrics_port,
            ))
            .await
            .with_context(|| {
                format!(
                    "binding metrics port {}",
                    config.observability.metrics_port
                )
            })?;
            let shutdown = metrics_shutdown.clone();
            tokio::spawn(async move {
                let _ = dagforge_engine::server::serve_metrics(listener, shutdown).await;
            });
        }
    }
    register_builtin_executors();

    match matches.subcommand() {
        Some(("run", sub)) => {
            let file = PathBuf::from(sub.get_one::<String>("file").expect("required"));
            let dags = load_dags(&file)?;
            let root = Arc::clone(&dags[0]);
            let run_id = sub
                .get_one::<String>("run-id")
                .cloned()
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

            let locator = Arc::new(InMemoryDagLocator::new());
            for dag in &dags {
                locator.insert(Arc::clone(dag));
            }

            let scheduler_config = SchedulerConfig {
                log_dir: config.run.log_dir.clone(),
                worker_id: config.worker.worker_id.clone(),
                enable_sock_server: true,
                log_stream_buffer: config.worker.log_stream_buffer_bytes,
                ..SchedulerConfig::default()
            };
            let mut scheduler = Scheduler::new(scheduler_config).with_locator(locator);
            if let Some(endpoint) = &config.worker.coordinator_endpoint {
                let coordinator = Arc::new(HttpCoordinatorClient::new(endpoint.clone()));
                if should_dispatch_to_coordinator(&root, true, config.worker.default_mode) {
                    tracing::info!(
                        dag = %root.name,
                        "run is dispatch-eligible; executing locally and reporting to coordinator"
                    );
                }
                scheduler = scheduler.with_coordinator(coordinator);
            }

            let report = scheduler.run(root, &run_id).await?;
            println!(
                "{}",
                serde_json::json!({
                    "dagRunId": report.dag_run_id,
                    "status": report.status,
                    "nodes": report.nodes,
                    "handlers": report.handlers,
                    "outputs": report.outputs,
                })
            );
            if !report.status.is_success() {
                std::process::exit(1);
            }
        }
        Some(("validate", sub)) => {
            let file = PathBuf::from(sub.get_one::<String>("file").expect("required"));
            for dag in load_dags(&file)? {
                match Scheduler::validate(&dag) {
                    Ok(()) => println!("{}: ok", dag.name),
                    Err(err) => {
                        eprintln!("{}: {err}", dag.name);
                        std::process::exit(1);
                    }
                }
            }
        }
        _ => {
            println!("Use 'run <dag.json>' or 'validate <dag.json>'; --help for details");
        }
    }

    Ok(())
}
