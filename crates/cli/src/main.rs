//! dagforge control CLI
//!
//! Talks to active runs over their per-run control sockets.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Arg, ArgMatches, Command};

use dagforge_common::sock::sock_addr;

fn run_args() -> [Arg; 3] {
    [
        Arg::new("name")
            .long("name")
            .value_name("DAG")
            .help("DAG name of the target run"),
        Arg::new("run-id")
            .long("run-id")
            .value_name("ID")
            .help("Run ID of the target run"),
        Arg::new("socket")
            .long("socket")
            .value_name("PATH")
            .help("Explicit control socket path (overrides name/run-id)"),
    ]
}

fn resolve_socket(matches: &ArgMatches) -> Result<PathBuf> {
    if let Some(path) = matches.get_one::<String>("socket") {
        return Ok(PathBuf::from(path));
    }
    let (Some(name), Some(run_id)) = (
        matches.get_one::<String>("name"),
        matches.get_one::<String>("run-id"),
    ) else {
        bail!("either --socket or both --name and --run-id are required");
    };
    Ok(sock_addr(name, run_id))
}

#[tokio::main]
async fn main() -> Result<()> {
    let app = Command::new("dagforge-cli")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Control client for active dagforge runs")
        .subcommand(
            Command::new("status")
                .about("Show the status of an active run")
                .args(run_args()),
        )
        .subcommand(
            Command::new("stop")
                .about("Request cancellation of an active run")
                .args(run_args()),
        )
        .subcommand(
            Command::new("signal")
                .about("Send a signal to every running step of a run")
                .args(run_args())
                .arg(
                    Arg::new("signal")
                        .required(true)
                        .value_name("SIGNAL")
                        .help("Signal name, e.g. SIGTERM or USR1"),
                ),
        );

    let matches = app.get_matches();

    match matches.subcommand() {
        Some(("status", sub)) => {
            let socket = resolve_socket(sub)?;
            let status = dagforge_engine::sock::get_status(&socket).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Some(("stop", sub)) => {
            let socket = resolve_socket(sub)?;
            dagforge_engine::sock::post_stop(&socket).await?;
            println!("stop requested");
        }
        Some(("signal", sub)) => {
            let socket = resolve_socket(sub)?;
            let signal = sub
                .get_one::<String>("signal")
                .expect("signal argument is required");
            dagforge_engine::sock::post_signal(&socket, signal).await?;
            println!("signal {signal} delivered");
        }
        _ => {
            println!("Use 'status', 'stop' or 'signal'; --help for details");
        }
    }

    Ok(())
}
