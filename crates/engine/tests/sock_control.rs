//! Control-socket integration
//!
//! Runs a DAG with the per-run socket enabled and drives it from the
//! client side: status queries while running, then a stop request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dagforge_common::sock::{sock_name, MAX_SOCK_NAME_LEN};
use dagforge_core::dag::Dag;
use dagforge_core::status::{NodeStatus, Status};
use dagforge_core::step::{Command, Step};
use dagforge_engine::executors::register_builtin_executors;
use dagforge_engine::scheduler::{Scheduler, SchedulerConfig};
use dagforge_engine::sock;

fn command_step(name: &str, command: &str) -> Step {
    let mut step = Step::named(name);
    step.shell = "sh".to_string();
    step.commands = vec![Command::shell_string(command)];
    step
}

fn sock_scheduler(dir: &tempfile::TempDir) -> Scheduler {
    register_builtin_executors();
    Scheduler::new(SchedulerConfig {
        log_dir: dir.path().to_path_buf(),
        enable_sock_server: true,
        ..SchedulerConfig::default()
    })
}

#[tokio::test]
async fn status_and_stop_over_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = sock_scheduler(&dir);

    let dag = Arc::new(Dag {
        name: "socketed".to_string(),
        max_cleanup_time_ms: 500,
        steps: vec![command_step("long", "sleep 30")],
        ..Dag::default()
    });
    let sock_path = dag.sock_addr("sock-run-1");
    assert!(
        sock_path.file_name().unwrap().len() <= MAX_SOCK_NAME_LEN,
        "socket name over the cap"
    );

    let run = {
        let dag = Arc::clone(&dag);
        tokio::spawn(async move { scheduler.run(dag, "sock-run-1").await })
    };

    // Wait until the step is visibly running through the socket.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut status = None;
    while Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Ok(current) = sock::get_status(&sock_path).await {
            if current
                .nodes
                .iter()
                .any(|n| n.status == NodeStatus::Running)
            {
                status = Some(current);
                break;
            }
        }
    }
    let status = status.expect("run never became visible over the socket");
    assert_eq!(status.name, "socketed");
    assert_eq!(status.dag_run_id, "sock-run-1");
    assert_eq!(status.status, Status::Running);

    sock::post_stop(&sock_path).await.unwrap();

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.status, Status::Aborted);
    assert_eq!(report.nodes[0].status, NodeStatus::Aborted);

    // The socket file is removed once the run finishes.
    assert!(!sock_path.exists());
}

#[tokio::test]
async fn socket_names_stay_deterministic_for_the_cli() {
    // The CLI recomputes the path from (name, run id); both sides must
    // agree.
    let dag = Dag {
        name: "cli-addressable".to_string(),
        ..Dag::default()
    };
    let server_side = dag.sock_addr("run-77");
    let client_side = std::env::temp_dir().join(sock_name("cli-addressable", "run-77"));
    assert_eq!(server_side, client_side);
}
