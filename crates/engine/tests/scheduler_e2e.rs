//! End-to-end scheduler scenarios
//!
//! Each test drives a real DAG through the scheduler with the command
//! executor, exercising retries, continue-on, parallel fan-out, routing,
//! cancellation and precondition skips.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use dagforge_core::condition::Condition;
use dagforge_core::dag::Dag;
use dagforge_core::policy::{ContinueOn, RetryPolicy};
use dagforge_core::status::{NodeStatus, Status};
use dagforge_core::step::{Command, ParallelConfig, ParallelItem, RouterConfig, RouterMode, Step, SubDag};
use dagforge_engine::executors::register_builtin_executors;
use dagforge_engine::scheduler::{InMemoryDagLocator, Scheduler, SchedulerConfig};

fn command_step(name: &str, command: &str, depends: &[&str]) -> Step {
    let mut step = Step::named(name);
    step.shell = "sh".to_string();
    step.commands = vec![Command::shell_string(command)];
    step.depends = depends.iter().map(ToString::to_string).collect();
    step
}

fn scheduler_in(dir: &tempfile::TempDir) -> Scheduler {
    register_builtin_executors();
    Scheduler::new(SchedulerConfig {
        log_dir: dir.path().to_path_buf(),
        ..SchedulerConfig::default()
    })
}

fn node<'a>(report: &'a dagforge_engine::scheduler::RunReport, name: &str) -> &'a dagforge_core::status::NodeSnapshot {
    report
        .nodes
        .iter()
        .find(|n| n.name == name)
        .unwrap_or_else(|| panic!("node {name} missing from report"))
}

#[tokio::test]
async fn diamond_with_retries() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_in(&dir);

    // B fails twice, then succeeds on the third attempt.
    let mut flaky = command_step(
        "b",
        "n=$(cat attempt_count 2>/dev/null || echo 0); n=$((n+1)); echo $n > attempt_count; [ $n -ge 3 ]",
        &["a"],
    );
    flaky.dir = dir.path().display().to_string();
    flaky.retry_policy = RetryPolicy {
        limit: 3,
        interval_sec: 0.01,
        ..RetryPolicy::default()
    };

    let dag = Arc::new(Dag {
        name: "diamond".to_string(),
        steps: vec![
            command_step("a", "true", &[]),
            flaky,
            command_step("c", "true", &["a"]),
            command_step("d", "true", &["b", "c"]),
        ],
        ..Dag::default()
    });

    let report = scheduler.run(dag, "run-diamond").await.unwrap();
    assert_eq!(report.status, Status::Succeeded);
    for name in ["a", "b", "c", "d"] {
        assert_eq!(node(&report, name).status, NodeStatus::Succeeded, "{name}");
    }
    assert_eq!(node(&report, "b").retry_count, 2);
}

#[tokio::test]
async fn continue_on_with_mark_success() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_in(&dir);

    let mut failing = command_step("a", "exit 2", &[]);
    failing.continue_on = ContinueOn {
        exit_code: vec![2],
        mark_success: true,
        ..ContinueOn::default()
    };

    let dag = Arc::new(Dag {
        name: "continue-mark".to_string(),
        steps: vec![failing, command_step("b", "echo done", &["a"])],
        ..Dag::default()
    });

    let report = scheduler.run(dag, "run-continue").await.unwrap();
    assert_eq!(report.status, Status::Succeeded);
    assert_eq!(node(&report, "a").status, NodeStatus::Succeeded);
    assert_eq!(node(&report, "b").status, NodeStatus::Succeeded);
}

#[tokio::test]
async fn continue_on_without_mark_success_releases_but_fails() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_in(&dir);

    let mut failing = command_step("a", "exit 2", &[]);
    failing.continue_on = ContinueOn {
        exit_code: vec![2],
        ..ContinueOn::default()
    };

    let dag = Arc::new(Dag {
        name: "continue-plain".to_string(),
        steps: vec![failing, command_step("b", "echo done", &["a"])],
        ..Dag::default()
    });

    let report = scheduler.run(dag, "run-continue-plain").await.unwrap();
    // Downstream released, but the lingering failure still fails the run.
    assert_eq!(node(&report, "a").status, NodeStatus::Failed);
    assert_eq!(node(&report, "b").status, NodeStatus::Succeeded);
    assert_eq!(report.status, Status::Failed);
}

#[tokio::test]
async fn parallel_fan_out_with_partial_failure() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_in(&dir);

    let child = Arc::new(Dag {
        name: "child".to_string(),
        steps: vec![command_step("work", "test \"$TARGET\" != \"c\"", &[])],
        ..Dag::default()
    });
    let locator = Arc::new(InMemoryDagLocator::new());
    locator.insert(Arc::clone(&child));
    let scheduler = scheduler.with_locator(locator);

    let mut fanout = Step::named("p");
    fanout.sub_dag = Some(SubDag {
        name: "child".to_string(),
        params: "TARGET=${ITEM}".to_string(),
    });
    fanout.parallel = Some(ParallelConfig {
        items: ["a", "b", "c", "d"]
            .iter()
            .map(|s| ParallelItem::Value((*s).to_string()))
            .collect(),
        max_concurrent: 2,
        ..ParallelConfig::default()
    });
    fanout.output = "SUMMARY".to_string();

    let dag = Arc::new(Dag {
        name: "fanout".to_string(),
        steps: vec![fanout],
        ..Dag::default()
    });

    let report = scheduler.run(dag, "run-fanout").await.unwrap();
    assert_eq!(report.status, Status::PartiallySucceeded);
    assert_eq!(node(&report, "p").status, NodeStatus::PartiallySucceeded);

    let summary: serde_json::Value =
        serde_json::from_str(report.outputs.get("SUMMARY").expect("summary output")).unwrap();
    assert_eq!(summary["summary"]["total"], 4);
    assert_eq!(summary["summary"]["succeeded"], 3);
    assert_eq!(summary["summary"]["failed"], 1);
    assert_eq!(summary["results"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn router_exclusive_activates_one_branch() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_in(&dir);

    let mut routes = indexmap::IndexMap::new();
    routes.insert("[500,502,503]".to_string(), vec!["retry_step".to_string()]);
    routes.insert("0".to_string(), vec!["success_step".to_string()]);
    let mut router_step = Step::named("route");
    router_step.router = Some(RouterConfig {
        value: "${ROUTE_VALUE}".to_string(),
        routes,
        mode: RouterMode::Exclusive,
        default: vec!["unknown".to_string()],
    });

    let mut dag = Dag {
        name: "routed".to_string(),
        steps: vec![
            router_step,
            command_step("retry_step", "echo retrying", &["route"]),
            command_step("success_step", "echo fine", &["route"]),
            command_step("unknown", "echo unknown", &["route"]),
        ],
        ..Dag::default()
    };
    dag.env
        .insert("ROUTE_VALUE".to_string(), "502".to_string());

    let report = scheduler.run(Arc::new(dag), "run-routed").await.unwrap();
    assert_eq!(report.status, Status::Succeeded);
    assert_eq!(node(&report, "route").status, NodeStatus::Succeeded);
    assert_eq!(node(&report, "retry_step").status, NodeStatus::Succeeded);
    assert_eq!(node(&report, "success_step").status, NodeStatus::Skipped);
    assert_eq!(node(&report, "unknown").status, NodeStatus::Skipped);
}

#[tokio::test]
async fn router_multi_select_unions_matching_branches() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_in(&dir);

    let mut routes = indexmap::IndexMap::new();
    routes.insert("/^err/".to_string(), vec!["alert".to_string()]);
    routes.insert("[error,fatal]".to_string(), vec!["page".to_string()]);
    routes.insert("ok".to_string(), vec!["archive".to_string()]);
    let mut router_step = Step::named("classify");
    router_step.router = Some(RouterConfig {
        value: "${SEVERITY}".to_string(),
        routes,
        mode: RouterMode::MultiSelect,
        default: vec![],
    });

    let mut dag = Dag {
        name: "multi-routed".to_string(),
        steps: vec![
            router_step,
            command_step("alert", "echo alerting", &["classify"]),
            command_step("page", "echo paging", &["classify"]),
            command_step("archive", "echo archiving", &["classify"]),
        ],
        ..Dag::default()
    };
    dag.env
        .insert("SEVERITY".to_string(), "error".to_string());

    let report = scheduler.run(Arc::new(dag), "run-multi-routed").await.unwrap();
    assert_eq!(report.status, Status::Succeeded);
    // "error" matches both the regex and the array route.
    assert_eq!(node(&report, "alert").status, NodeStatus::Succeeded);
    assert_eq!(node(&report, "page").status, NodeStatus::Succeeded);
    assert_eq!(node(&report, "archive").status, NodeStatus::Skipped);
}

#[tokio::test]
async fn router_without_match_or_default_is_a_successful_noop() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_in(&dir);

    let mut routes = indexmap::IndexMap::new();
    routes.insert("expected".to_string(), vec!["downstream".to_string()]);
    let mut router_step = Step::named("gate");
    router_step.router = Some(RouterConfig {
        value: "something-else".to_string(),
        routes,
        mode: RouterMode::Exclusive,
        default: vec![],
    });

    let dag = Arc::new(Dag {
        name: "noop-router".to_string(),
        steps: vec![
            router_step,
            command_step("downstream", "echo run", &["gate"]),
        ],
        ..Dag::default()
    });

    let report = scheduler.run(dag, "run-noop-router").await.unwrap();
    assert_eq!(report.status, Status::Succeeded);
    assert_eq!(node(&report, "gate").status, NodeStatus::Succeeded);
    assert_eq!(node(&report, "downstream").status, NodeStatus::Skipped);
}

#[tokio::test]
async fn signal_on_stop_overrides_the_termination_signal() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_in(&dir);

    // The step exits 75 only if it receives the declared USR1.
    let mut trapper = command_step("trapper", "trap 'exit 75' USR1; sleep 30 & wait $!", &[]);
    trapper.signal_on_stop = "SIGUSR1".to_string();

    let dag = Arc::new(Dag {
        name: "signal-override".to_string(),
        max_cleanup_time_ms: 2000,
        steps: vec![trapper],
        ..Dag::default()
    });

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let report = scheduler
        .run_with_cancel(dag, "run-signal-override", cancel)
        .await
        .unwrap();
    assert_eq!(report.status, Status::Aborted);
    let snapshot = node(&report, "trapper");
    assert_eq!(snapshot.status, NodeStatus::Aborted);
    // The trap fired, proving USR1 (not the default SIGTERM) arrived.
    assert_eq!(snapshot.exit_code, 75);
}

#[tokio::test]
async fn cancellation_mid_retry_aborts_promptly() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_in(&dir);

    let mut sleeper = command_step("sleeper", "sleep 10", &[]);
    sleeper.retry_policy = RetryPolicy {
        limit: 5,
        interval_sec: 1.0,
        ..RetryPolicy::default()
    };

    let dag = Arc::new(Dag {
        name: "cancelled".to_string(),
        steps: vec![sleeper],
        max_cleanup_time_ms: 500,
        ..Dag::default()
    });

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let report = scheduler
        .run_with_cancel(dag, "run-cancelled", cancel)
        .await
        .unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "abort took {:?}",
        started.elapsed()
    );
    assert_eq!(report.status, Status::Aborted);
    assert_eq!(node(&report, "sleeper").status, NodeStatus::Aborted);
    assert_eq!(node(&report, "sleeper").retry_count, 0);
}

#[tokio::test]
async fn precondition_skip_with_chained_continue() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_in(&dir);

    let mut gated = command_step("a", "echo not run", &[]);
    gated.preconditions = vec![Condition::new("false")];
    gated.continue_on = ContinueOn {
        skipped: true,
        ..ContinueOn::default()
    };

    let dag = Arc::new(Dag {
        name: "precondition".to_string(),
        steps: vec![gated, command_step("b", "echo ran", &["a"])],
        ..Dag::default()
    });

    let report = scheduler.run(dag, "run-precondition").await.unwrap();
    assert_eq!(report.status, Status::Succeeded);
    assert_eq!(node(&report, "a").status, NodeStatus::Skipped);
    assert_eq!(node(&report, "b").status, NodeStatus::Succeeded);
}

#[tokio::test]
async fn output_variables_flow_to_later_steps() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_in(&dir);

    let mut producer = command_step("produce", "echo artifact-42", &[]);
    producer.output = "ARTIFACT".to_string();
    let consumer = command_step("consume", "test \"${ARTIFACT}\" = \"artifact-42\"", &["produce"]);

    let dag = Arc::new(Dag {
        name: "outputs".to_string(),
        steps: vec![producer, consumer],
        ..Dag::default()
    });

    let report = scheduler.run(dag, "run-outputs").await.unwrap();
    assert_eq!(report.status, Status::Succeeded);
    assert_eq!(report.outputs.get("ARTIFACT").unwrap(), "artifact-42");
}

#[tokio::test]
async fn handlers_fire_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_in(&dir);

    let mut dag = Dag {
        name: "handled".to_string(),
        steps: vec![command_step("main", "true", &[])],
        ..Dag::default()
    };
    dag.handler_on.init = Some(command_step("setup", "true", &[]));
    dag.handler_on.success = Some(command_step("celebrate", "true", &[]));
    dag.handler_on.failure = Some(command_step("mourn", "true", &[]));
    dag.handler_on.exit = Some(command_step("cleanup", "true", &[]));

    let report = scheduler.run(Arc::new(dag), "run-handled").await.unwrap();
    assert_eq!(report.status, Status::Succeeded);
    let handler_names: Vec<&str> = report.handlers.iter().map(|h| h.name.as_str()).collect();
    assert_eq!(
        handler_names,
        vec!["onInit:setup", "onSuccess:celebrate", "onExit:cleanup"]
    );
    assert!(report
        .handlers
        .iter()
        .all(|h| h.status == NodeStatus::Succeeded));
}

#[tokio::test]
async fn failed_init_handler_fails_the_run_without_starting_steps() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_in(&dir);

    let mut dag = Dag {
        name: "init-fails".to_string(),
        steps: vec![command_step("main", "echo should-not-run", &[])],
        ..Dag::default()
    };
    dag.handler_on.init = Some(command_step("setup", "exit 1", &[]));

    let report = scheduler.run(Arc::new(dag), "run-init-fails").await.unwrap();
    assert_eq!(report.status, Status::Failed);
    assert_eq!(node(&report, "main").status, NodeStatus::NotStarted);
}

#[tokio::test]
async fn exit_handler_failure_never_mutates_the_run_status() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_in(&dir);

    let mut dag = Dag {
        name: "exit-fails".to_string(),
        steps: vec![command_step("main", "true", &[])],
        ..Dag::default()
    };
    dag.handler_on.exit = Some(command_step("cleanup", "exit 1", &[]));

    let report = scheduler.run(Arc::new(dag), "run-exit-fails").await.unwrap();
    assert_eq!(report.status, Status::Succeeded);
    let exit_handler = report
        .handlers
        .iter()
        .find(|h| h.name == "onExit:cleanup")
        .unwrap();
    assert_eq!(exit_handler.status, NodeStatus::Failed);
}

#[tokio::test]
async fn step_timeout_fails_the_step() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_in(&dir);

    let mut slow = command_step("slow", "sleep 20", &[]);
    slow.timeout_sec = 1;

    let dag = Arc::new(Dag {
        name: "timeouts".to_string(),
        steps: vec![slow],
        ..Dag::default()
    });

    let started = Instant::now();
    let report = scheduler.run(dag, "run-timeouts").await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(report.status, Status::Failed);
    assert_eq!(node(&report, "slow").status, NodeStatus::Failed);
    assert_eq!(node(&report, "slow").exit_code, 124);
}

#[tokio::test]
async fn max_active_steps_limits_concurrency() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_in(&dir);
    let marker_dir = dir.path().display().to_string();

    // Each step records the number of concurrently running peers.
    let probe = format!(
        "touch {marker_dir}/$DAG_RUN_STEP_NAME.running; \
         count=$(ls {marker_dir} | grep -c '\\.running$'); \
         echo $count >> {marker_dir}/peaks; \
         sleep 0.2; \
         rm {marker_dir}/$DAG_RUN_STEP_NAME.running"
    );
    let dag = Arc::new(Dag {
        name: "limited".to_string(),
        max_active_steps: 1,
        steps: (0..4)
            .map(|i| command_step(&format!("s{i}"), &probe, &[]))
            .collect(),
        ..Dag::default()
    });

    let report = scheduler.run(dag, "run-limited").await.unwrap();
    assert_eq!(report.status, Status::Succeeded);
    let peaks = std::fs::read_to_string(dir.path().join("peaks")).unwrap();
    for line in peaks.lines() {
        assert_eq!(line.trim(), "1", "steps overlapped: {peaks}");
    }
}

#[tokio::test]
async fn dotenv_files_load_once_per_process() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_in(&dir);

    let env_file = dir.path().join("run.env");
    std::fs::write(&env_file, "DAGFORGE_E2E_DOTENV_PROBE=loaded-once\n").unwrap();

    let dag = Arc::new(Dag {
        name: "dotenv-dag".to_string(),
        dotenv: vec![env_file.display().to_string()],
        steps: vec![command_step(
            "check",
            "test \"$DAGFORGE_E2E_DOTENV_PROBE\" = \"loaded-once\"",
            &[],
        )],
        ..Dag::default()
    });

    let report = scheduler.run(Arc::clone(&dag), "run-dotenv-1").await.unwrap();
    assert_eq!(report.status, Status::Succeeded);
    assert_eq!(
        std::env::var("DAGFORGE_E2E_DOTENV_PROBE").as_deref(),
        Ok("loaded-once")
    );

    // A second run with the same dotenv file is a no-op, not an error.
    let report = scheduler.run(dag, "run-dotenv-2").await.unwrap();
    assert_eq!(report.status, Status::Succeeded);
}

#[tokio::test]
async fn unmet_dag_precondition_rejects_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_in(&dir);

    let dag = Arc::new(Dag {
        name: "gated-dag".to_string(),
        preconditions: vec![Condition::new("false")],
        steps: vec![command_step("never", "echo no", &[])],
        ..Dag::default()
    });

    let report = scheduler.run(dag, "run-gated").await.unwrap();
    assert_eq!(report.status, Status::Rejected);
    assert_eq!(node(&report, "never").status, NodeStatus::NotStarted);
}

#[tokio::test]
async fn step_stdout_redirect_receives_a_copy() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_in(&dir);
    let redirect = dir.path().join("copy.txt");

    let mut step = command_step("emitter", "echo duplicated", &[]);
    step.stdout = redirect.display().to_string();

    let dag = Arc::new(Dag {
        name: "redirected".to_string(),
        steps: vec![step],
        ..Dag::default()
    });

    let report = scheduler.run(dag, "run-redirected").await.unwrap();
    assert_eq!(report.status, Status::Succeeded);
    // Both the run log and the redirect file carry the output.
    assert_eq!(std::fs::read_to_string(&redirect).unwrap(), "duplicated\n");
    let log = std::fs::read_to_string(node(&report, "emitter").stdout_file.as_ref().unwrap()).unwrap();
    assert_eq!(log, "duplicated\n");
}

#[tokio::test]
async fn parallel_step_records_its_sub_runs() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_in(&dir);

    let child = Arc::new(Dag {
        name: "noop-child".to_string(),
        steps: vec![command_step("ok", "true", &[])],
        ..Dag::default()
    });
    let locator = Arc::new(InMemoryDagLocator::new());
    locator.insert(child);
    let scheduler = scheduler.with_locator(locator);

    let mut fanout = Step::named("spread");
    fanout.sub_dag = Some(SubDag {
        name: "noop-child".to_string(),
        params: "N=${ITEM}".to_string(),
    });
    fanout.parallel = Some(ParallelConfig {
        items: vec![
            ParallelItem::Value("1".to_string()),
            ParallelItem::Value("2".to_string()),
        ],
        ..ParallelConfig::default()
    });

    let dag = Arc::new(Dag {
        name: "spread-dag".to_string(),
        steps: vec![fanout],
        ..Dag::default()
    });

    let report = scheduler.run(dag, "run-spread").await.unwrap();
    assert_eq!(report.status, Status::Succeeded);
    let sub_runs = &node(&report, "spread").sub_runs;
    assert_eq!(sub_runs.len(), 2);
    assert_eq!(sub_runs[0].params, "N=1");
    assert_eq!(sub_runs[1].params, "N=2");
}

#[tokio::test]
async fn continue_on_output_pattern_marks_success() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_in(&dir);

    let mut tolerated = command_step("flaky", "echo 'WARN: tolerable drift detected'; exit 9", &[]);
    tolerated.continue_on = ContinueOn {
        output: vec!["regexp:^WARN".to_string()],
        mark_success: true,
        ..ContinueOn::default()
    };

    let mut substring = command_step("known", "echo 'error: quota exceeded'; exit 9", &["flaky"]);
    substring.continue_on = ContinueOn {
        output: vec!["quota exceeded".to_string()],
        ..ContinueOn::default()
    };

    let dag = Arc::new(Dag {
        name: "output-continue".to_string(),
        steps: vec![
            tolerated,
            substring,
            command_step("after", "echo downstream", &["known"]),
        ],
        ..Dag::default()
    });

    let report = scheduler.run(dag, "run-output-continue").await.unwrap();
    // The regex-matched failure is rewritten to success; the substring
    // match releases downstream but keeps its failure.
    assert_eq!(node(&report, "flaky").status, NodeStatus::Succeeded);
    assert_eq!(node(&report, "known").status, NodeStatus::Failed);
    assert_eq!(node(&report, "after").status, NodeStatus::Succeeded);
    assert_eq!(report.status, Status::Failed);
}

#[tokio::test]
async fn merged_log_output_interleaves_into_one_file() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_in(&dir);

    let mut step = command_step("chatty", "echo to-out; echo to-err >&2", &[]);
    step.log_output = Some(dagforge_core::step::LogOutput::Merged);

    let dag = Arc::new(Dag {
        name: "merged-logs".to_string(),
        steps: vec![step],
        ..Dag::default()
    });

    let report = scheduler.run(dag, "run-merged").await.unwrap();
    assert_eq!(report.status, Status::Succeeded);
    let snapshot = node(&report, "chatty");
    assert_eq!(snapshot.stdout_file, snapshot.stderr_file);
    let path = snapshot.stdout_file.as_ref().unwrap();
    assert!(path.ends_with(".log"), "{path}");
    let merged = std::fs::read_to_string(path).unwrap();
    assert!(merged.contains("to-out"));
    assert!(merged.contains("to-err"));
}

#[tokio::test]
async fn chain_mode_runs_in_declaration_order() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_in(&dir);
    let trace = dir.path().join("order").display().to_string();

    let dag = Arc::new(Dag {
        name: "chained".to_string(),
        dag_type: dagforge_core::dag::DagType::Chain,
        steps: vec![
            command_step("first", &format!("echo first >> {trace}"), &[]),
            command_step("second", &format!("echo second >> {trace}"), &[]),
            command_step("third", &format!("echo third >> {trace}"), &[]),
        ],
        ..Dag::default()
    });

    let report = scheduler.run(dag, "run-chained").await.unwrap();
    assert_eq!(report.status, Status::Succeeded);
    let order = std::fs::read_to_string(dir.path().join("order")).unwrap();
    assert_eq!(order, "first\nsecond\nthird\n");
}

#[tokio::test]
async fn repeat_until_condition_holds() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_in(&dir);

    let mut poller = command_step(
        "poll",
        "n=$(cat poll_count 2>/dev/null || echo 0); n=$((n+1)); echo $n > poll_count",
        &[],
    );
    poller.dir = dir.path().display().to_string();
    let count_file = dir.path().join("poll_count").display().to_string();
    poller.repeat_policy = dagforge_core::policy::RepeatPolicy {
        repeat_mode: Some(dagforge_core::policy::RepeatMode::Until),
        condition: Some(Condition::new(format!(
            "test $(cat {count_file} 2>/dev/null || echo 0) -ge 3"
        ))),
        limit: 10,
        interval_sec: 0.01,
        ..dagforge_core::policy::RepeatPolicy::default()
    };

    let dag = Arc::new(Dag {
        name: "repeating".to_string(),
        steps: vec![poller],
        ..Dag::default()
    });

    let report = scheduler.run(dag, "run-repeating").await.unwrap();
    assert_eq!(report.status, Status::Succeeded);
    let snapshot = node(&report, "poll");
    assert_eq!(snapshot.status, NodeStatus::Succeeded);
    assert_eq!(snapshot.repeat_count, 2, "three executions, two repeats");
    let count = std::fs::read_to_string(dir.path().join("poll_count")).unwrap();
    assert_eq!(count.trim(), "3");
}

#[tokio::test]
async fn retry_limit_template_is_evaluated_at_setup() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_in(&dir);

    let mut failing = command_step("flaky", "exit 1", &[]);
    failing.retry_policy = RetryPolicy {
        limit_str: Some("${RETRY_LIMIT}".to_string()),
        interval_sec: 0.01,
        ..RetryPolicy::default()
    };

    let mut dag = Dag {
        name: "templated-retry".to_string(),
        steps: vec![failing],
        ..Dag::default()
    };
    dag.env
        .insert("RETRY_LIMIT".to_string(), "2".to_string());

    let report = scheduler.run(Arc::new(dag), "run-templated").await.unwrap();
    assert_eq!(report.status, Status::Failed);
    assert_eq!(node(&report, "flaky").retry_count, 2);
}

#[tokio::test]
async fn sub_dag_outputs_surface_on_parent() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler_in(&dir);

    let mut child_step = command_step("emit", "echo from-child", &[]);
    child_step.output = "CHILD_VALUE".to_string();
    let child = Arc::new(Dag {
        name: "emitter".to_string(),
        steps: vec![child_step],
        ..Dag::default()
    });
    let locator = Arc::new(InMemoryDagLocator::new());
    locator.insert(Arc::clone(&child));
    let scheduler = scheduler.with_locator(locator);

    let mut parent_step = Step::named("nested");
    parent_step.sub_dag = Some(SubDag {
        name: "emitter".to_string(),
        params: String::new(),
    });
    parent_step.output = "NESTED".to_string();

    let dag = Arc::new(Dag {
        name: "parent".to_string(),
        steps: vec![parent_step],
        ..Dag::default()
    });

    let report = scheduler.run(dag, "run-parent").await.unwrap();
    assert_eq!(report.status, Status::Succeeded);
    let nested: serde_json::Value =
        serde_json::from_str(report.outputs.get("NESTED").unwrap()).unwrap();
    assert_eq!(nested["CHILD_VALUE"], "from-child");
}
