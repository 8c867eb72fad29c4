//! Metrics collection and reporting

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, GaugeVec,
    HistogramVec, Registry,
};

use crate::error::{Error, Result};

/// Global metrics registry
pub static METRICS_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Completed runs by final status
pub static RUNS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "dagforge_runs_total",
        "Total number of completed DAG runs",
        &["status"]
    )
    .unwrap()
});

/// Completed step executions by status and executor type
pub static STEPS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "dagforge_steps_total",
        "Total number of completed step executions",
        &["status", "executor"]
    )
    .unwrap()
});

/// Step duration histogram
pub static STEP_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "dagforge_step_duration_seconds",
        "Step execution duration in seconds",
        &["executor"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 1800.0]
    )
    .unwrap()
});

/// Currently active runs per queue
pub static ACTIVE_RUNS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "dagforge_active_runs",
        "Number of currently active DAG runs",
        &["queue"]
    )
    .unwrap()
});

/// Errors by taxonomy kind
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "dagforge_errors_total",
        "Total number of errors by kind",
        &["kind"]
    )
    .unwrap()
});

/// Initialize all metrics
pub fn init_metrics() -> Result<()> {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(RUNS_TOTAL.clone()),
        Box::new(STEPS_TOTAL.clone()),
        Box::new(STEP_DURATION.clone()),
        Box::new(ACTIVE_RUNS.clone()),
        Box::new(ERRORS_TOTAL.clone()),
    ];
    for collector in collectors {
        METRICS_REGISTRY
            .register(collector)
            .map_err(|e| Error::Internal(format!("metrics registration failed: {e}")))?;
    }
    Ok(())
}

/// Metrics collector trait
pub trait MetricsCollector: Send + Sync {
    /// Record a completed run
    fn record_run(&self, status: &str);

    /// Record a completed step execution
    fn record_step(&self, status: &str, executor: &str, duration_secs: f64);

    /// Record an error by taxonomy kind
    fn record_error(&self, kind: &str);

    /// Adjust the active-run gauge for a queue
    fn set_active_runs(&self, queue: &str, count: f64);
}

/// Default metrics collector implementation
#[derive(Clone, Default)]
pub struct DefaultMetricsCollector;

impl MetricsCollector for DefaultMetricsCollector {
    fn record_run(&self, status: &str) {
        RUNS_TOTAL.with_label_values(&[status]).inc();
    }

    fn record_step(&self, status: &str, executor: &str, duration_secs: f64) {
        STEPS_TOTAL.with_label_values(&[status, executor]).inc();
        STEP_DURATION
            .with_label_values(&[executor])
            .observe(duration_secs);
    }

    fn record_error(&self, kind: &str) {
        ERRORS_TOTAL.with_label_values(&[kind]).inc();
    }

    fn set_active_runs(&self, queue: &str, count: f64) {
        ACTIVE_RUNS.with_label_values(&[queue]).set(count);
    }
}
