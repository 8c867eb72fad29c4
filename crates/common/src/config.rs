//! Process configuration
//!
//! Settings for the run host and worker: where logs go, how many runs may
//! be active, how the worker reaches its coordinator. Loaded from defaults,
//! an optional `config.toml`, and `DAGFORGE__`-prefixed environment
//! variables.

use std::path::{Path, PathBuf};

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub run: RunConfig,
    pub worker: WorkerConfig,
    pub observability: ObservabilityConfig,
}

/// Run-host configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// Directory receiving per-step log files.
    pub log_dir: PathBuf,
    /// Process-wide cap on concurrently active runs (0 = unbounded).
    pub max_active_runs: usize,
    /// Grace period between a stop signal and a hard kill.
    pub max_cleanup_time_ms: u64,
    /// Where the scheduler persists its watermark state.
    pub watermark_path: PathBuf,
}

/// Worker / dispatch configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Coordinator base URL; absent means no coordinator is reachable.
    pub coordinator_endpoint: Option<String>,
    /// Where steps execute when neither the step nor the DAG says.
    pub default_mode: ExecutionMode,
    /// Per-stream buffer before a log chunk is flushed to the coordinator.
    pub log_stream_buffer_bytes: usize,
}

/// Default execution placement for steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Local,
    Distributed,
}

/// Observability configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    pub metrics_enabled: bool,
    /// TCP port for the Prometheus exporter; 0 disables it.
    pub metrics_port: u16,
}

/// Log format
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl Config {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder()
            .set_default("run.log_dir", "/var/log/dagforge")?
            .set_default("run.max_active_runs", 0)?
            .set_default("run.max_cleanup_time_ms", 5000)?
            .set_default("run.watermark_path", "/var/lib/dagforge/scheduler.json")?
            .set_default("worker.worker_id", "local")?
            .set_default("worker.default_mode", "local")?
            .set_default("worker.log_stream_buffer_bytes", 32 * 1024)?
            .set_default("observability.log_level", "info")?
            .set_default("observability.log_format", "pretty")?
            .set_default("observability.metrics_enabled", true)?
            .set_default("observability.metrics_port", 0)?;

        if Path::new("config.toml").exists() {
            builder = builder.add_source(File::with_name("config"));
        }

        builder = builder.add_source(
            Environment::with_prefix("DAGFORGE")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.worker.worker_id.is_empty() {
            errors.push("worker_id must not be empty".to_string());
        }
        if self.worker.log_stream_buffer_bytes == 0 {
            errors.push("log_stream_buffer_bytes must be greater than 0".to_string());
        }
        if let Some(endpoint) = &self.worker.coordinator_endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                errors.push(format!("coordinator_endpoint {endpoint:?} must be an http(s) URL"));
            }
        }
        if self.run.max_cleanup_time_ms == 0 {
            errors.push("max_cleanup_time_ms must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            run: RunConfig {
                log_dir: PathBuf::from("/var/log/dagforge"),
                max_active_runs: 0,
                max_cleanup_time_ms: 5000,
                watermark_path: PathBuf::from("/var/lib/dagforge/scheduler.json"),
            },
            worker: WorkerConfig {
                worker_id: "local".to_string(),
                coordinator_endpoint: None,
                default_mode: ExecutionMode::Local,
                log_stream_buffer_bytes: 32 * 1024,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                log_format: LogFormat::Pretty,
                metrics_enabled: true,
                metrics_port: 0,
            },
        }
    }
}
