#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Common types and utilities for the dagforge execution core
//!
//! This crate provides shared functionality across all dagforge components:
//! the error taxonomy, duration parsing, the cancellation-aware retry
//! helper, socket-address derivation, log-file naming, signal tables,
//! telemetry setup, metrics, and process configuration.

pub mod config;
pub mod duration;
pub mod error;
pub mod fileutil;
pub mod metrics;
pub mod retry;
pub mod signals;
pub mod sock;
pub mod telemetry;

pub use config::Config;
pub use error::{Error, ErrorList, Result};

/// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use uuid::Uuid;
