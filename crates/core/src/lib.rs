#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Core model and contracts for the dagforge execution core
//!
//! This crate defines the compiled workflow model (DAG, steps, policies,
//! schedules), the run/node status machinery, and the executor contract
//! plus its process-wide registry. The engine crate builds the node
//! runtime and scheduler on top of these types.

pub mod condition;
pub mod dag;
pub mod executor;
pub mod params;
pub mod policy;
pub mod registry;
pub mod schedule;
pub mod status;
pub mod step;

pub use condition::Condition;
pub use dag::{Dag, DagType, HandlerOn};
pub use executor::{Capabilities, ExecCtx, Executor};
pub use params::Params;
pub use policy::{ContinueOn, RepeatMode, RepeatPolicy, RetryPolicy};
pub use schedule::{CatchupPolicy, MisfirePolicy, OverlapPolicy, SchedulerState};
pub use status::{DagRunStatus, NodeStatus, Status};
pub use step::{ParallelConfig, Step, SubDag, SubDagRun};
