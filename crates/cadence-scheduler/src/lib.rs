//! Scheduling engine for Cadence.
//!
//! This crate owns the live set of armed jobs:
//! - computes each job's next fire time from its interval and optional
//!   daily anchor time
//! - tolerates late fires within a bounded grace window, coalescing missed
//!   slots into one catch-up fire
//! - periodically diffs the task store against the armed set and applies
//!   add/update/remove without disturbing unaffected jobs (hot-reload)
//! - dispatches due jobs concurrently and records every outcome

mod engine;
mod error;
mod types;

pub use engine::{
    Engine, EngineConfig, FireRequest, JobRunner, ReconcileSummary, process_runner,
};
pub use error::SchedulerError;
pub use types::{ArmedJob, JobState, fingerprint, misfire_grace, next_fire_time};
