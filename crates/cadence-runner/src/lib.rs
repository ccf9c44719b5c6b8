//! Environment resolution and process execution for Cadence tasks.
//!
//! Resolution classifies a task target into the environment it needs —
//! native batch script, uv-managed project, or isolated venv — and produces
//! the concrete working directory and argv. Execution spawns that command,
//! captures capped combined output, and reports success without ever letting
//! an error escape a single task's boundary.

mod error;
mod exec;
mod resolve;

pub use error::{EnvironmentProbe, ResolveError};
pub use exec::{run, RunOutcome, OUTPUT_CAP_BYTES, TRUNCATION_MARKER};
pub use resolve::{project_commands, resolve, Environment, ResolvedCommand};
