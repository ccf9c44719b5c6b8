//! SQLite-backed task store for Cadence.
//!
//! This crate owns the persisted state:
//! - the `tasks` table of schedulable definitions
//! - the append-only `task_history` table of execution outcomes
//!
//! The store is the single source of truth shared between the daemon and any
//! concurrently running CLI process. Writes are atomic per statement; WAL
//! mode lets one process write while another reads.

mod error;
mod store;
mod types;

pub use error::{StoreError, ValidationError};
pub use store::{TaskStore, DELETED_TASK_SENTINEL};
pub use types::{HistoryEntry, LastRun, NewTask, Task, TaskPatch, TaskTarget};
