//! Error types for the scheduling engine.

use thiserror::Error;

use cadence_store::StoreError;

/// Errors that can occur in engine operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Operation referenced a task id that does not exist.
    #[error("task not found: {0}")]
    TaskNotFound(i64),

    /// The store was unreachable or rejected the operation. A reconciliation
    /// cycle that hits this simply retries at the next poll.
    #[error(transparent)]
    Store(#[from] StoreError),
}
