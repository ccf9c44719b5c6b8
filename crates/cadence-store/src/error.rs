//! Error types for the task store.

use thiserror::Error;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No task exists with the given id.
    #[error("task not found: {0}")]
    NotFound(i64),

    /// Rejected before anything was written.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Underlying SQLite failure. Fatal to the operation attempted, never to
    /// the caller's process.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A persisted row could not be decoded.
    #[error("malformed row for task {id}: {reason}")]
    Malformed { id: i64, reason: String },
}

/// Validation failures for task definitions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("task name must not be empty")]
    EmptyName,

    #[error("interval must be at least one minute")]
    ZeroInterval,
}
