//! Store types.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Local, NaiveTime};
use serde::{Deserialize, Serialize};

/// What a task runs: either a script/batch file on disk, or a command inside
/// a package-managed project directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskTarget {
    /// A script or batch file; the environment is probed from its directory.
    Script { path: PathBuf },
    /// A declared entry point (or arbitrary command string) run via the
    /// package manager inside `dir`.
    Project { dir: PathBuf, command: String },
}

impl fmt::Display for TaskTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskTarget::Script { path } => write!(f, "{}", path.display()),
            TaskTarget::Project { dir, command } => {
                write!(f, "{} (in {})", command, dir.display())
            }
        }
    }
}

/// A persisted schedulable unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    /// Unique, assigned on creation, never reused.
    pub id: i64,
    /// Display name, non-empty.
    pub name: String,
    pub target: TaskTarget,
    /// Positional CLI arguments, order significant.
    pub arguments: Vec<String>,
    /// Fires repeatedly at this cadence.
    pub interval_minutes: u32,
    /// Optional daily wall-clock anchor; fire times snap to
    /// `start_time + k * interval` when present.
    pub start_time: Option<NaiveTime>,
    pub created_at: DateTime<Local>,
}

/// Fields for creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub target: TaskTarget,
    pub arguments: Vec<String>,
    pub interval_minutes: u32,
    pub start_time: Option<NaiveTime>,
}

/// Partial update for a task. `None` leaves the field unchanged;
/// `start_time` uses a nested option so the anchor can be cleared.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub name: Option<String>,
    pub target: Option<TaskTarget>,
    pub arguments: Option<Vec<String>>,
    pub interval_minutes: Option<u32>,
    pub start_time: Option<Option<NaiveTime>>,
}

/// One execution outcome, joined best-effort with the owning task.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// Reference, not ownership: survives task deletion.
    pub task_id: i64,
    pub executed_at: DateTime<Local>,
    pub success: bool,
    /// Current task name, or a sentinel if the task was deleted.
    pub task_name: String,
    /// Current target, absent if the task was deleted.
    pub target: Option<TaskTarget>,
}

/// Most recent execution of a single task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LastRun {
    pub executed_at: DateTime<Local>,
    pub success: bool,
}
