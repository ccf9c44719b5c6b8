//! SQLite persistence for tasks and their execution history.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Local, NaiveTime};
use rusqlite::{Connection, Row, params};
use tracing::info;

use crate::error::{StoreError, ValidationError};
use crate::types::{HistoryEntry, LastRun, NewTask, Task, TaskPatch, TaskTarget};

/// Name reported for history rows whose task has been deleted.
pub const DELETED_TASK_SENTINEL: &str = "(deleted)";

const START_TIME_FORMAT: &str = "%H:%M";

/// SQLite-backed task store.
///
/// One connection guarded by a mutex; statement-level atomicity is the whole
/// concurrency contract. Other processes open their own connections against
/// the same file.
pub struct TaskStore {
    conn: Mutex<Connection>,
}

impl TaskStore {
    /// Open or create the task database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "task store opened");
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        // WAL so a concurrently running CLI can write while the daemon reads
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                target TEXT NOT NULL,
                arguments TEXT NOT NULL DEFAULT '[]',
                interval_minutes INTEGER NOT NULL,
                start_time TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                executed_at TEXT NOT NULL,
                success INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_task ON task_history(task_id);
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    /// Insert a new task and return it with its assigned id.
    ///
    /// Validation happens before anything touches the database.
    pub fn create(&self, new: NewTask) -> Result<Task, StoreError> {
        validate(&new.name, new.interval_minutes)?;

        let created_at = Local::now();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tasks (name, target, arguments, interval_minutes, start_time, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                new.name,
                encode_target(&new.target),
                encode_arguments(&new.arguments),
                new.interval_minutes,
                new.start_time.map(encode_start_time),
                created_at.to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();

        Ok(Task {
            id,
            name: new.name,
            target: new.target,
            arguments: new.arguments,
            interval_minutes: new.interval_minutes,
            start_time: new.start_time,
            created_at,
        })
    }

    /// Fetch a single task by id.
    pub fn get(&self, id: i64) -> Result<Task, StoreError> {
        let conn = self.conn.lock().unwrap();
        get_locked(&conn, id)
    }

    /// All tasks, ordered by id.
    pub fn get_all(&self) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, target, arguments, interval_minutes, start_time, created_at
             FROM tasks ORDER BY id",
        )?;
        let raws = stmt
            .query_map([], raw_task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        raws.into_iter().map(decode_task).collect()
    }

    /// Apply a partial update. The merged row is validated and written in a
    /// single statement, so an update is never partially applied.
    pub fn update(&self, id: i64, patch: TaskPatch) -> Result<Task, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut task = get_locked(&conn, id)?;

        if let Some(name) = patch.name {
            task.name = name;
        }
        if let Some(target) = patch.target {
            task.target = target;
        }
        if let Some(arguments) = patch.arguments {
            task.arguments = arguments;
        }
        if let Some(interval) = patch.interval_minutes {
            task.interval_minutes = interval;
        }
        if let Some(start_time) = patch.start_time {
            task.start_time = start_time;
        }

        validate(&task.name, task.interval_minutes)?;

        conn.execute(
            "UPDATE tasks
             SET name = ?1, target = ?2, arguments = ?3, interval_minutes = ?4, start_time = ?5
             WHERE id = ?6",
            params![
                task.name,
                encode_target(&task.target),
                encode_arguments(&task.arguments),
                task.interval_minutes,
                task.start_time.map(encode_start_time),
                id,
            ],
        )?;

        Ok(task)
    }

    /// Delete a task. History rows are retained, still referencing the id.
    pub fn delete(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    // =========================================================================
    // Execution history
    // =========================================================================

    /// Append one execution outcome. Never mutates existing rows.
    pub fn record_execution(&self, task_id: i64, success: bool) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO task_history (task_id, executed_at, success) VALUES (?1, ?2, ?3)",
            params![task_id, Local::now().to_rfc3339(), success],
        )?;
        Ok(())
    }

    /// Most recent executions, newest first, joined best-effort with the
    /// owning task. Rows whose task was deleted carry a sentinel name.
    pub fn recent_executions(&self, limit: usize) -> Result<Vec<HistoryEntry>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT h.task_id, h.executed_at, h.success, t.name, t.target
             FROM task_history h
             LEFT JOIN tasks t ON t.id = h.task_id
             ORDER BY h.executed_at DESC, h.id DESC
             LIMIT ?1",
        )?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(task_id, executed_at, success, name, target)| {
                Ok(HistoryEntry {
                    task_id,
                    executed_at: decode_datetime(task_id, &executed_at)?,
                    success,
                    task_name: name.unwrap_or_else(|| DELETED_TASK_SENTINEL.to_string()),
                    target: match target {
                        Some(t) => Some(decode_target(task_id, &t)?),
                        None => None,
                    },
                })
            })
            .collect()
    }

    /// The most recent execution per task id.
    pub fn last_execution_per_task(&self) -> Result<HashMap<i64, LastRun>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT h.task_id, h.executed_at, h.success
             FROM task_history h
             JOIN (SELECT task_id, MAX(id) AS max_id FROM task_history GROUP BY task_id) m
               ON m.max_id = h.id",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut map = HashMap::with_capacity(rows.len());
        for (task_id, executed_at, success) in rows {
            map.insert(
                task_id,
                LastRun {
                    executed_at: decode_datetime(task_id, &executed_at)?,
                    success,
                },
            );
        }
        Ok(map)
    }

    // =========================================================================
    // Change detection
    // =========================================================================

    /// SQLite's cross-connection change counter. Bumps whenever another
    /// connection commits, so reconciliation can cheaply skip unchanged polls.
    pub fn data_version(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("PRAGMA data_version", [], |row| row.get(0))?)
    }
}

fn validate(name: &str, interval_minutes: u32) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if interval_minutes == 0 {
        return Err(ValidationError::ZeroInterval);
    }
    Ok(())
}

fn get_locked(conn: &Connection, id: i64) -> Result<Task, StoreError> {
    let raw = conn
        .query_row(
            "SELECT id, name, target, arguments, interval_minutes, start_time, created_at
             FROM tasks WHERE id = ?1",
            params![id],
            raw_task_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound(id))?;

    decode_task(raw)
}

// Row data before JSON/time decoding.
struct RawTask {
    id: i64,
    name: String,
    target: String,
    arguments: String,
    interval_minutes: u32,
    start_time: Option<String>,
    created_at: String,
}

fn raw_task_from_row(row: &Row) -> rusqlite::Result<RawTask> {
    Ok(RawTask {
        id: row.get(0)?,
        name: row.get(1)?,
        target: row.get(2)?,
        arguments: row.get(3)?,
        interval_minutes: row.get(4)?,
        start_time: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn decode_task(raw: RawTask) -> Result<Task, StoreError> {
    let id = raw.id;
    let arguments: Vec<String> = serde_json::from_str(&raw.arguments).map_err(|e| {
        StoreError::Malformed {
            id,
            reason: format!("arguments: {e}"),
        }
    })?;
    let start_time = match raw.start_time {
        Some(s) => Some(decode_start_time(id, &s)?),
        None => None,
    };

    Ok(Task {
        id,
        name: raw.name,
        target: decode_target(id, &raw.target)?,
        arguments,
        interval_minutes: raw.interval_minutes,
        start_time,
        created_at: decode_datetime(id, &raw.created_at)?,
    })
}

fn encode_target(target: &TaskTarget) -> String {
    serde_json::to_string(target).expect("target serialization is infallible")
}

fn decode_target(id: i64, s: &str) -> Result<TaskTarget, StoreError> {
    serde_json::from_str(s).map_err(|e| StoreError::Malformed {
        id,
        reason: format!("target: {e}"),
    })
}

/// Arguments are stored as a JSON array so order and exact string values
/// (spaces, brackets, quotes) round-trip byte for byte.
fn encode_arguments(arguments: &[String]) -> String {
    serde_json::to_string(arguments).expect("argument serialization is infallible")
}

fn encode_start_time(t: NaiveTime) -> String {
    t.format(START_TIME_FORMAT).to_string()
}

fn decode_start_time(id: i64, s: &str) -> Result<NaiveTime, StoreError> {
    NaiveTime::parse_from_str(s, START_TIME_FORMAT).map_err(|e| StoreError::Malformed {
        id,
        reason: format!("start_time: {e}"),
    })
}

fn decode_datetime(id: i64, s: &str) -> Result<DateTime<Local>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Local))
        .map_err(|e| StoreError::Malformed {
            id,
            reason: format!("timestamp: {e}"),
        })
}

/// Extension trait for optional query results.
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error>;
}

impl<T> OptionalExt<T> for Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn script_task(name: &str) -> NewTask {
        NewTask {
            name: name.to_string(),
            target: TaskTarget::Script {
                path: PathBuf::from("/opt/jobs/report.py"),
            },
            arguments: vec![],
            interval_minutes: 30,
            start_time: None,
        }
    }

    #[test]
    fn create_assigns_sequential_ids() {
        let store = TaskStore::open_in_memory().unwrap();
        let a = store.create(script_task("a")).unwrap();
        let b = store.create(script_task("b")).unwrap();
        assert!(b.id > a.id);
    }

    #[test]
    fn create_rejects_empty_name() {
        let store = TaskStore::open_in_memory().unwrap();
        let err = store.create(script_task("  ")).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Validation(ValidationError::EmptyName)
        ));
        assert!(store.get_all().unwrap().is_empty());
    }

    #[test]
    fn create_rejects_zero_interval() {
        let store = TaskStore::open_in_memory().unwrap();
        let mut new = script_task("t");
        new.interval_minutes = 0;
        let err = store.create(new).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Validation(ValidationError::ZeroInterval)
        ));
    }

    #[test]
    fn arguments_round_trip_exactly() {
        let store = TaskStore::open_in_memory().unwrap();
        let mut new = script_task("args");
        new.arguments = vec![
            "--a".to_string(),
            "value with spaces".to_string(),
            "[brackets]".to_string(),
        ];
        let created = store.create(new.clone()).unwrap();

        let fetched = store.get(created.id).unwrap();
        assert_eq!(fetched.arguments, new.arguments);
    }

    #[test]
    fn start_time_round_trips() {
        let store = TaskStore::open_in_memory().unwrap();
        let mut new = script_task("anchored");
        new.start_time = Some(NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        let created = store.create(new).unwrap();

        let fetched = store.get(created.id).unwrap();
        assert_eq!(
            fetched.start_time,
            Some(NaiveTime::from_hms_opt(9, 0, 0).unwrap())
        );
    }

    #[test]
    fn project_target_round_trips() {
        let store = TaskStore::open_in_memory().unwrap();
        let mut new = script_task("proj");
        new.target = TaskTarget::Project {
            dir: PathBuf::from("/opt/projects/etl"),
            command: "sync-all --full".to_string(),
        };
        let created = store.create(new.clone()).unwrap();

        let fetched = store.get(created.id).unwrap();
        assert_eq!(fetched.target, new.target);
    }

    #[test]
    fn update_applies_only_patched_fields() {
        let store = TaskStore::open_in_memory().unwrap();
        let created = store.create(script_task("orig")).unwrap();

        let updated = store
            .update(
                created.id,
                TaskPatch {
                    interval_minutes: Some(5),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(updated.name, "orig");
        assert_eq!(updated.interval_minutes, 5);
        assert_eq!(store.get(created.id).unwrap().interval_minutes, 5);
    }

    #[test]
    fn update_can_clear_start_time() {
        let store = TaskStore::open_in_memory().unwrap();
        let mut new = script_task("anchored");
        new.start_time = Some(NaiveTime::from_hms_opt(6, 30, 0).unwrap());
        let created = store.create(new).unwrap();

        let updated = store
            .update(
                created.id,
                TaskPatch {
                    start_time: Some(None),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.start_time, None);
        assert_eq!(store.get(created.id).unwrap().start_time, None);
    }

    #[test]
    fn update_missing_task_reports_not_found() {
        let store = TaskStore::open_in_memory().unwrap();
        let err = store.update(999, TaskPatch::default()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(999)));
    }

    #[test]
    fn delete_removes_task_but_keeps_history() {
        let store = TaskStore::open_in_memory().unwrap();
        let created = store.create(script_task("doomed")).unwrap();
        store.record_execution(created.id, true).unwrap();

        store.delete(created.id).unwrap();
        assert!(matches!(
            store.get(created.id),
            Err(StoreError::NotFound(_))
        ));

        let history = store.recent_executions(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].task_id, created.id);
        assert_eq!(history[0].task_name, DELETED_TASK_SENTINEL);
        assert_eq!(history[0].target, None);
    }

    #[test]
    fn ids_are_never_reused_after_delete() {
        let store = TaskStore::open_in_memory().unwrap();
        let first = store.create(script_task("first")).unwrap();
        store.delete(first.id).unwrap();

        let second = store.create(script_task("second")).unwrap();
        assert!(second.id > first.id);
    }

    #[test]
    fn recent_executions_newest_first() {
        let store = TaskStore::open_in_memory().unwrap();
        let task = store.create(script_task("t")).unwrap();
        store.record_execution(task.id, true).unwrap();
        store.record_execution(task.id, false).unwrap();
        store.record_execution(task.id, true).unwrap();

        let history = store.recent_executions(2).unwrap();
        assert_eq!(history.len(), 2);
        // Same-second timestamps fall back to insertion order, newest first
        assert!(history[0].executed_at >= history[1].executed_at);
        assert!(history[0].success);
        assert!(!history[1].success);
    }

    #[test]
    fn last_execution_per_task_picks_latest() {
        let store = TaskStore::open_in_memory().unwrap();
        let a = store.create(script_task("a")).unwrap();
        let b = store.create(script_task("b")).unwrap();
        store.record_execution(a.id, false).unwrap();
        store.record_execution(a.id, true).unwrap();
        store.record_execution(b.id, false).unwrap();

        let last = store.last_execution_per_task().unwrap();
        assert_eq!(last.len(), 2);
        assert!(last[&a.id].success);
        assert!(!last[&b.id].success);
    }

    #[test]
    fn data_version_bumps_on_foreign_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.sqlite3");

        let ours = TaskStore::open(&path).unwrap();
        let theirs = TaskStore::open(&path).unwrap();

        let before = ours.data_version().unwrap();
        theirs.create(script_task("external")).unwrap();
        let after = ours.data_version().unwrap();

        assert_ne!(before, after);
    }
}
