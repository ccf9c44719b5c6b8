//! Armed-job types and fire-time arithmetic.

use chrono::{DateTime, Duration, Local, NaiveTime, TimeZone};

use cadence_store::{Task, TaskTarget};

/// A task armed in the engine. Not persisted; rebuilt from the store on
/// startup and on every reconciliation.
#[derive(Debug, Clone)]
pub struct ArmedJob {
    pub task_id: i64,
    pub name: String,
    pub target: TaskTarget,
    pub arguments: Vec<String>,
    pub interval_minutes: u32,
    pub start_time: Option<NaiveTime>,
    /// Strictly in the future immediately after (re)arming or firing.
    pub next_fire: DateTime<Local>,
    /// Content fingerprint of the task fields, used by reconciliation to
    /// detect edits without a field-by-field diff.
    pub fingerprint: String,
    pub state: JobState,
}

/// Per-job state machine: `Scheduled -> Running -> Scheduled`. There is no
/// failed terminal state — a failed run reschedules like a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Scheduled,
    Running,
}

impl ArmedJob {
    /// Arm a task as of `now`, computing its first fire time.
    pub fn arm(task: &Task, now: DateTime<Local>) -> Self {
        Self {
            task_id: task.id,
            name: task.name.clone(),
            target: task.target.clone(),
            arguments: task.arguments.clone(),
            interval_minutes: task.interval_minutes,
            start_time: task.start_time,
            next_fire: next_fire_time(now, task.interval_minutes, task.start_time),
            fingerprint: fingerprint(task),
            state: JobState::Scheduled,
        }
    }

    /// Whether this job should fire now. A Running job is never due — each
    /// job's timeline is serialized against itself.
    pub fn is_due(&self, now: DateTime<Local>) -> bool {
        self.state == JobState::Scheduled && self.next_fire <= now
    }

    /// How late a fire may be and still fire (once).
    pub fn grace(&self) -> Duration {
        misfire_grace(self.interval_minutes)
    }

    /// Advance the schedule after a fire (or after skipping a slot missed
    /// beyond the grace window). Anchored jobs snap back onto their grid;
    /// the slot that just fired is excluded so it can never fire twice.
    pub fn advance(&mut self, after: DateTime<Local>) {
        self.next_fire = match self.start_time {
            Some(anchor) => next_aligned(after, anchor, self.interval_minutes, false),
            None => after + Duration::minutes(i64::from(self.interval_minutes)),
        };
        self.state = JobState::Scheduled;
    }
}

/// The first fire time for a task armed at `now`.
///
/// Without an anchor the task fires immediately — on add and again on every
/// engine startup. With an anchor the fire lands on the smallest grid slot
/// `start_time + k * interval` at or after `now` (inclusive at the exact
/// instant, exclusive just after).
pub fn next_fire_time(
    now: DateTime<Local>,
    interval_minutes: u32,
    start_time: Option<NaiveTime>,
) -> DateTime<Local> {
    match start_time {
        Some(anchor) => next_aligned(now, anchor, interval_minutes, true),
        None => now,
    }
}

/// Misfire grace window: at least a minute, at most an hour, otherwise 10%
/// of the interval.
pub fn misfire_grace(interval_minutes: u32) -> Duration {
    let tenth = i64::from(interval_minutes) * 60 / 10;
    Duration::seconds(tenth.clamp(60, 3600))
}

/// The smallest grid slot `anchor + k * interval` after `now`.
///
/// The grid is anchored to the wall clock, not to the last fire, so it is
/// identical across restarts and never drifts. `k` ranges over all integers:
/// the grid extends backwards before the anchor and wraps across days.
fn next_aligned(
    now: DateTime<Local>,
    anchor: NaiveTime,
    interval_minutes: u32,
    inclusive: bool,
) -> DateTime<Local> {
    let interval_secs = i64::from(interval_minutes) * 60;
    let now_naive = now.naive_local();
    let anchor_naive = now.date_naive().and_time(anchor);

    let offset_secs = (now_naive - anchor_naive).num_seconds();
    let k = offset_secs.div_euclid(interval_secs);
    // Largest slot at or before `now` (to second precision)
    let mut candidate = anchor_naive + Duration::seconds(k * interval_secs);

    if candidate < now_naive || (!inclusive && candidate == now_naive) {
        candidate += Duration::seconds(interval_secs);
    }

    // A slot can land inside a DST gap; such a local time does not exist, so
    // advance to the next slot that does.
    loop {
        match Local.from_local_datetime(&candidate) {
            chrono::LocalResult::Single(dt) => return dt,
            chrono::LocalResult::Ambiguous(earliest, _) => return earliest,
            chrono::LocalResult::None => candidate += Duration::seconds(interval_secs),
        }
    }
}

/// Fingerprint of the task fields reconciliation cares about. Any edit to
/// name, target, arguments, interval, or anchor changes it.
pub fn fingerprint(task: &Task) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(task.name.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(
        serde_json::to_string(&task.target)
            .expect("target serialization is infallible")
            .as_bytes(),
    );
    hasher.update(b"\x1f");
    hasher.update(
        serde_json::to_string(&task.arguments)
            .expect("argument serialization is infallible")
            .as_bytes(),
    );
    hasher.update(b"\x1f");
    hasher.update(&task.interval_minutes.to_le_bytes());
    hasher.update(b"\x1f");
    if let Some(anchor) = task.start_time {
        hasher.update(anchor.format("%H:%M").to_string().as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}
