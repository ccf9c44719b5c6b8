//! The scheduling engine: armed-job set, fire dispatch, hot-reload.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Local;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use cadence_runner::{RunOutcome, resolve, run};
use cadence_store::{StoreError, Task, TaskStore, TaskTarget};

use crate::error::SchedulerError;
use crate::types::{ArmedJob, JobState, fingerprint};

/// Minimum sleep duration between due-time checks.
const MIN_SLEEP_SECS: i64 = 1;

/// Maximum sleep duration between due-time checks.
const MAX_SLEEP_SECS: i64 = 60;

/// Everything the runner needs to execute one fire.
#[derive(Debug, Clone)]
pub struct FireRequest {
    pub task_id: i64,
    pub name: String,
    pub target: TaskTarget,
    pub arguments: Vec<String>,
}

impl From<&Task> for FireRequest {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            name: task.name.clone(),
            target: task.target.clone(),
            arguments: task.arguments.clone(),
        }
    }
}

impl From<&ArmedJob> for FireRequest {
    fn from(job: &ArmedJob) -> Self {
        Self {
            task_id: job.task_id,
            name: job.name.clone(),
            target: job.target.clone(),
            arguments: job.arguments.clone(),
        }
    }
}

/// Type alias for the job runner function.
pub type JobRunner =
    Arc<dyn Fn(FireRequest) -> Pin<Box<dyn Future<Output = RunOutcome> + Send>> + Send + Sync>;

/// The production runner: resolve the target's environment, then execute it.
/// A resolution failure is a failed run, not an error — the task stays armed.
pub fn process_runner() -> JobRunner {
    Arc::new(|request| {
        Box::pin(async move {
            match resolve(&request.target, &request.arguments) {
                Ok(resolved) => run(&resolved).await,
                Err(e) => RunOutcome::failure(e.to_string()),
            }
        })
    })
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often to re-read the store and diff it against the armed set.
    pub reload_interval: Duration,
    /// How long to wait for in-flight executions on shutdown before they are
    /// force-terminated.
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reload_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// What a reconciliation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub armed: usize,
    pub rearmed: usize,
    pub disarmed: usize,
}

/// The scheduling engine.
///
/// All mutation of the armed set funnels through the reconcile and fire
/// paths; there is no other way in.
pub struct Engine {
    store: Arc<TaskStore>,
    runner: JobRunner,
    jobs: Arc<RwLock<HashMap<i64, ArmedJob>>>,
    config: EngineConfig,
    /// Store version at the last reconcile, for the cheap "anything
    /// changed?" fast path.
    seen_version: Mutex<Option<i64>>,
}

impl Engine {
    pub fn new(store: Arc<TaskStore>, runner: JobRunner, config: EngineConfig) -> Self {
        Self {
            store,
            runner,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            config,
            seen_version: Mutex::new(None),
        }
    }

    /// Synchronize the armed set with the store: arm new tasks, re-arm
    /// edited ones with a fresh fire time, disarm deleted ones.
    ///
    /// Idempotent, and callable at any time — an unchanged job is never
    /// touched, and an in-flight run is never interrupted.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileSummary, SchedulerError> {
        let tasks = self.store.get_all()?;
        let now = Local::now();

        let mut jobs = self.jobs.write().await;
        let mut summary = ReconcileSummary::default();
        let live_ids: HashSet<i64> = tasks.iter().map(|t| t.id).collect();

        for task in &tasks {
            match jobs.get(&task.id) {
                None => {
                    let job = ArmedJob::arm(task, now);
                    info!(task_id = task.id, name = %task.name, next_fire = %job.next_fire, "armed new task");
                    jobs.insert(task.id, job);
                    summary.armed += 1;
                }
                Some(existing) if existing.fingerprint != fingerprint(task) => {
                    // The edited schedule restarts from now; the old
                    // next-fire time is deliberately not preserved.
                    let job = ArmedJob::arm(task, now);
                    info!(task_id = task.id, name = %task.name, next_fire = %job.next_fire, "task changed, re-armed");
                    jobs.insert(task.id, job);
                    summary.rearmed += 1;
                }
                Some(_) => {}
            }
        }

        jobs.retain(|id, job| {
            if live_ids.contains(id) {
                true
            } else {
                info!(task_id = id, name = %job.name, "task deleted, disarmed");
                summary.disarmed += 1;
                false
            }
        });

        if let Ok(version) = self.store.data_version() {
            *self.seen_version.lock().unwrap() = Some(version);
        }

        debug!(?summary, armed_total = jobs.len(), "reconcile complete");
        Ok(summary)
    }

    /// Reconcile only if another process has written to the store since the
    /// last pass. Errors are logged, never fatal: the next poll retries.
    async fn maybe_reconcile(&self) {
        let changed = match self.store.data_version() {
            Ok(version) => *self.seen_version.lock().unwrap() != Some(version),
            Err(e) => {
                warn!(error = %e, "store unreachable for change probe, will retry");
                return;
            }
        };
        if !changed {
            return;
        }
        if let Err(e) = self.reconcile().await {
            warn!(error = %e, "reconcile failed, will retry at next poll");
        }
    }

    /// Execute one task immediately, without touching its armed schedule.
    ///
    /// Records the outcome like any scheduled fire; running concurrently
    /// with a scheduled fire of the same task yields two independent rows.
    pub async fn run_task_now(&self, id: i64) -> Result<RunOutcome, SchedulerError> {
        let task = self.store.get(id).map_err(|e| match e {
            StoreError::NotFound(id) => SchedulerError::TaskNotFound(id),
            other => SchedulerError::Store(other),
        })?;

        info!(task_id = id, name = %task.name, "manual run");
        let outcome = (self.runner)(FireRequest::from(&task)).await;
        self.store.record_execution(id, outcome.success)?;
        Ok(outcome)
    }

    /// A snapshot of the armed set, for status display and tests.
    pub async fn armed_jobs(&self) -> Vec<ArmedJob> {
        let jobs = self.jobs.read().await;
        let mut snapshot: Vec<ArmedJob> = jobs.values().cloned().collect();
        snapshot.sort_by_key(|j| j.task_id);
        snapshot
    }

    /// Run the engine until the shutdown signal flips.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!("scheduling engine starting");

        if let Err(e) = self.reconcile().await {
            warn!(error = %e, "initial reconcile failed, will retry at next poll");
        }

        let mut reload = tokio::time::interval(self.config.reload_interval);
        reload.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; we just reconciled
        reload.tick().await;

        let mut running: JoinSet<()> = JoinSet::new();

        loop {
            if *shutdown_rx.borrow() {
                info!("engine shutting down, no new fires");
                break;
            }

            self.dispatch_due(&mut running).await;

            let sleep_duration = self.sleep_duration().await;
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    // A dropped sender counts as a shutdown request
                    if changed.is_err() {
                        break;
                    }
                }

                _ = reload.tick() => {
                    self.maybe_reconcile().await;
                }

                Some(_) = running.join_next(), if !running.is_empty() => {}

                _ = sleep(sleep_duration) => {}
            }
        }

        self.drain(running).await;
        info!("scheduling engine shut down");
    }

    /// Fire every due job onto the running set. Late slots within the grace
    /// window fire once (missed repeats coalesce); later than that they are
    /// skipped and the job snaps back onto its schedule.
    async fn dispatch_due(&self, running: &mut JoinSet<()>) {
        let now = Local::now();
        let mut jobs = self.jobs.write().await;

        for job in jobs.values_mut() {
            if !job.is_due(now) {
                continue;
            }

            if now - job.next_fire > job.grace() {
                warn!(
                    task_id = job.task_id,
                    name = %job.name,
                    missed = %job.next_fire,
                    "fire missed beyond grace window, skipping to next slot"
                );
                job.advance(now);
                continue;
            }

            job.state = JobState::Running;
            let request = FireRequest::from(&*job);
            let guard_fingerprint = job.fingerprint.clone();
            let store = Arc::clone(&self.store);
            let runner = Arc::clone(&self.runner);
            let jobs_map = Arc::clone(&self.jobs);

            running.spawn(async move {
                fire(request, guard_fingerprint, store, runner, jobs_map).await;
            });
        }
    }

    /// How long to sleep until the next scheduled job is due.
    async fn sleep_duration(&self) -> Duration {
        let jobs = self.jobs.read().await;
        let now = Local::now();

        let next_due = jobs
            .values()
            .filter(|j| j.state == JobState::Scheduled)
            .map(|j| j.next_fire)
            .min();

        let secs = match next_due {
            Some(next) => (next - now).num_seconds().clamp(MIN_SLEEP_SECS, MAX_SLEEP_SECS),
            None => MAX_SLEEP_SECS,
        };

        Duration::from_secs(secs as u64)
    }

    /// Let in-flight executions finish, bounded by the grace deadline; abort
    /// whatever remains (their processes are killed on drop).
    async fn drain(&self, mut running: JoinSet<()>) {
        if running.is_empty() {
            return;
        }

        info!(in_flight = running.len(), "waiting for running tasks to finish");
        let all_done = tokio::time::timeout(self.config.shutdown_grace, async {
            while running.join_next().await.is_some() {}
        })
        .await;

        if all_done.is_err() {
            warn!(
                remaining = running.len(),
                "shutdown grace deadline passed, terminating remaining tasks"
            );
            running.abort_all();
            while running.join_next().await.is_some() {}
        }
    }
}

/// One fire, start to finish: execute, record, re-arm.
///
/// The three steps are deliberately not transactional — a crash between
/// execution and the history write loses that row, but the schedule re-arms
/// correctly on restart because fire times derive from interval/anchor, not
/// from history.
async fn fire(
    request: FireRequest,
    guard_fingerprint: String,
    store: Arc<TaskStore>,
    runner: JobRunner,
    jobs: Arc<RwLock<HashMap<i64, ArmedJob>>>,
) {
    let task_id = request.task_id;
    let name = request.name.clone();
    info!(task_id, name = %name, "firing task");

    let outcome = runner(request).await;

    if outcome.success {
        info!(
            task_id,
            name = %name,
            duration_ms = outcome.duration.as_millis() as u64,
            "task succeeded"
        );
    } else {
        warn!(
            task_id,
            name = %name,
            reason = outcome.reason.as_deref().unwrap_or("unknown"),
            "task failed"
        );
        if !outcome.output.is_empty() {
            debug!(task_id, output = %outcome.output, "captured output of failed task");
        }
    }

    // The task may have been deleted mid-run; its outcome is still recorded,
    // referencing the dangling id.
    if let Err(e) = store.record_execution(task_id, outcome.success) {
        error!(task_id, error = %e, "failed to record execution");
    }

    // Re-arm — unless reconciliation replaced or removed this job while it
    // ran, in which case the fresh schedule must not be clobbered.
    let mut jobs = jobs.write().await;
    if let Some(job) = jobs.get_mut(&task_id) {
        if job.fingerprint == guard_fingerprint {
            job.advance(Local::now());
            debug!(task_id, next_fire = %job.next_fire, "re-armed after fire");
        }
    }
}
