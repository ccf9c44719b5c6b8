//! Cadence: periodic script scheduler.
//!
//! Main binary with subcommands:
//! - `daemon`: the scheduling engine (fires tasks, hot-reloads the store)
//! - `add`/`edit`/`delete`/`list`: task management
//! - `run`: execute one task immediately
//! - `history`: recent execution outcomes
//! - `commands`: list a managed project's declared entry points
//!
//! Everything except `daemon` is a thin shell over the store and engine
//! operations — a task edited here is picked up by a running daemon at its
//! next reconciliation poll.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, NaiveTime};
use clap::{Args, Parser, Subcommand};
use miette::{Result, miette};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cadence_runner::project_commands;
use cadence_scheduler::{Engine, EngineConfig, next_fire_time, process_runner};
use cadence_store::{NewTask, TaskPatch, TaskStore, TaskTarget};

mod daemon;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Periodic script scheduler", long_about = None)]
struct Cli {
    /// Path to the task database (defaults to the platform data directory)
    #[arg(long, env = "CADENCE_DB", global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Task target flags shared by `add` and `edit`.
#[derive(Args, Default)]
struct TargetArgs {
    /// Path to a script or batch file
    #[arg(long, value_name = "PATH", conflicts_with = "project_dir")]
    script: Option<PathBuf>,

    /// Managed project directory (requires --command)
    #[arg(long, value_name = "DIR", requires = "command")]
    project_dir: Option<PathBuf>,

    /// Entry-point name or command string to run inside the project
    #[arg(long, value_name = "CMD", requires = "project_dir")]
    command: Option<String>,
}

impl TargetArgs {
    fn to_target(&self) -> Option<TaskTarget> {
        if let Some(path) = &self.script {
            Some(TaskTarget::Script { path: path.clone() })
        } else if let (Some(dir), Some(command)) = (&self.project_dir, &self.command) {
            Some(TaskTarget::Project {
                dir: dir.clone(),
                command: command.clone(),
            })
        } else {
            None
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduling daemon
    Daemon {
        /// Store poll period for hot-reload, in seconds
        #[arg(long, env = "CADENCE_RELOAD_INTERVAL", default_value = "30")]
        reload_interval: u64,

        /// How long to let in-flight scripts finish on shutdown, in seconds
        #[arg(long, env = "CADENCE_SHUTDOWN_GRACE", default_value = "30")]
        shutdown_grace: u64,
    },

    /// Add a task (armed by the daemon within one reconciliation poll)
    Add {
        /// Display name
        #[arg(long)]
        name: String,

        #[command(flatten)]
        target: TargetArgs,

        /// Interval in minutes
        #[arg(long)]
        interval: u32,

        /// Daily anchor time (HH:MM); fires snap to the anchor grid
        #[arg(long, value_parser = parse_start_time)]
        start_time: Option<NaiveTime>,

        /// Positional argument for the script (repeatable, order kept)
        #[arg(long = "arg", value_name = "ARG")]
        args: Vec<String>,
    },

    /// Edit a task; only the given fields change
    Edit {
        id: i64,

        #[arg(long)]
        name: Option<String>,

        #[command(flatten)]
        target: TargetArgs,

        /// New interval in minutes
        #[arg(long)]
        interval: Option<u32>,

        /// New daily anchor time (HH:MM)
        #[arg(long, value_parser = parse_start_time, conflicts_with = "clear_start_time")]
        start_time: Option<NaiveTime>,

        /// Drop the anchor; the task goes back to free-running intervals
        #[arg(long)]
        clear_start_time: bool,

        /// Replace the argument list (repeatable, order kept)
        #[arg(long = "arg", value_name = "ARG", conflicts_with = "clear_args")]
        args: Vec<String>,

        /// Clear the argument list
        #[arg(long)]
        clear_args: bool,
    },

    /// Delete a task (history is retained)
    Delete { id: i64 },

    /// List tasks with their next fire times and last outcomes
    List,

    /// Execute one task immediately and record the outcome
    Run { id: i64 },

    /// Recent execution history, newest first
    History {
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// List the entry-point commands a managed project declares
    Commands { dir: PathBuf },
}

fn parse_start_time(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|_| format!("invalid start time '{s}', expected HH:MM"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "cadence=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path)?;

    match cli.command {
        Commands::Daemon {
            reload_interval,
            shutdown_grace,
        } => {
            daemon::run(daemon::DaemonConfig {
                db_path,
                reload_interval: std::time::Duration::from_secs(reload_interval),
                shutdown_grace: std::time::Duration::from_secs(shutdown_grace),
            })
            .await
        }

        Commands::Add {
            name,
            target,
            interval,
            start_time,
            args,
        } => add_task(&db_path, name, &target, interval, start_time, args),

        Commands::Edit {
            id,
            name,
            target,
            interval,
            start_time,
            clear_start_time,
            args,
            clear_args,
        } => edit_task(
            &db_path,
            id,
            name,
            &target,
            interval,
            start_time,
            clear_start_time,
            args,
            clear_args,
        ),

        Commands::Delete { id } => delete_task(&db_path, id),

        Commands::List => list_tasks(&db_path),

        Commands::Run { id } => run_task(&db_path, id).await,

        Commands::History { limit } => show_history(&db_path, limit),

        Commands::Commands { dir } => list_project_commands(&dir),
    }
}

/// Resolve the database path, creating parent directories as needed.
fn resolve_db_path(cli_path: Option<PathBuf>) -> Result<PathBuf> {
    let path = match cli_path {
        Some(path) => path,
        None => {
            let dir = dirs::data_dir()
                .ok_or_else(|| miette!("no platform data directory; pass --db-path"))?
                .join("cadence");
            dir.join("tasks.sqlite3")
        }
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| miette!("failed to create {}: {}", parent.display(), e))?;
    }
    Ok(path)
}

fn open_store(db_path: &Path) -> Result<TaskStore> {
    TaskStore::open(db_path).map_err(|e| miette!("{}", e))
}

fn add_task(
    db_path: &Path,
    name: String,
    target: &TargetArgs,
    interval: u32,
    start_time: Option<NaiveTime>,
    args: Vec<String>,
) -> Result<()> {
    let target = target
        .to_target()
        .ok_or_else(|| miette!("a target is required: --script, or --project-dir with --command"))?;

    let store = open_store(db_path)?;
    let task = store
        .create(NewTask {
            name,
            target,
            arguments: args,
            interval_minutes: interval,
            start_time,
        })
        .map_err(|e| miette!("{}", e))?;

    println!("added task {} '{}'", task.id, task.name);
    println!(
        "  next fire: {}",
        next_fire_time(Local::now(), task.interval_minutes, task.start_time).format("%Y-%m-%d %H:%M:%S")
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn edit_task(
    db_path: &Path,
    id: i64,
    name: Option<String>,
    target: &TargetArgs,
    interval: Option<u32>,
    start_time: Option<NaiveTime>,
    clear_start_time: bool,
    args: Vec<String>,
    clear_args: bool,
) -> Result<()> {
    let patch = TaskPatch {
        name,
        target: target.to_target(),
        arguments: if clear_args {
            Some(Vec::new())
        } else if args.is_empty() {
            None
        } else {
            Some(args)
        },
        interval_minutes: interval,
        start_time: if clear_start_time {
            Some(None)
        } else {
            start_time.map(Some)
        },
    };

    if patch.name.is_none()
        && patch.target.is_none()
        && patch.arguments.is_none()
        && patch.interval_minutes.is_none()
        && patch.start_time.is_none()
    {
        return Err(miette!("nothing to edit; pass at least one field"));
    }

    let store = open_store(db_path)?;
    let task = store.update(id, patch).map_err(|e| miette!("{}", e))?;
    println!("updated task {} '{}'", task.id, task.name);
    Ok(())
}

fn delete_task(db_path: &Path, id: i64) -> Result<()> {
    let store = open_store(db_path)?;
    store.delete(id).map_err(|e| miette!("{}", e))?;
    println!("deleted task {id}");
    Ok(())
}

fn list_tasks(db_path: &Path) -> Result<()> {
    let store = open_store(db_path)?;
    let tasks = store.get_all().map_err(|e| miette!("{}", e))?;
    let last_runs = store
        .last_execution_per_task()
        .map_err(|e| miette!("{}", e))?;

    if tasks.is_empty() {
        println!("no tasks");
        return Ok(());
    }

    let now = Local::now();
    for task in tasks {
        // Anchored tasks have an exact grid; for the rest, estimate from the
        // last recorded run (the daemon itself fires from its armed set)
        let next = match task.start_time {
            Some(_) => next_fire_time(now, task.interval_minutes, task.start_time),
            None => last_runs
                .get(&task.id)
                .map(|last| {
                    let due = last.executed_at
                        + chrono::Duration::minutes(i64::from(task.interval_minutes));
                    due.max(now)
                })
                .unwrap_or(now),
        };
        let anchor = match task.start_time {
            Some(t) => format!("  anchor {}", t.format("%H:%M")),
            None => String::new(),
        };
        println!(
            "#{} {}  every {} min{}  next {}",
            task.id,
            task.name,
            task.interval_minutes,
            anchor,
            next.format("%Y-%m-%d %H:%M:%S"),
        );
        println!("    target: {}", task.target);
        if !task.arguments.is_empty() {
            println!("    args: {:?}", task.arguments);
        }
        match last_runs.get(&task.id) {
            Some(last) => println!(
                "    last: {} {}",
                last.executed_at.format("%Y-%m-%d %H:%M:%S"),
                if last.success { "ok" } else { "FAILED" },
            ),
            None => println!("    last: never"),
        }
    }
    Ok(())
}

async fn run_task(db_path: &Path, id: i64) -> Result<()> {
    let store = Arc::new(open_store(db_path)?);
    let engine = Engine::new(store, process_runner(), EngineConfig::default());

    let outcome = engine
        .run_task_now(id)
        .await
        .map_err(|e| miette!("{}", e))?;

    if outcome.success {
        println!("task {id} succeeded in {:.1?}", outcome.duration);
    } else {
        println!(
            "task {id} failed: {}",
            outcome.reason.as_deref().unwrap_or("unknown reason")
        );
    }
    if !outcome.output.is_empty() {
        println!("{}", outcome.output);
    }
    Ok(())
}

fn show_history(db_path: &Path, limit: usize) -> Result<()> {
    let store = open_store(db_path)?;
    let entries = store
        .recent_executions(limit)
        .map_err(|e| miette!("{}", e))?;

    if entries.is_empty() {
        println!("no executions recorded");
        return Ok(());
    }

    for entry in entries {
        println!(
            "{}  {}  {}",
            entry.executed_at.format("%Y-%m-%d %H:%M:%S"),
            if entry.success { "ok    " } else { "FAILED" },
            entry.task_name,
        );
    }
    Ok(())
}

fn list_project_commands(dir: &Path) -> Result<()> {
    let commands = project_commands(dir).map_err(|e| miette!("{}", e))?;
    if commands.is_empty() {
        println!("no entry-point commands declared in {}", dir.display());
        return Ok(());
    }
    for command in commands {
        println!("{command}");
    }
    Ok(())
}
