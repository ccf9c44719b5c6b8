//! Environment classification for task targets.
//!
//! The resolver is stateless: every call re-probes the filesystem, since an
//! environment can appear or disappear between two fires of the same task.

use std::path::{Path, PathBuf};

use tracing::debug;

use cadence_store::TaskTarget;

use crate::error::{EnvironmentProbe, ResolveError};

/// Package manifest probed by the managed-project rule.
pub(crate) const MANIFEST_FILE: &str = "pyproject.toml";

/// Resolved lock file probed by the managed-project rule.
pub(crate) const LOCK_FILE: &str = "uv.lock";

/// Isolated-environment subdirectory probed by the venv rule.
const VENV_DIR: &str = "venv";

#[cfg(windows)]
const BATCH_EXTENSIONS: &[&str] = &["bat", "cmd"];
#[cfg(not(windows))]
const BATCH_EXTENSIONS: &[&str] = &["sh"];

/// Which environment a target classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Batch/shell file run directly.
    Native,
    /// `uv run` inside a manifest+lock project.
    ManagedProject,
    /// The venv interpreter invoked directly on the script — no activation
    /// script, so no shell-specific syntax.
    IsolatedVenv,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Environment::Native => "native",
            Environment::ManagedProject => "managed-project",
            Environment::IsolatedVenv => "venv",
        };
        write!(f, "{s}")
    }
}

/// A runnable command: `argv[0]` is the interpreter/manager/script, the rest
/// are the task's arguments appended verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub environment: Environment,
    pub working_dir: PathBuf,
    pub argv: Vec<String>,
    /// Drop `VIRTUAL_ENV` from the child environment so uv resolves the
    /// project's own environment instead of an inherited one.
    pub scrub_virtual_env: bool,
}

/// Classify a target and produce its runnable command.
///
/// Rules, in order: batch extension → Native; manifest + lock in the
/// directory → ManagedProject; `venv/` interpreter next to the script →
/// IsolatedVenv; otherwise [`ResolveError::EnvironmentNotFound`].
pub fn resolve(target: &TaskTarget, arguments: &[String]) -> Result<ResolvedCommand, ResolveError> {
    let resolved = match target {
        TaskTarget::Script { path } => resolve_script(path, arguments)?,
        TaskTarget::Project { dir, command } => resolve_project(dir, command, arguments)?,
    };
    debug!(
        environment = %resolved.environment,
        working_dir = %resolved.working_dir.display(),
        argv = ?resolved.argv,
        "resolved task target"
    );
    Ok(resolved)
}

fn resolve_script(path: &Path, arguments: &[String]) -> Result<ResolvedCommand, ResolveError> {
    if !path.is_file() {
        return Err(ResolveError::ScriptNotFound(path.to_path_buf()));
    }

    let script_dir = parent_dir(path);
    let script_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned());

    if is_batch_file(path) {
        return Ok(ResolvedCommand {
            environment: Environment::Native,
            working_dir: script_dir,
            argv: with_arguments(vec![path.to_string_lossy().into_owned()], arguments),
            scrub_virtual_env: false,
        });
    }

    let manifest_present = script_dir.join(MANIFEST_FILE).is_file();
    let lock_present = script_dir.join(LOCK_FILE).is_file();
    if manifest_present && lock_present {
        return Ok(ResolvedCommand {
            environment: Environment::ManagedProject,
            working_dir: script_dir,
            argv: with_arguments(
                vec![
                    "uv".to_string(),
                    "run".to_string(),
                    "python".to_string(),
                    script_name,
                ],
                arguments,
            ),
            scrub_virtual_env: true,
        });
    }

    let interpreter = venv_interpreter(&script_dir);
    if interpreter.is_file() {
        return Ok(ResolvedCommand {
            environment: Environment::IsolatedVenv,
            working_dir: script_dir,
            argv: with_arguments(
                vec![interpreter.to_string_lossy().into_owned(), script_name],
                arguments,
            ),
            scrub_virtual_env: false,
        });
    }

    Err(ResolveError::EnvironmentNotFound(EnvironmentProbe {
        dir: script_dir,
        manifest_present,
        lock_present,
        venv_interpreter: Some(interpreter),
    }))
}

fn resolve_project(
    dir: &Path,
    command: &str,
    arguments: &[String],
) -> Result<ResolvedCommand, ResolveError> {
    if !dir.is_dir() {
        return Err(ResolveError::ProjectDirNotFound(dir.to_path_buf()));
    }

    let manifest_present = dir.join(MANIFEST_FILE).is_file();
    let lock_present = dir.join(LOCK_FILE).is_file();
    if !(manifest_present && lock_present) {
        return Err(ResolveError::EnvironmentNotFound(EnvironmentProbe {
            dir: dir.to_path_buf(),
            manifest_present,
            lock_present,
            // The venv rule only applies to script targets
            venv_interpreter: None,
        }));
    }

    // Split so multi-word commands like "python -m module" work
    let mut argv = vec!["uv".to_string(), "run".to_string()];
    argv.extend(command.split_whitespace().map(str::to_string));

    Ok(ResolvedCommand {
        environment: Environment::ManagedProject,
        working_dir: dir.to_path_buf(),
        argv: with_arguments(argv, arguments),
        scrub_virtual_env: true,
    })
}

/// Entry-point command names declared in a managed project's manifest
/// (`[project.scripts]`), sorted.
pub fn project_commands(dir: &Path) -> Result<Vec<String>, ResolveError> {
    let path = dir.join(MANIFEST_FILE);
    let raw = std::fs::read_to_string(&path).map_err(|source| ResolveError::ManifestRead {
        path: path.clone(),
        source,
    })?;
    let manifest: toml::Value =
        toml::from_str(&raw).map_err(|source| ResolveError::ManifestParse { path, source })?;

    let mut commands: Vec<String> = manifest
        .get("project")
        .and_then(|p| p.get("scripts"))
        .and_then(|s| s.as_table())
        .map(|table| table.keys().cloned().collect())
        .unwrap_or_default();
    commands.sort();
    Ok(commands)
}

fn with_arguments(mut argv: Vec<String>, arguments: &[String]) -> Vec<String> {
    argv.extend(arguments.iter().cloned());
    argv
}

fn is_batch_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            BATCH_EXTENSIONS
                .iter()
                .any(|batch| ext.eq_ignore_ascii_case(batch))
        })
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn venv_interpreter(dir: &Path) -> PathBuf {
    if cfg!(windows) {
        dir.join(VENV_DIR).join("Scripts").join("python.exe")
    } else {
        dir.join(VENV_DIR).join("bin").join("python")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, "").unwrap();
    }

    #[cfg(not(windows))]
    const BATCH_NAME: &str = "job.sh";
    #[cfg(windows)]
    const BATCH_NAME: &str = "job.bat";

    fn script_target(path: &Path) -> TaskTarget {
        TaskTarget::Script {
            path: path.to_path_buf(),
        }
    }

    #[test]
    fn batch_file_resolves_native() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join(BATCH_NAME);
        touch(&script);

        let resolved = resolve(&script_target(&script), &[]).unwrap();
        assert_eq!(resolved.environment, Environment::Native);
        assert_eq!(resolved.working_dir, dir.path());
        assert_eq!(resolved.argv, vec![script.to_string_lossy().into_owned()]);
        assert!(!resolved.scrub_virtual_env);
    }

    #[test]
    fn batch_rule_wins_over_project_markers() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join(MANIFEST_FILE));
        touch(&dir.path().join(LOCK_FILE));
        let script = dir.path().join(BATCH_NAME);
        touch(&script);

        let resolved = resolve(&script_target(&script), &[]).unwrap();
        assert_eq!(resolved.environment, Environment::Native);
    }

    #[test]
    fn manifest_and_lock_resolve_managed_project() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join(MANIFEST_FILE));
        touch(&dir.path().join(LOCK_FILE));
        let script = dir.path().join("report.py");
        touch(&script);

        let resolved = resolve(&script_target(&script), &[]).unwrap();
        assert_eq!(resolved.environment, Environment::ManagedProject);
        assert_eq!(resolved.argv, vec!["uv", "run", "python", "report.py"]);
        assert!(resolved.scrub_virtual_env);
    }

    #[test]
    fn manifest_without_lock_falls_through_to_venv_probe() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join(MANIFEST_FILE));
        let script = dir.path().join("report.py");
        touch(&script);

        let err = resolve(&script_target(&script), &[]).unwrap_err();
        match err {
            ResolveError::EnvironmentNotFound(probe) => {
                assert!(probe.manifest_present);
                assert!(!probe.lock_present);
                assert!(probe.venv_interpreter.is_some());
            }
            other => panic!("expected EnvironmentNotFound, got {other:?}"),
        }
    }

    #[test]
    #[cfg(not(windows))]
    fn venv_interpreter_resolves_isolated_venv() {
        let dir = tempfile::tempdir().unwrap();
        let interpreter = dir.path().join("venv/bin/python");
        touch(&interpreter);
        let script = dir.path().join("report.py");
        touch(&script);

        let resolved = resolve(&script_target(&script), &["--fast".to_string()]).unwrap();
        assert_eq!(resolved.environment, Environment::IsolatedVenv);
        assert_eq!(
            resolved.argv,
            vec![
                interpreter.to_string_lossy().into_owned(),
                "report.py".to_string(),
                "--fast".to_string(),
            ]
        );
    }

    #[test]
    fn bare_directory_reports_everything_missing() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("report.py");
        touch(&script);

        let err = resolve(&script_target(&script), &[]).unwrap_err();
        let message = err.to_string();
        assert!(message.contains(MANIFEST_FILE));
        assert!(message.contains(LOCK_FILE));
        assert!(message.contains("venv"));
    }

    #[test]
    fn missing_script_is_its_own_error() {
        let err = resolve(
            &script_target(Path::new("/nonexistent/job.py")),
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, ResolveError::ScriptNotFound(_)));
    }

    #[test]
    fn project_target_requires_manifest_and_lock() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join(MANIFEST_FILE));

        let target = TaskTarget::Project {
            dir: dir.path().to_path_buf(),
            command: "sync".to_string(),
        };
        let err = resolve(&target, &[]).unwrap_err();
        match err {
            ResolveError::EnvironmentNotFound(probe) => {
                assert!(!probe.lock_present);
                assert_eq!(probe.venv_interpreter, None);
            }
            other => panic!("expected EnvironmentNotFound, got {other:?}"),
        }
    }

    #[test]
    fn project_command_splits_words_and_appends_arguments() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join(MANIFEST_FILE));
        touch(&dir.path().join(LOCK_FILE));

        let target = TaskTarget::Project {
            dir: dir.path().to_path_buf(),
            command: "python -m etl.sync".to_string(),
        };
        let resolved = resolve(&target, &["--dry-run".to_string()]).unwrap();
        assert_eq!(
            resolved.argv,
            vec!["uv", "run", "python", "-m", "etl.sync", "--dry-run"]
        );
        assert_eq!(resolved.working_dir, dir.path());
    }

    #[test]
    fn project_commands_lists_declared_entry_points() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"
[project]
name = "etl"
version = "0.1.0"

[project.scripts]
sync-all = "etl.cli:sync"
report = "etl.cli:report"
"#,
        )
        .unwrap();

        let commands = project_commands(dir.path()).unwrap();
        assert_eq!(commands, vec!["report", "sync-all"]);
    }

    #[test]
    fn project_commands_empty_when_no_scripts_table() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(MANIFEST_FILE),
            "[project]\nname = \"etl\"\nversion = \"0.1.0\"\n",
        )
        .unwrap();

        assert!(project_commands(dir.path()).unwrap().is_empty());
    }
}
