//! Error types for environment resolution.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::resolve::{LOCK_FILE, MANIFEST_FILE};

/// Errors that can occur while classifying a task target.
///
/// All of these surface to the scheduler as a failed execution — a
/// misconfigured environment never disarms a task.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The script file does not exist.
    #[error("script not found: {0}")]
    ScriptNotFound(PathBuf),

    /// The project directory does not exist.
    #[error("project directory not found: {0}")]
    ProjectDirNotFound(PathBuf),

    /// No rule matched. The probe names what was checked and what was
    /// missing.
    #[error("{0}")]
    EnvironmentNotFound(EnvironmentProbe),

    /// The project manifest could not be read.
    #[error("failed to read {path}: {source}")]
    ManifestRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The project manifest is not valid TOML.
    #[error("failed to parse {path}: {source}")]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// What the resolver probed for, and with what result.
#[derive(Debug)]
pub struct EnvironmentProbe {
    pub dir: PathBuf,
    pub manifest_present: bool,
    pub lock_present: bool,
    /// The interpreter path probed by the venv rule, if that rule applied to
    /// this target kind.
    pub venv_interpreter: Option<PathBuf>,
}

impl fmt::Display for EnvironmentProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let found = |present| if present { "found" } else { "missing" };
        write!(
            f,
            "no runnable environment in {}: {} {}, {} {}",
            self.dir.display(),
            MANIFEST_FILE,
            found(self.manifest_present),
            LOCK_FILE,
            found(self.lock_present),
        )?;
        if let Some(path) = &self.venv_interpreter {
            write!(f, "; venv interpreter {} missing", path.display())?;
        }
        Ok(())
    }
}
