//! Build/run backends.
//!
//! The pipeline only knows the [`AppAdaptor`] capability set. A backend builds an artifact for
//! a tag, prepares the execution environment for it, runs measured trials and cleans up.

pub mod script;
pub mod stability;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub use script::{ScriptAdaptor, ScriptConfig};
pub use stability::{TrialStats, is_stable, summarize};

/// Named numeric metrics of one trial.
pub type TrialResult = BTreeMap<String, f64>;

/// The build step failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("build failed: {0}")]
pub struct BuildError(pub String);

/// A prepare, run, cleanup or state step failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("execution failed: {0}")]
pub struct ExecutionError(pub String);

impl From<std::io::Error> for ExecutionError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

/// Capability set of a build/run backend.
pub trait AppAdaptor: Send + Sync {
    /// Build `project` and store the artifact under [`AppAdaptor::artifact_path`].
    fn build(&self, project: &Path, tag: &str) -> Result<(), BuildError>;

    /// Install or otherwise ready the artifact before its trials.
    fn prepare(&self, tag: &str) -> Result<(), ExecutionError>;

    /// Execute one trial and return its metrics.
    fn run(&self, tag: &str, suffix: &str, dummy: bool) -> Result<TrialResult, ExecutionError>;

    /// Undo `prepare`.
    fn cleanup(&self, _tag: &str) -> Result<(), ExecutionError> {
        Ok(())
    }

    /// Snapshot the environment after a trial.
    fn save_state(&self, _tag: &str) -> Result<(), ExecutionError> {
        Ok(())
    }

    /// Bring the environment back to the last snapshot.
    fn restore_state(&self, _tag: &str) -> Result<(), ExecutionError> {
        Ok(())
    }

    /// Local storage location of the artifact for `tag`.
    fn artifact_path(&self, tag: &str) -> PathBuf;

    /// Remove the local artifact for `tag`.
    fn delete(&self, tag: &str) -> std::io::Result<()> {
        let path = self.artifact_path(tag);
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match result {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    /// Whether a trial set is settled enough to keep.
    fn is_stable(&self, trials: &[TrialResult], threshold: f64) -> bool {
        stability::is_stable(trials, threshold)
    }
}
