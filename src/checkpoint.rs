//! Persisted resume point: the start index of the first batch not yet fully recorded.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

/// Checkpoint errors.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// IO failure.
    #[error("io error on {path}: {source}")]
    Io {
        /// Checkpoint file.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file does not hold an integer.
    #[error("corrupt checkpoint {path}: {content:?}")]
    Corrupt {
        /// Checkpoint file.
        path: PathBuf,
        /// What was found.
        content: String,
    },
}

/// Where the checkpoint lives.
pub trait CheckpointStore: Send + Sync {
    /// Stored value; `0` when nothing was saved yet.
    fn load(&self) -> Result<usize, CheckpointError>;

    /// Overwrite the stored value.
    fn save(&self, index: usize) -> Result<(), CheckpointError>;
}

/// Single integer in a text file, replaced atomically.
#[derive(Debug, Clone)]
pub struct FileCheckpoint {
    path: PathBuf,
}

impl FileCheckpoint {
    /// Checkpoint stored at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Checkpoint file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl CheckpointStore for FileCheckpoint {
    fn load(&self) -> Result<usize, CheckpointError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(self.io(e)),
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(0);
        }
        trimmed.parse().map_err(|_| CheckpointError::Corrupt {
            path: self.path.clone(),
            content: trimmed.to_string(),
        })
    }

    fn save(&self, index: usize) -> Result<(), CheckpointError> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, format!("{index}\n")).map_err(|e| self.io(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io(e))?;
        tracing::info!(checkpoint = index, "checkpoint saved");
        Ok(())
    }
}

/// In-memory checkpoint that remembers every saved value.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpoint {
    history: Arc<Mutex<Vec<usize>>>,
    initial: usize,
}

impl MemoryCheckpoint {
    /// Checkpoint starting at `initial`.
    pub fn starting_at(initial: usize) -> Self {
        Self {
            history: Arc::default(),
            initial,
        }
    }

    /// Every saved value in order.
    pub fn history(&self) -> Vec<usize> {
        self.history.lock().clone()
    }
}

impl CheckpointStore for MemoryCheckpoint {
    fn load(&self) -> Result<usize, CheckpointError> {
        Ok(self.history.lock().last().copied().unwrap_or(self.initial))
    }

    fn save(&self, index: usize) -> Result<(), CheckpointError> {
        self.history.lock().push(index);
        Ok(())
    }
}
