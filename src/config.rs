//! Profiling run configuration.
//!
//! A run directory holds `profile.yml` together with the site list, the checkpoint and the
//! result streams. The YAML document is split in sections; [`ProfileConfig`] is the `general`
//! section and is passed by reference to every component that needs it.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adaptor::script::ScriptConfig;
use crate::logging::LoggingConfig;
use crate::mutator::LiteralKind;

/// Name of the configuration document inside a run directory.
pub const PROFILE_FILE: &str = "profile.yml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO failure while reading or writing the document.
    #[error("io error on {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// YAML could not be parsed or emitted.
    #[error("invalid profile document: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// A value is outside its accepted range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Address of one remote build worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerEndpoint {
    /// Host name or IP address.
    pub host: String,
    /// TCP port the worker listens on.
    pub port: u16,
}

impl WorkerEndpoint {
    /// Create an endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for WorkerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The `general` section: everything the pipeline itself needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileConfig {
    /// Application source tree.
    pub project: PathBuf,
    /// Directory holding run state. Filled from the document location when loaded.
    #[serde(skip, default = "default_run_dir")]
    pub run_dir: PathBuf,
    /// Kind of literal the site list refers to.
    #[serde(default)]
    pub literal_kind: LiteralKind,
    /// Read replacement values from the site list instead of generating them.
    #[serde(default)]
    pub supply_mutations: bool,
    /// Number of sites advanced together per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Trials per measurement set.
    #[serde(default = "default_repeat")]
    pub repeat: usize,
    /// Attempts per protocol execution before a failure is surfaced.
    #[serde(default = "default_retry")]
    pub retry: usize,
    /// Run the reference protocol every this many batches.
    #[serde(default = "default_reference_interval")]
    pub reference_interval: usize,
    /// Run warm-up trials before reference trials.
    #[serde(default)]
    pub run_dummy: bool,
    /// Alternate reference and mutant trials instead of measuring them in blocks.
    #[serde(default)]
    pub interleave: bool,
    /// Dispatch builds to the configured workers.
    #[serde(default)]
    pub enable_remote: bool,
    /// Relative standard deviation accepted as stable; non-positive disables re-runs.
    #[serde(default)]
    pub stable_threshold: f64,
    /// Upper bound on re-runs while waiting for a stable trial set.
    #[serde(default)]
    pub max_stable_rounds: Option<usize>,
    /// Capacity of the channel between build and test stages.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Mutate a private copy of the project rather than the tree itself.
    #[serde(default = "default_true")]
    pub copy_project: bool,
    /// Optional `Type,VAL1 VAL2 ...` table for enum candidates.
    #[serde(default)]
    pub enum_definitions: Option<PathBuf>,
}

fn default_run_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn default_batch_size() -> usize {
    1
}

fn default_repeat() -> usize {
    5
}

fn default_retry() -> usize {
    2
}

fn default_reference_interval() -> usize {
    1
}

fn default_channel_capacity() -> usize {
    2
}

fn default_true() -> bool {
    true
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            project: PathBuf::from("."),
            run_dir: default_run_dir(),
            literal_kind: LiteralKind::default(),
            supply_mutations: false,
            batch_size: default_batch_size(),
            repeat: default_repeat(),
            retry: default_retry(),
            reference_interval: default_reference_interval(),
            run_dummy: false,
            interleave: false,
            enable_remote: false,
            stable_threshold: 0.0,
            max_stable_rounds: None,
            channel_capacity: default_channel_capacity(),
            copy_project: true,
            enum_definitions: None,
        }
    }
}

impl ProfileConfig {
    /// Set the project tree.
    pub fn with_project(mut self, project: impl Into<PathBuf>) -> Self {
        self.project = project.into();
        self
    }

    /// Set the run directory.
    pub fn with_run_dir(mut self, run_dir: impl Into<PathBuf>) -> Self {
        self.run_dir = run_dir.into();
        self
    }

    /// Set the literal kind.
    pub fn with_literal_kind(mut self, kind: LiteralKind) -> Self {
        self.literal_kind = kind;
        self
    }

    /// Read values from the supplied mutation list.
    pub fn with_supplied_mutations(mut self, supplied: bool) -> Self {
        self.supply_mutations = supplied;
        self
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set trials per measurement set.
    pub fn with_repeat(mut self, repeat: usize) -> Self {
        self.repeat = repeat;
        self
    }

    /// Set attempts per protocol execution.
    pub fn with_retry(mut self, retry: usize) -> Self {
        self.retry = retry;
        self
    }

    /// Set the reference refresh interval.
    pub fn with_reference_interval(mut self, interval: usize) -> Self {
        self.reference_interval = interval;
        self
    }

    /// Enable warm-up reference trials.
    pub fn with_run_dummy(mut self, run_dummy: bool) -> Self {
        self.run_dummy = run_dummy;
        self
    }

    /// Select the interleaved protocol.
    pub fn with_interleave(mut self, interleave: bool) -> Self {
        self.interleave = interleave;
        self
    }

    /// Select remote dispatch.
    pub fn with_remote(mut self, enable_remote: bool) -> Self {
        self.enable_remote = enable_remote;
        self
    }

    /// Set the stability threshold.
    pub fn with_stable_threshold(mut self, threshold: f64) -> Self {
        self.stable_threshold = threshold;
        self
    }

    /// Bound the number of stability re-runs.
    pub fn with_max_stable_rounds(mut self, rounds: usize) -> Self {
        self.max_stable_rounds = Some(rounds);
        self
    }

    /// Set the artifact channel capacity.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Toggle project copying.
    pub fn with_copy_project(mut self, copy_project: bool) -> Self {
        self.copy_project = copy_project;
        self
    }

    /// Reject values the pipeline cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("batch_size", self.batch_size),
            ("repeat", self.repeat),
            ("retry", self.retry),
            ("reference_interval", self.reference_interval),
            ("channel_capacity", self.channel_capacity),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
        }
        if self.max_stable_rounds == Some(0) {
            return Err(ConfigError::Invalid(
                "max_stable_rounds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Site list (one locator per line).
    pub fn sites_path(&self) -> PathBuf {
        self.run_dir.join("literal-sites.txt")
    }

    /// Site list with supplied values.
    pub fn supplied_mutations_path(&self) -> PathBuf {
        self.run_dir.join("literal-mutations.txt")
    }

    /// Checkpoint file.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.run_dir.join("checkpoint.txt")
    }

    /// Reference result stream.
    pub fn ref_results_path(&self) -> PathBuf {
        self.run_dir.join("ref-results.jsonl")
    }

    /// Mutant result stream.
    pub fn mut_results_path(&self) -> PathBuf {
        self.run_dir.join("mut-results.jsonl")
    }

    /// Where built artifacts are stored locally.
    pub fn build_dir(&self) -> PathBuf {
        self.run_dir.join("build")
    }

    /// Where the private project copy lives.
    pub fn workspace_dir(&self) -> PathBuf {
        self.run_dir.join("workspace")
    }
}

/// The whole `profile.yml` document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileDocument {
    /// Pipeline settings.
    pub general: ProfileConfig,
    /// Script backend commands.
    #[serde(default)]
    pub script: ScriptConfig,
    /// Remote build workers.
    #[serde(default)]
    pub workers: Vec<WorkerEndpoint>,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ProfileDocument {
    /// Wrap a general section with default backend, worker and logging sections.
    pub fn new(general: ProfileConfig) -> Self {
        Self {
            general,
            script: ScriptConfig::default(),
            workers: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load `profile.yml` from a run directory.
    pub fn load(run_dir: &Path) -> Result<Self, ConfigError> {
        let path = run_dir.join(PROFILE_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let mut doc: ProfileDocument = serde_yaml::from_str(&raw)?;
        doc.general.run_dir = run_dir.to_path_buf();
        if doc.general.project.is_relative() {
            doc.general.project = run_dir.join(&doc.general.project);
        }
        doc.validate()?;
        Ok(doc)
    }

    /// Write the document to `profile.yml` in the general section's run directory.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = self.general.run_dir.join(PROFILE_FILE);
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(&path, yaml).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Validate cross-section constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general.validate()?;
        if self.general.enable_remote && self.workers.is_empty() {
            return Err(ConfigError::Invalid(
                "enable_remote requires at least one entry under `workers`".to_string(),
            ));
        }
        Ok(())
    }
}
