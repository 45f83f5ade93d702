//! Records flowing from the build stage to the test stage.

use crate::remote::RemoteLocation;

/// What happened to one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Built; stored locally or, when `remote` is set, on a worker pending sync.
    Built {
        /// Artifact tag.
        tag: String,
        /// Worker-side location of a remote build.
        remote: Option<RemoteLocation>,
    },
    /// The combination could not be built.
    Failed {
        /// Error text.
        log: String,
    },
    /// No more artifacts follow.
    EndOfStream,
}

/// One mutation combination after the build stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltArtifact {
    /// Locators of the batch, empty only for the sentinel.
    pub site_paths: Vec<String>,
    /// Batch start index, or the total site count for the sentinel.
    pub batch_index: usize,
    /// Value of every site in site order.
    pub mutations: Vec<String>,
    /// Build result.
    pub outcome: BuildOutcome,
}

impl BuiltArtifact {
    /// Successful local build.
    pub fn built(
        site_paths: Vec<String>,
        batch_index: usize,
        mutations: Vec<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            site_paths,
            batch_index,
            mutations,
            outcome: BuildOutcome::Built {
                tag: tag.into(),
                remote: None,
            },
        }
    }

    /// Successful build waiting on a worker.
    pub fn built_remote(
        site_paths: Vec<String>,
        batch_index: usize,
        mutations: Vec<String>,
        tag: impl Into<String>,
        location: RemoteLocation,
    ) -> Self {
        Self {
            site_paths,
            batch_index,
            mutations,
            outcome: BuildOutcome::Built {
                tag: tag.into(),
                remote: Some(location),
            },
        }
    }

    /// Failed build.
    pub fn failed(
        site_paths: Vec<String>,
        batch_index: usize,
        mutations: Vec<String>,
        log: impl Into<String>,
    ) -> Self {
        Self {
            site_paths,
            batch_index,
            mutations,
            outcome: BuildOutcome::Failed { log: log.into() },
        }
    }

    /// End-of-stream marker.
    pub fn sentinel(total_sites: usize) -> Self {
        Self {
            site_paths: Vec::new(),
            batch_index: total_sites,
            mutations: Vec::new(),
            outcome: BuildOutcome::EndOfStream,
        }
    }

    /// Whether this is the end-of-stream marker.
    pub fn is_sentinel(&self) -> bool {
        self.site_paths.is_empty()
    }

    /// Tag of a successful build.
    pub fn tag(&self) -> Option<&str> {
        match &self.outcome {
            BuildOutcome::Built { tag, .. } => Some(tag),
            _ => None,
        }
    }
}
