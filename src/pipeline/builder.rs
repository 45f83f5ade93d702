//! The producer: walks the site list batch by batch and dispatches every round.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{ArtifactSender, BuiltArtifact};
use crate::dispatch::{BuildDispatcher, BuildJob, DispatchError};
use crate::mutator::Mutator;
use crate::remote::{BuildTransport, TcpTransport};
use crate::sequencer::MutationSequencer;
use crate::site::SiteEntry;

/// How the producer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerOutcome {
    /// Every batch was dispatched and the sentinel was sent.
    Completed {
        /// Artifacts produced, failures included.
        artifacts: usize,
    },
    /// Interrupted before the last batch; no sentinel was sent.
    Interrupted,
}

/// Build stage of the pipeline.
pub struct ProjectBuilder<T: BuildTransport = TcpTransport> {
    mutator: Mutator,
    sites: Vec<SiteEntry>,
    batch_size: usize,
    start: usize,
    dispatcher: BuildDispatcher<T>,
    out: ArtifactSender,
    interrupted: Arc<AtomicBool>,
}

impl<T: BuildTransport> ProjectBuilder<T> {
    /// Producer over `sites`, resuming at site index `start`.
    pub fn new(
        mutator: Mutator,
        sites: Vec<SiteEntry>,
        batch_size: usize,
        dispatcher: BuildDispatcher<T>,
        out: ArtifactSender,
    ) -> Self {
        Self {
            mutator,
            sites,
            batch_size: batch_size.max(1),
            start: 0,
            dispatcher,
            out,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Resume at site index `start`.
    pub fn with_start(mut self, start: usize) -> Self {
        self.start = start;
        self
    }

    /// Stop issuing batches once `flag` is set.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupted = flag;
        self
    }

    /// Produce every artifact, then the sentinel.
    pub async fn run(self) -> Result<ProducerOutcome, DispatchError> {
        let Self {
            mutator,
            sites,
            batch_size,
            start,
            mut dispatcher,
            out,
            interrupted,
        } = self;
        let total = sites.len();
        let sequencer = MutationSequencer::new(&mutator);
        let mut artifacts = 0usize;
        tracing::info!(total, start, batch_size, "producer started");

        for index in (start..total).step_by(batch_size) {
            if interrupted.load(Ordering::SeqCst) {
                tracing::warn!(index, "producer interrupted");
                dispatcher.finish().await?;
                return Ok(ProducerOutcome::Interrupted);
            }
            let batch = &sites[index..(index + batch_size).min(total)];
            tracing::info!(index, sites = batch.len(), "starting batch");

            let mut rounds = match sequencer.step_batch(index, batch) {
                Ok(rounds) => rounds,
                Err(e) => {
                    tracing::warn!(index, error = %e, "batch skipped");
                    let artifact =
                        BuiltArtifact::failed(e.skipped.clone(), index, Vec::new(), e.to_string());
                    dispatcher.submit_failure(artifact).await?;
                    artifacts += 1;
                    continue;
                }
            };
            let paths = rounds.paths();
            for round in rounds.by_ref() {
                match round {
                    Ok(round) => {
                        let job = BuildJob {
                            tag: round.tag(),
                            site_paths: paths.clone(),
                            batch_index: index,
                            mutations: round.values,
                        };
                        dispatcher.dispatch(job).await?;
                    }
                    Err(e) => {
                        tracing::warn!(index, error = %e, "cannot apply round");
                        let artifact =
                            BuiltArtifact::failed(paths.clone(), index, Vec::new(), e.to_string());
                        dispatcher.submit_failure(artifact).await?;
                    }
                }
                artifacts += 1;
            }
            if let Err(e) = rounds.close() {
                tracing::warn!(index, error = %e, "failed to restore batch sites");
            }
        }

        dispatcher.finish().await?;
        out.put(BuiltArtifact::sentinel(total)).await?;
        tracing::info!(artifacts, "producer finished");
        Ok(ProducerOutcome::Completed { artifacts })
    }
}
