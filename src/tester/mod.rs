//! The consumer: measures every artifact and records results batch by batch.
//!
//! A batch record is written, and the checkpoint advanced to the next batch index, when the
//! first artifact of the next batch arrives. The sentinel closes the last batch. A reference
//! set is measured every `reference_interval` batches, just before the first artifact of the
//! batch runs. When that first artifact did not build, the batch gets no reference set. The
//! interleaved protocol pairs references itself.

mod protocols;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::adaptor::{AppAdaptor, ExecutionError};
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::config::ProfileConfig;
use crate::pipeline::{ArtifactReceiver, BuildOutcome, BuiltArtifact};
use crate::remote::{ArtifactFetcher, RemoteLocation};
use crate::results::{MutResult, RefResult, ResultStream, ResultStreamError, Status};

/// Tag of the unmodified build.
pub const REFERENCE_TAG: &str = "ref";

/// Consumer failures. Per-artifact failures are recorded, not returned.
#[derive(Debug, Error)]
pub enum TestError {
    /// The reference could not be measured, so no comparison is meaningful.
    #[error("reference execution failed: {0}")]
    ReferenceExecution(#[source] ExecutionError),
    /// Results could not be written.
    #[error(transparent)]
    Results(#[from] ResultStreamError),
    /// The checkpoint could not be written.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// How the consumer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerOutcome {
    /// The sentinel arrived; every batch was recorded.
    Completed {
        /// Batch records written during this run.
        batches: usize,
    },
    /// Stopped early; the partial batch was discarded.
    Interrupted,
}

/// Measurement settings taken from the profile.
#[derive(Debug, Clone, PartialEq)]
pub struct TestPlan {
    /// Trials per set.
    pub repeat: usize,
    /// Attempts per protocol execution.
    pub retry: usize,
    /// Reference refresh interval in batches.
    pub reference_interval: usize,
    /// Batch size, to turn site offsets into batch counts.
    pub batch_size: usize,
    /// Warm-up reference trials.
    pub run_dummy: bool,
    /// Interleaved protocol.
    pub interleave: bool,
    /// Relative dispersion accepted as stable.
    pub stable_threshold: f64,
    /// Cap on stability re-runs.
    pub max_stable_rounds: Option<usize>,
}

impl From<&ProfileConfig> for TestPlan {
    fn from(config: &ProfileConfig) -> Self {
        Self {
            repeat: config.repeat,
            retry: config.retry.max(1),
            reference_interval: config.reference_interval.max(1),
            batch_size: config.batch_size.max(1),
            run_dummy: config.run_dummy,
            interleave: config.interleave,
            stable_threshold: config.stable_threshold,
            max_stable_rounds: config.max_stable_rounds,
        }
    }
}

/// Test stage of the pipeline.
pub struct StabilityTestRunner {
    plan: TestPlan,
    adaptor: Arc<dyn AppAdaptor>,
    checkpoint: Arc<dyn CheckpointStore>,
    fetcher: Option<Arc<dyn ArtifactFetcher>>,
    ref_stream: ResultStream<RefResult>,
    mut_stream: ResultStream<MutResult>,
    start_index: usize,
    interrupted: Arc<AtomicBool>,
}

impl std::fmt::Debug for StabilityTestRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StabilityTestRunner")
            .field("plan", &self.plan)
            .field("start_index", &self.start_index)
            .finish_non_exhaustive()
    }
}

impl StabilityTestRunner {
    /// Consumer resuming at site index `start_index`.
    pub fn new(
        plan: TestPlan,
        adaptor: Arc<dyn AppAdaptor>,
        checkpoint: Arc<dyn CheckpointStore>,
        ref_stream: ResultStream<RefResult>,
        mut_stream: ResultStream<MutResult>,
        start_index: usize,
    ) -> Self {
        Self {
            plan,
            adaptor,
            checkpoint,
            fetcher: None,
            ref_stream,
            mut_stream,
            start_index,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fetch remote artifacts with `fetcher`.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Stop before the next artifact once `flag` is set.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupted = flag;
        self
    }

    fn reference_due(&self, index: usize) -> bool {
        let batches = index.saturating_sub(self.start_index) / self.plan.batch_size;
        batches % self.plan.reference_interval == 0
    }

    fn sync(&self, tag: &str, location: &RemoteLocation) -> Result<(), String> {
        let Some(fetcher) = &self.fetcher else {
            return Err("no artifact fetcher configured for remote builds".to_string());
        };
        let dest = self.adaptor.artifact_path(tag);
        fetcher
            .fetch(location, &dest)
            .map_err(|e| format!("artifact transfer failed: {e}"))?;
        if let Err(e) = fetcher.discard(location) {
            tracing::warn!(tag, worker = %location.worker, error = %e, "remote copy not removed");
        }
        Ok(())
    }

    fn finish_streams(self) -> Result<(), TestError> {
        self.ref_stream.finish()?;
        self.mut_stream.finish()?;
        Ok(())
    }

    fn measure(
        &mut self,
        record: &mut MutResult,
        artifact: BuiltArtifact,
        needs_reference: &mut bool,
    ) -> Result<(), TestError> {
        let index = artifact.batch_index;
        // Only the first artifact of a batch may carry the reference set.
        let reference_due = std::mem::take(needs_reference);
        let (tag, remote) = match artifact.outcome {
            BuildOutcome::Built { tag, remote } => (tag, remote),
            BuildOutcome::Failed { log } => {
                tracing::warn!(index, mutation = ?artifact.mutations, "build failed, recording compile abort");
                record.push_abort(artifact.mutations, Status::AbortCompile, log);
                return Ok(());
            }
            BuildOutcome::EndOfStream => return Ok(()),
        };
        if let Some(location) = remote {
            if let Err(log) = self.sync(&tag, &location) {
                tracing::warn!(tag = %tag, error = %log, "recording compile abort");
                record.push_abort(artifact.mutations, Status::AbortCompile, log);
                return Ok(());
            }
        }

        if reference_due {
            tracing::info!(index, "measuring reference");
            let (dummy_results, results) = self.measure_reference(index).map_err(|e| {
                tracing::error!(index, error = %e, "reference run failed");
                TestError::ReferenceExecution(e)
            })?;
            self.ref_stream.append(&RefResult {
                batch_index: index,
                dummy_results,
                results,
            })?;
        }

        let measured = if self.plan.interleave {
            self.measure_interleaved(index, &tag)
                .map(|(reference, mutant)| (Some(reference), mutant))
        } else {
            self.measure_mutant(&tag).map(|mutant| (None, mutant))
        };
        match measured {
            Ok((Some(reference), mutant)) => {
                record.push_interleaved(artifact.mutations, reference, mutant)
            }
            Ok((None, mutant)) => record.push_finish(artifact.mutations, mutant),
            Err(e) => {
                tracing::warn!(tag = %tag, error = %e, "recording exec abort");
                record.push_abort(artifact.mutations, Status::AbortExec, e.0);
            }
        }
        if let Err(e) = self.adaptor.delete(&tag) {
            tracing::warn!(tag = %tag, error = %e, "artifact not deleted");
        }
        Ok(())
    }

    /// Consume artifacts until the sentinel, an interruption, or a fatal reference failure.
    pub fn run(mut self, rx: &mut ArtifactReceiver) -> Result<ConsumerOutcome, TestError> {
        let mut current: Option<MutResult> = None;
        let mut needs_reference = false;
        let mut batches = 0usize;
        tracing::info!(start = self.start_index, "consumer started");

        loop {
            if self.interrupted.load(Ordering::SeqCst) {
                tracing::warn!("consumer interrupted, discarding partial batch");
                self.finish_streams()?;
                return Ok(ConsumerOutcome::Interrupted);
            }
            let Some(artifact) = rx.take_blocking() else {
                tracing::warn!("artifact channel closed without sentinel");
                self.finish_streams()?;
                return Ok(ConsumerOutcome::Interrupted);
            };

            let index = artifact.batch_index;
            let mut record = match current.take() {
                Some(record) if record.batch_index == index => record,
                previous => {
                    if let Some(done) = previous {
                        self.mut_stream.append(&done)?;
                        self.checkpoint.save(index)?;
                        batches += 1;
                        tracing::info!(finished = done.batch_index, next = index, "batch recorded");
                    }
                    needs_reference = !self.plan.interleave && self.reference_due(index);
                    MutResult::new(artifact.site_paths.clone(), index)
                }
            };
            if artifact.is_sentinel() {
                break;
            }
            self.measure(&mut record, artifact, &mut needs_reference)?;
            current = Some(record);
        }

        self.finish_streams()?;
        tracing::info!(batches, "consumer finished");
        Ok(ConsumerOutcome::Completed { batches })
    }
}
