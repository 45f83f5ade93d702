//! Measurement protocols and the retry / re-run policies wrapped around them.

use crate::adaptor::{ExecutionError, TrialResult};

use super::{REFERENCE_TAG, StabilityTestRunner};

/// Reference trials: warm-up set and measured set.
pub(super) type RefTrials = (Vec<TrialResult>, Vec<TrialResult>);

/// Paired trials of the interleaved protocol: reference set and mutant set.
pub(super) type PairedTrials = (Vec<TrialResult>, Vec<TrialResult>);

/// Run `body`, then `cleanup` regardless of its outcome. The body's error wins.
fn with_cleanup<T>(
    body: Result<T, ExecutionError>,
    cleanup: Result<(), ExecutionError>,
) -> Result<T, ExecutionError> {
    match (body, cleanup) {
        (Err(e), Err(cleanup_err)) => {
            tracing::warn!(error = %cleanup_err, "cleanup after failed step also failed");
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(_), Err(e)) => Err(e),
        (Ok(v), Ok(())) => Ok(v),
    }
}

fn reference_suffix(index: usize, trial: usize) -> String {
    format!("{index}_{trial}")
}

impl StabilityTestRunner {
    /// Try `attempt` up to the configured number of times; the last error propagates.
    pub(super) fn with_retry<T>(
        &self,
        what: &str,
        mut attempt: impl FnMut() -> Result<T, ExecutionError>,
    ) -> Result<T, ExecutionError> {
        for n in 1..self.plan.retry {
            match attempt() {
                Ok(v) => return Ok(v),
                Err(e) => tracing::warn!(what, attempt = n, error = %e, "trying again"),
            }
        }
        attempt()
    }

    /// Repeat `measure` until `stable` accepts its result or the re-run cap is reached.
    pub(super) fn until_stable<T>(
        &self,
        what: &str,
        mut measure: impl FnMut() -> Result<T, ExecutionError>,
        stable: impl Fn(&T) -> bool,
    ) -> Result<T, ExecutionError> {
        let mut rounds = 0usize;
        loop {
            let trials = measure()?;
            rounds += 1;
            if stable(&trials) {
                return Ok(trials);
            }
            if self.plan.max_stable_rounds.is_some_and(|max| rounds >= max) {
                tracing::warn!(what, rounds, "still unstable, keeping last trial set");
                return Ok(trials);
            }
            tracing::debug!(what, rounds, "unstable, measuring again");
        }
    }

    fn stable(&self, trials: &[TrialResult]) -> bool {
        self.adaptor.is_stable(trials, self.plan.stable_threshold)
    }

    /// Reference protocol for the batch at `index`, retried and re-run until stable.
    pub(super) fn measure_reference(&self, index: usize) -> Result<RefTrials, ExecutionError> {
        self.until_stable(
            "reference",
            || self.with_retry("reference", || self.reference_trials(index)),
            |(dummy, results)| self.stable(dummy) && self.stable(results),
        )
    }

    /// Block protocol for `tag`, retried and re-run until stable.
    pub(super) fn measure_mutant(&self, tag: &str) -> Result<Vec<TrialResult>, ExecutionError> {
        self.until_stable(
            tag,
            || self.with_retry(tag, || self.mutant_trials(tag)),
            |results| self.stable(results),
        )
    }

    /// Interleaved protocol for `tag`, re-run until both sides are stable.
    pub(super) fn measure_interleaved(
        &self,
        index: usize,
        tag: &str,
    ) -> Result<PairedTrials, ExecutionError> {
        self.until_stable(
            tag,
            || self.with_retry(tag, || self.interleaved_trials(index, tag)),
            |(reference, mutant)| self.stable(reference) && self.stable(mutant),
        )
    }

    fn reference_trials(&self, index: usize) -> Result<RefTrials, ExecutionError> {
        let adaptor = &self.adaptor;
        let body = (|| -> Result<RefTrials, ExecutionError> {
            let mut dummy = Vec::new();
            if self.plan.run_dummy {
                for trial in 0..self.plan.repeat {
                    dummy.push(adaptor.run(REFERENCE_TAG, &reference_suffix(index, trial), true)?);
                }
            }
            adaptor.prepare(REFERENCE_TAG)?;
            let mut results = Vec::with_capacity(self.plan.repeat);
            for trial in 0..self.plan.repeat {
                results.push(adaptor.run(REFERENCE_TAG, &reference_suffix(index, trial), false)?);
            }
            Ok((dummy, results))
        })();
        let trials = with_cleanup(body, adaptor.cleanup(REFERENCE_TAG))?;
        tracing::debug!(index, trials = ?trials.1, "reference trials");
        Ok(trials)
    }

    fn mutant_trials(&self, tag: &str) -> Result<Vec<TrialResult>, ExecutionError> {
        let adaptor = &self.adaptor;
        let body = (|| -> Result<Vec<TrialResult>, ExecutionError> {
            adaptor.prepare(tag)?;
            let mut results = Vec::with_capacity(self.plan.repeat);
            for trial in 0..self.plan.repeat {
                results.push(adaptor.run(tag, &trial.to_string(), false)?);
            }
            Ok(results)
        })();
        let trials = with_cleanup(body, adaptor.cleanup(tag))?;
        tracing::debug!(tag, trials = ?trials, "mutant trials");
        Ok(trials)
    }

    /// One trial on `tag`: prepare on the first, restore afterwards; snapshot unless last.
    fn interleaved_step(
        &self,
        tag: &str,
        suffix: &str,
        trial: usize,
    ) -> Result<TrialResult, ExecutionError> {
        let adaptor = &self.adaptor;
        let entered = if trial == 0 {
            adaptor.prepare(tag)
        } else {
            adaptor.restore_state(tag)
        };
        let body = entered.and_then(|()| adaptor.run(tag, suffix, false));
        let last = trial + 1 == self.plan.repeat;
        let tail = adaptor
            .cleanup(tag)
            .and_then(|()| if last { Ok(()) } else { adaptor.save_state(tag) });
        with_cleanup(body, tail)
    }

    fn interleaved_trials(&self, index: usize, tag: &str) -> Result<PairedTrials, ExecutionError> {
        let mut reference = Vec::with_capacity(self.plan.repeat);
        let mut mutant = Vec::with_capacity(self.plan.repeat);
        for trial in 0..self.plan.repeat {
            reference.push(self.interleaved_step(
                REFERENCE_TAG,
                &reference_suffix(index, trial),
                trial,
            )?);
            mutant.push(self.interleaved_step(tag, &trial.to_string(), trial)?);
        }
        tracing::debug!(tag, reference = ?reference, mutant = ?mutant, "interleaved trials");
        Ok((reference, mutant))
    }
}
