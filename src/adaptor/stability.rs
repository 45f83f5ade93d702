//! Dispersion test over a set of trials.

use super::TrialResult;

/// Summary of per-trial metric sums.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialStats {
    /// Number of trials.
    pub count: usize,
    /// Mean of the per-trial sums.
    pub mean: f64,
    /// Sample standard deviation of the per-trial sums (0 below two trials).
    pub std_dev: f64,
}

/// Sum of all metric values of one trial.
pub fn trial_sum(trial: &TrialResult) -> f64 {
    trial.values().sum()
}

/// Mean and sample standard deviation of the per-trial sums; `None` for an empty set.
pub fn summarize(trials: &[TrialResult]) -> Option<TrialStats> {
    if trials.is_empty() {
        return None;
    }
    let sums: Vec<f64> = trials.iter().map(trial_sum).collect();
    let count = sums.len();
    let mean = sums.iter().sum::<f64>() / count as f64;
    let identical = sums.windows(2).all(|w| w[0] == w[1]);
    let std_dev = if count < 2 || identical {
        0.0
    } else {
        let var = sums.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
        var.sqrt()
    };
    Some(TrialStats {
        count,
        mean,
        std_dev,
    })
}

/// `true` when the standard deviation is within `threshold` times the mean magnitude.
/// Empty sets and non-positive thresholds are always stable.
pub fn is_stable(trials: &[TrialResult], threshold: f64) -> bool {
    if threshold <= 0.0 {
        return true;
    }
    let Some(stats) = summarize(trials) else {
        return true;
    };
    let stable = stats.std_dev <= threshold * stats.mean.abs();
    tracing::debug!(
        trials = stats.count,
        mean = stats.mean,
        std_dev = stats.std_dev,
        threshold,
        stable,
        "stability check"
    );
    stable
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn trial(pairs: &[(&str, f64)]) -> TrialResult {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn empty_and_disabled_are_stable() {
        assert!(is_stable(&[], 0.01));
        let noisy = vec![trial(&[("t", 1.0)]), trial(&[("t", 100.0)])];
        assert!(is_stable(&noisy, 0.0));
        assert!(is_stable(&noisy, -1.0));
        assert!(!is_stable(&noisy, 0.01));
    }

    #[test]
    fn metrics_are_summed_per_trial() {
        let trials = vec![
            trial(&[("cpu", 1.0), ("mem", 9.0)]),
            trial(&[("cpu", 4.0), ("mem", 6.0)]),
        ];
        let stats = summarize(&trials).expect("non-empty set");
        assert_eq!(stats.count, 2);
        assert_eq!(stats.mean, 10.0);
        assert_eq!(stats.std_dev, 0.0);
        assert!(is_stable(&trials, 1e-9));
    }

    #[test]
    fn sample_deviation_is_used() {
        let trials = vec![trial(&[("t", 2.0)]), trial(&[("t", 4.0)]), trial(&[("t", 6.0)])];
        let stats = summarize(&trials).expect("non-empty set");
        assert_eq!(stats.mean, 4.0);
        assert!((stats.std_dev - 2.0).abs() < 1e-12);
        assert!(is_stable(&trials, 0.5));
        assert!(!is_stable(&trials, 0.49));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(1000))]

        #[test]
        fn equal_sums_are_stable_for_any_positive_threshold(
            value in -1.0e6f64..1.0e6,
            count in 1usize..10,
            threshold in 1.0e-12f64..10.0,
        ) {
            let trials: Vec<TrialResult> = (0..count).map(|_| trial(&[("m", value)])).collect();
            prop_assert!(is_stable(&trials, threshold));
        }
    }
}
