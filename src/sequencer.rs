//! Lockstep rounds over a batch of literal sites.
//!
//! Round `r` applies every site's `r`-th value, or its original text once the site's sequence
//! is exhausted. A batch yields as many rounds as its longest sequence.
//!
//! Each round first resets every site, then writes sites of one file from the highest offset
//! down, whatever their order in the batch. Sites whose spans overlap cannot share a batch.

use std::cmp::Reverse;

use thiserror::Error;

use crate::mutator::{MutationSequence, Mutator, MutatorError};
use crate::site::SiteEntry;

/// A batch could not be opened.
#[derive(Debug, Error)]
#[error("cannot open batch at {index}: {source}")]
pub struct BatchOpenError {
    /// Batch start index.
    pub index: usize,
    /// Locators opened up to and including the failing one. The failing locator is kept so
    /// the failure record always names at least one site.
    pub skipped: Vec<String>,
    /// Why the failing site was rejected.
    #[source]
    pub source: MutatorError,
}

/// One synchronized step over a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Round {
    /// Start index of the batch in the site list.
    pub index: usize,
    /// Value of every site in site order.
    pub values: Vec<String>,
}

impl Round {
    /// Artifact name: batch index followed by the values.
    pub fn tag(&self) -> String {
        let mut tag = self.index.to_string();
        for value in &self.values {
            tag.push('_');
            tag.push_str(value);
        }
        tag
    }
}

/// Builds [`BatchRounds`] from a mutator.
#[derive(Debug, Clone, Copy)]
pub struct MutationSequencer<'m> {
    mutator: &'m Mutator,
}

impl<'m> MutationSequencer<'m> {
    /// Sequencer over `mutator`'s tree.
    pub fn new(mutator: &'m Mutator) -> Self {
        Self { mutator }
    }

    /// Open every site of the batch starting at `index`.
    pub fn step_batch(
        &self,
        index: usize,
        entries: &[SiteEntry],
    ) -> Result<BatchRounds, BatchOpenError> {
        let mut sequences = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.mutator.open(entry) {
                Ok(seq) => sequences.push(seq),
                Err(source) => {
                    let mut skipped: Vec<String> =
                        sequences.iter().map(|s| s.locator().to_string()).collect();
                    skipped.push(entry.locator.clone());
                    // Already opened sequences reset on drop.
                    drop(sequences);
                    return Err(BatchOpenError {
                        index,
                        skipped,
                        source,
                    });
                }
            }
        }
        if let Some((first, second)) = find_overlap(&sequences) {
            let skipped = sequences.iter().map(|s| s.locator().to_string()).collect();
            let source = MutatorError::InvalidSite {
                locator: sequences[second].locator().to_string(),
                reason: format!("span overlaps {}", sequences[first].locator()),
            };
            return Err(BatchOpenError {
                index,
                skipped,
                source,
            });
        }
        let order = write_order(&sequences);
        Ok(BatchRounds {
            index,
            sequences,
            order,
            failed: false,
        })
    }
}

/// Indices of `sequences` in write order: descending start offset, so a write never shifts a
/// span of the same file that is still to be written.
pub(crate) fn write_order(sequences: &[MutationSequence]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..sequences.len()).collect();
    order.sort_by_key(|&i| Reverse(sequences[i].site().start));
    order
}

/// First pair of sites in one file whose spans share a byte.
pub(crate) fn find_overlap(sequences: &[MutationSequence]) -> Option<(usize, usize)> {
    for (i, a) in sequences.iter().enumerate() {
        for (j, b) in sequences.iter().enumerate().skip(i + 1) {
            let (a, b) = (a.site(), b.site());
            if a.file == b.file && a.start < b.end && b.start < a.end {
                return Some((i, j));
            }
        }
    }
    None
}

/// Iterator over the rounds of one open batch.
#[derive(Debug)]
pub struct BatchRounds {
    index: usize,
    sequences: Vec<MutationSequence>,
    order: Vec<usize>,
    failed: bool,
}

impl BatchRounds {
    /// Batch start index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Locators of the batch in site order.
    pub fn paths(&self) -> Vec<String> {
        self.sequences
            .iter()
            .map(|s| s.locator().to_string())
            .collect()
    }

    fn step(&mut self) -> Result<Round, MutatorError> {
        for seq in &mut self.sequences {
            seq.reset()?;
        }
        let mut values = vec![String::new(); self.sequences.len()];
        for &i in &self.order {
            values[i] = self.sequences[i].next_or_original()?;
        }
        Ok(Round {
            index: self.index,
            values,
        })
    }

    /// Reset every site and release the batch.
    pub fn close(self) -> Result<(), MutatorError> {
        let mut first_err = None;
        for seq in self.sequences {
            if let Err(e) = seq.close() {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Iterator for BatchRounds {
    type Item = Result<Round, MutatorError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || !self.sequences.iter().any(MutationSequence::has_next) {
            return None;
        }
        let round = self.step();
        self.failed = round.is_err();
        Some(round)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tempfile::tempdir;

    use super::*;
    use crate::mutator::LiteralKind;

    fn supplied(locator: &str, values: &[&str]) -> SiteEntry {
        SiteEntry::supplied(locator, values.iter().map(|v| v.to_string()).collect())
    }

    fn collect(mut rounds: BatchRounds) -> Vec<Round> {
        let out: Vec<Round> = rounds
            .by_ref()
            .collect::<Result<_, _>>()
            .expect("rounds should apply");
        rounds.close().expect("batch should close");
        out
    }

    #[test]
    fn single_value_site_yields_one_round() {
        let tmp = tempdir().expect("tempdir should be created");
        std::fs::write(tmp.path().join("A.java"), "x = 1;").expect("write source");
        let mutator = Mutator::new(tmp.path(), LiteralKind::Numeric);

        let rounds = MutationSequencer::new(&mutator)
            .step_batch(0, &[supplied("A.java@4..5", &["5"])])
            .expect("batch should open");
        let rounds = collect(rounds);

        assert_eq!(rounds.len(), 1);
        assert_eq!(rounds[0].index, 0);
        assert_eq!(rounds[0].values, ["5"]);
        assert_eq!(rounds[0].tag(), "0_5");
    }

    #[test]
    fn shorter_sequences_freeze_at_original() {
        let tmp = tempdir().expect("tempdir should be created");
        std::fs::write(tmp.path().join("A.java"), "a = 10;").expect("write source");
        std::fs::write(tmp.path().join("B.java"), "b = 3;").expect("write source");
        let mutator = Mutator::new(tmp.path(), LiteralKind::Numeric);

        let rounds = MutationSequencer::new(&mutator)
            .step_batch(
                4,
                &[
                    supplied("A.java@4..6", &["1", "2", "3"]),
                    supplied("B.java@4..5", &["9"]),
                ],
            )
            .expect("batch should open");
        let rounds = collect(rounds);

        let values: Vec<Vec<String>> = rounds.iter().map(|r| r.values.clone()).collect();
        assert_eq!(values, vec![vec!["1", "9"], vec!["2", "3"], vec!["3", "3"]]);
        assert_eq!(rounds[1].tag(), "4_2_3");
    }

    #[test]
    fn same_file_sites_are_written_without_overlap() {
        let tmp = tempdir().expect("tempdir should be created");
        let file = tmp.path().join("Conf.java");
        std::fs::write(&file, "a = 1; b = 64;").expect("write source");
        let mutator = Mutator::new(tmp.path(), LiteralKind::Numeric);

        let mut rounds = MutationSequencer::new(&mutator)
            .step_batch(
                0,
                &[
                    SiteEntry::generated("Conf.java@4..5"),
                    SiteEntry::generated("Conf.java@11..13"),
                ],
            )
            .expect("batch should open");

        let first = rounds.next().expect("first round").expect("apply");
        assert_eq!(first.values, ["8", "512"]);
        assert_eq!(std::fs::read_to_string(&file).expect("read"), "a = 8; b = 512;");

        let second = rounds.next().expect("second round").expect("apply");
        assert_eq!(second.values, ["0", "8"]);
        assert_eq!(std::fs::read_to_string(&file).expect("read"), "a = 0; b = 8;");

        assert!(rounds.next().is_none());
        rounds.close().expect("batch should close");
        assert_eq!(std::fs::read_to_string(&file).expect("read"), "a = 1; b = 64;");
    }

    #[test]
    fn same_file_sites_listed_by_descending_offset_stay_intact() {
        let tmp = tempdir().expect("tempdir should be created");
        let file = tmp.path().join("Conf.java");
        std::fs::write(&file, "a = 64; b = 1;").expect("write source");
        let mutator = Mutator::new(tmp.path(), LiteralKind::Numeric);

        let mut rounds = MutationSequencer::new(&mutator)
            .step_batch(
                0,
                &[
                    SiteEntry::generated("Conf.java@12..13"),
                    SiteEntry::generated("Conf.java@4..6"),
                ],
            )
            .expect("batch should open");
        assert_eq!(rounds.paths(), ["Conf.java@12..13", "Conf.java@4..6"]);

        let first = rounds.next().expect("first round").expect("apply");
        assert_eq!(first.values, ["8", "512"]);
        assert_eq!(std::fs::read_to_string(&file).expect("read"), "a = 512; b = 8;");

        let second = rounds.next().expect("second round").expect("apply");
        assert_eq!(second.values, ["0", "8"]);
        assert_eq!(std::fs::read_to_string(&file).expect("read"), "a = 8; b = 0;");

        assert!(rounds.next().is_none());
        rounds.close().expect("batch should close");
        assert_eq!(std::fs::read_to_string(&file).expect("read"), "a = 64; b = 1;");
    }

    #[test]
    fn overlapping_sites_cannot_share_a_batch() {
        let tmp = tempdir().expect("tempdir should be created");
        let file = tmp.path().join("Conf.java");
        std::fs::write(&file, "a = 640;").expect("write source");
        let mutator = Mutator::new(tmp.path(), LiteralKind::Numeric);

        let err = MutationSequencer::new(&mutator)
            .step_batch(
                3,
                &[
                    SiteEntry::generated("Conf.java@4..7"),
                    SiteEntry::generated("Conf.java@5..7"),
                ],
            )
            .expect_err("overlapping spans should be rejected");
        assert_eq!(err.index, 3);
        assert_eq!(err.skipped, ["Conf.java@4..7", "Conf.java@5..7"]);
        assert!(matches!(
            err.source,
            MutatorError::InvalidSite { ref locator, .. } if locator == "Conf.java@5..7"
        ));
        assert_eq!(std::fs::read_to_string(&file).expect("read"), "a = 640;");
    }

    #[test]
    fn failing_site_reports_accumulated_sites_and_restores_tree() {
        let tmp = tempdir().expect("tempdir should be created");
        let file = tmp.path().join("A.java");
        std::fs::write(&file, "x = 1;").expect("write source");
        let mutator = Mutator::new(tmp.path(), LiteralKind::Numeric);

        let err = MutationSequencer::new(&mutator)
            .step_batch(
                2,
                &[
                    SiteEntry::generated("A.java@4..5"),
                    SiteEntry::generated("Gone.java@0..1"),
                ],
            )
            .expect_err("missing file should fail the batch");
        assert_eq!(err.index, 2);
        assert_eq!(err.skipped, ["A.java@4..5", "Gone.java@0..1"]);
        assert!(matches!(err.source, MutatorError::InvalidSite { .. }));
        assert_eq!(std::fs::read_to_string(&file).expect("read"), "x = 1;");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn round_count_is_longest_sequence(lengths in proptest::collection::vec(0usize..5, 1..4)) {
            let tmp = tempdir().expect("tempdir should be created");
            let mut entries = Vec::new();
            let mut originals = Vec::new();
            for (i, len) in lengths.iter().enumerate() {
                let name = format!("S{i}.java");
                let original = format!("{}", 10 + i);
                std::fs::write(tmp.path().join(&name), format!("v = {original};"))
                    .expect("write source");
                let values: Vec<String> = (0..*len).map(|r| format!("{}", 100 * (i + 1) + r)).collect();
                entries.push(SiteEntry::supplied(format!("{name}@4..6"), values));
                originals.push(original);
            }
            let before: Vec<Vec<u8>> = (0..lengths.len())
                .map(|i| std::fs::read(tmp.path().join(format!("S{i}.java"))).expect("read"))
                .collect();

            let mutator = Mutator::new(tmp.path(), LiteralKind::Numeric);
            let rounds = MutationSequencer::new(&mutator)
                .step_batch(0, &entries)
                .expect("batch should open");
            let rounds = collect(rounds);

            let longest = lengths.iter().copied().max().unwrap_or(0);
            prop_assert_eq!(rounds.len(), longest);
            for (r, round) in rounds.iter().enumerate() {
                for (i, len) in lengths.iter().enumerate() {
                    let expected = if r < *len {
                        format!("{}", 100 * (i + 1) + r)
                    } else {
                        originals[i].clone()
                    };
                    prop_assert_eq!(&round.values[i], &expected);
                }
            }
            for (i, bytes) in before.iter().enumerate() {
                let after = std::fs::read(tmp.path().join(format!("S{i}.java"))).expect("read");
                prop_assert_eq!(&after, bytes);
            }
        }
    }
}
