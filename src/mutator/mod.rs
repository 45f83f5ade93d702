//! Literal mutation: resolve a site in the project tree and walk its candidate values.
//!
//! Opening a site snapshots the bytes of its source file. A sequence remembers how long the
//! text it last wrote is, so each applied value replaces exactly the previous one at the
//! site's start offset. Writes to one site do not move the offsets of sites earlier in the same
//! file; [`crate::sequencer`] therefore writes same-file sites from the highest offset down.
//! [`MutationSequence::reset`] writes the snapshot back; closing or dropping a sequence resets
//! it.

mod kind;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub use kind::{EnumTable, LiteralKind, LiteralValue};

use crate::site::{LiteralSite, SiteEntry};

/// Mutator errors.
#[derive(Debug, Error)]
pub enum MutatorError {
    /// The locator does not resolve to a literal of the configured kind.
    #[error("invalid site {locator}: {reason}")]
    InvalidSite {
        /// Locator as listed.
        locator: String,
        /// What went wrong.
        reason: String,
    },
    /// A supplied value does not fit the literal at its site.
    #[error("invalid value `{value}` for {locator}")]
    InvalidValue {
        /// Locator as listed.
        locator: String,
        /// Rejected value text.
        value: String,
    },
    /// Writing the source file failed.
    #[error("io error on {path}: {source}")]
    Io {
        /// File being written.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// Opens mutation sequences against one project tree.
#[derive(Debug, Clone)]
pub struct Mutator {
    root: PathBuf,
    kind: LiteralKind,
    enums: EnumTable,
}

impl Mutator {
    /// Mutator for `root` producing candidates of `kind`.
    pub fn new(root: impl Into<PathBuf>, kind: LiteralKind) -> Self {
        Self {
            root: root.into(),
            kind,
            enums: EnumTable::default(),
        }
    }

    /// Use `enums` for enum candidates.
    pub fn with_enum_table(mut self, enums: EnumTable) -> Self {
        self.enums = enums;
        self
    }

    /// Project tree being mutated.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Open the sequence for a site-list entry.
    pub fn open(&self, entry: &SiteEntry) -> Result<MutationSequence, MutatorError> {
        let invalid = |reason: String| MutatorError::InvalidSite {
            locator: entry.locator.clone(),
            reason,
        };
        let site: LiteralSite = entry.locator.parse().map_err(|e| invalid(format!("{e}")))?;
        let target = site.resolve_file(&self.root);
        let snapshot = std::fs::read(&target)
            .map_err(|e| invalid(format!("cannot read {}: {e}", target.display())))?;
        if site.end > snapshot.len() {
            return Err(invalid(format!(
                "span ends past end of file ({} bytes)",
                snapshot.len()
            )));
        }
        let text = std::str::from_utf8(&snapshot[site.start..site.end])
            .map_err(|_| invalid("span is not valid utf-8 text".to_string()))?;
        let original = self
            .kind
            .from_text(text)
            .ok_or_else(|| invalid(format!("`{text}` is not a {} literal", self.kind)))?;

        let candidates = match &entry.supplied {
            Some(values) => values
                .iter()
                .map(|value| {
                    original
                        .reinterpret(value)
                        .ok_or_else(|| MutatorError::InvalidValue {
                            locator: entry.locator.clone(),
                            value: value.clone(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => self.kind.candidates(&original, &self.enums),
        };
        tracing::trace!(
            locator = %entry.locator,
            original = %text,
            candidates = candidates.len(),
            "opened site"
        );

        Ok(MutationSequence {
            locator: entry.locator.clone(),
            written_len: site.end - site.start,
            site,
            target,
            snapshot,
            original,
            candidates: candidates.iter().map(LiteralValue::to_text).collect(),
            closed: false,
        })
    }
}

/// Candidate values of one open site.
#[derive(Debug)]
pub struct MutationSequence {
    locator: String,
    site: LiteralSite,
    target: PathBuf,
    snapshot: Vec<u8>,
    original: LiteralValue,
    candidates: VecDeque<String>,
    written_len: usize,
    closed: bool,
}

impl MutationSequence {
    /// Locator this sequence was opened from.
    pub fn locator(&self) -> &str {
        &self.locator
    }

    /// Resolved site.
    pub fn site(&self) -> &LiteralSite {
        &self.site
    }

    /// Source text of the unmodified literal.
    pub fn original(&self) -> String {
        self.original.to_text()
    }

    /// Whether a candidate value remains.
    pub fn has_next(&self) -> bool {
        !self.candidates.is_empty()
    }

    /// Number of candidate values not yet applied.
    pub fn remaining(&self) -> usize {
        self.candidates.len()
    }

    /// Apply the next candidate value and return it, or `None` when exhausted.
    pub fn next_mutation(&mut self) -> Result<Option<String>, MutatorError> {
        let Some(value) = self.candidates.pop_front() else {
            return Ok(None);
        };
        self.write_value(&value)?;
        Ok(Some(value))
    }

    /// Apply the next candidate value, or report the original text when exhausted.
    pub fn next_or_original(&mut self) -> Result<String, MutatorError> {
        match self.next_mutation()? {
            Some(value) => Ok(value),
            None => Ok(self.original()),
        }
    }

    /// Restore the file to its content at open time.
    ///
    /// The whole file is rewritten, which also undoes values of other open sites in it.
    pub fn reset(&mut self) -> Result<(), MutatorError> {
        std::fs::write(&self.target, &self.snapshot).map_err(|source| MutatorError::Io {
            path: self.target.clone(),
            source,
        })?;
        self.written_len = self.site.end - self.site.start;
        Ok(())
    }

    /// Reset and release the site.
    pub fn close(mut self) -> Result<(), MutatorError> {
        self.closed = true;
        self.reset()
    }

    fn write_value(&mut self, value: &str) -> Result<(), MutatorError> {
        let io_err = |source| MutatorError::Io {
            path: self.target.clone(),
            source,
        };
        let current = std::fs::read(&self.target).map_err(io_err)?;
        let end = self.site.start + self.written_len;
        if end > current.len() {
            return Err(MutatorError::InvalidSite {
                locator: self.locator.clone(),
                reason: "file shrank below the literal span".to_string(),
            });
        }
        let mut out = Vec::with_capacity(current.len() + value.len());
        out.extend_from_slice(&current[..self.site.start]);
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(&current[end..]);
        std::fs::write(&self.target, out).map_err(io_err)?;
        self.written_len = value.len();
        Ok(())
    }
}

impl Drop for MutationSequence {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.reset() {
                tracing::warn!(locator = %self.locator, error = %e, "failed to restore site on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn project(source: &str) -> (tempfile::TempDir, Mutator) {
        let tmp = tempdir().expect("tempdir should be created");
        std::fs::write(tmp.path().join("Conf.java"), source).expect("source should be written");
        let mutator = Mutator::new(tmp.path(), LiteralKind::Numeric);
        (tmp, mutator)
    }

    fn read(tmp: &tempfile::TempDir) -> String {
        std::fs::read_to_string(tmp.path().join("Conf.java")).expect("source should be readable")
    }

    #[test]
    fn values_are_applied_in_order_then_original() {
        let (tmp, mutator) = project("int size = 64;");
        let mut seq = mutator
            .open(&SiteEntry::generated("Conf.java@11..13"))
            .expect("site should open");
        assert_eq!(seq.original(), "64");
        assert_eq!(seq.remaining(), 2);

        assert_eq!(seq.next_mutation().expect("apply").as_deref(), Some("512"));
        assert_eq!(read(&tmp), "int size = 512;");
        assert_eq!(seq.next_or_original().expect("apply"), "8");
        assert_eq!(read(&tmp), "int size = 8;");
        assert!(!seq.has_next());
        assert_eq!(seq.next_or_original().expect("exhausted"), "64");

        seq.reset().expect("reset");
        assert_eq!(read(&tmp), "int size = 64;");
    }

    #[test]
    fn consecutive_values_replace_each_other_without_reset() {
        let (tmp, mutator) = project("int size = 64; int n = 7;");
        let entry = SiteEntry::supplied(
            "Conf.java@11..13",
            vec!["1000".to_string(), "5".to_string(), "12".to_string()],
        );
        let mut seq = mutator.open(&entry).expect("site should open");

        seq.next_mutation().expect("apply");
        assert_eq!(read(&tmp), "int size = 1000; int n = 7;");
        seq.next_mutation().expect("apply");
        assert_eq!(read(&tmp), "int size = 5; int n = 7;");
        seq.next_mutation().expect("apply");
        assert_eq!(read(&tmp), "int size = 12; int n = 7;");

        seq.close().expect("close");
        assert_eq!(read(&tmp), "int size = 64; int n = 7;");
    }

    #[test]
    fn close_and_drop_restore_the_file() {
        let (tmp, mutator) = project("int size = 64;");
        let mut seq = mutator
            .open(&SiteEntry::generated("Conf.java@11..13"))
            .expect("site should open");
        seq.next_mutation().expect("apply");
        seq.close().expect("close");
        assert_eq!(read(&tmp), "int size = 64;");

        {
            let mut seq = mutator
                .open(&SiteEntry::generated("Conf.java@11..13"))
                .expect("site should open");
            seq.next_mutation().expect("apply");
        }
        assert_eq!(read(&tmp), "int size = 64;");
    }

    #[test]
    fn supplied_values_replace_generated_ones() {
        let (tmp, mutator) = project("long t = 10L;");
        let entry = SiteEntry::supplied("Conf.java@9..12", vec!["3".to_string()]);
        let mut seq = mutator.open(&entry).expect("site should open");
        assert_eq!(seq.next_mutation().expect("apply").as_deref(), Some("3L"));
        assert_eq!(read(&tmp), "long t = 3L;");

        let bad = SiteEntry::supplied("Conf.java@9..12", vec!["fast".to_string()]);
        drop(seq);
        assert!(matches!(
            mutator.open(&bad),
            Err(MutatorError::InvalidValue { value, .. }) if value == "fast"
        ));
    }

    #[test]
    fn unresolvable_sites_are_invalid() {
        let (_tmp, mutator) = project("int size = 64;");
        for locator in ["Missing.java@1..2", "Conf.java@11..99", "Conf.java@0..3", "garbage"] {
            assert!(
                matches!(
                    mutator.open(&SiteEntry::generated(locator)),
                    Err(MutatorError::InvalidSite { .. })
                ),
                "{locator} should be invalid"
            );
        }
    }
}
