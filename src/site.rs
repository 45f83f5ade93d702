//! Literal site locators and site lists.
//!
//! A locator names one literal as a byte span of a source file relative to the project root:
//! `src/net/Pool.java@1042..1046`. The pipeline treats locators as opaque strings; only the
//! mutator resolves them against a tree.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

/// Site list errors.
#[derive(Debug, Error)]
pub enum SiteError {
    /// Locator text does not follow `file@START..END`.
    #[error("malformed site locator `{0}`")]
    Malformed(String),
    /// A supplied-mutation line lacks its value list.
    #[error("line {line}: expected `locator,value value ...`")]
    MissingValues {
        /// 1-based line number.
        line: usize,
    },
    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed locator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LiteralSite {
    /// Source file relative to the project root.
    pub file: PathBuf,
    /// First byte of the literal.
    pub start: usize,
    /// One past the last byte of the literal.
    pub end: usize,
}

impl LiteralSite {
    /// Create a site.
    pub fn new(file: impl Into<PathBuf>, start: usize, end: usize) -> Self {
        Self {
            file: file.into(),
            start,
            end,
        }
    }

    /// Absolute location of the source file under `root`.
    pub fn resolve_file(&self, root: &Path) -> PathBuf {
        root.join(&self.file)
    }
}

impl FromStr for LiteralSite {
    type Err = SiteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || SiteError::Malformed(s.to_string());
        let (file, span) = s.rsplit_once('@').ok_or_else(malformed)?;
        let (start, end) = span.split_once("..").ok_or_else(malformed)?;
        let start: usize = start.trim().parse().map_err(|_| malformed())?;
        let end: usize = end.trim().parse().map_err(|_| malformed())?;
        if file.is_empty() || end <= start {
            return Err(malformed());
        }
        Ok(Self::new(file, start, end))
    }
}

impl fmt::Display for LiteralSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}..{}", self.file.display(), self.start, self.end)
    }
}

/// One entry of the ordered site list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteEntry {
    /// Opaque locator.
    pub locator: String,
    /// Externally supplied replacement values, if any.
    pub supplied: Option<Vec<String>>,
}

impl SiteEntry {
    /// Entry whose values are generated from the literal kind.
    pub fn generated(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            supplied: None,
        }
    }

    /// Entry with a fixed list of values.
    pub fn supplied(locator: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            locator: locator.into(),
            supplied: Some(values),
        }
    }
}

fn content_lines(raw: &str) -> impl Iterator<Item = (usize, &str)> {
    raw.lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

/// Read a list of locators, one per line. Blank lines and `#` comments are skipped.
pub fn load_sites(path: &Path) -> Result<Vec<SiteEntry>, SiteError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(content_lines(&raw)
        .map(|(_, line)| SiteEntry::generated(line))
        .collect())
}

/// Read `locator,value value ...` lines.
pub fn load_supplied_mutations(path: &Path) -> Result<Vec<SiteEntry>, SiteError> {
    let raw = std::fs::read_to_string(path)?;
    content_lines(&raw)
        .map(|(line_no, line)| {
            let (locator, values) = line
                .rsplit_once(',')
                .ok_or(SiteError::MissingValues { line: line_no })?;
            let values: Vec<String> = values.split_whitespace().map(str::to_string).collect();
            if values.is_empty() {
                return Err(SiteError::MissingValues { line: line_no });
            }
            Ok(SiteEntry::supplied(locator.trim(), values))
        })
        .collect()
}

/// Write a plain locator list.
pub fn save_sites(path: &Path, locators: &[String]) -> Result<(), SiteError> {
    let mut out = locators.join("\n");
    out.push('\n');
    std::fs::write(path, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn locator_parses_and_displays() {
        let site: LiteralSite = "src/a/B.java@10..14".parse().expect("locator should parse");
        assert_eq!(site, LiteralSite::new("src/a/B.java", 10, 14));
        assert_eq!(site.to_string(), "src/a/B.java@10..14");
        assert_eq!(
            site.resolve_file(Path::new("/proj")),
            PathBuf::from("/proj/src/a/B.java")
        );
    }

    #[test]
    fn malformed_locators_are_rejected() {
        for bad in ["", "file", "file@", "file@3", "file@5..5", "file@9..2", "@1..2", "f@a..b"] {
            assert!(
                matches!(bad.parse::<LiteralSite>(), Err(SiteError::Malformed(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn site_lists_skip_comments_and_blank_lines() {
        let tmp = tempdir().expect("tempdir should be created");
        let path = tmp.path().join("sites.txt");
        std::fs::write(&path, "# header\nA.java@1..2\n\nB.java@3..5\n").expect("write sites");

        let sites = load_sites(&path).expect("sites should load");
        assert_eq!(
            sites,
            vec![
                SiteEntry::generated("A.java@1..2"),
                SiteEntry::generated("B.java@3..5")
            ]
        );
    }

    #[test]
    fn supplied_mutations_parse_value_lists() {
        let tmp = tempdir().expect("tempdir should be created");
        let path = tmp.path().join("mutations.txt");
        std::fs::write(&path, "A.java@1..2,8 0\nB.java@3..5, true\n").expect("write list");

        let sites = load_supplied_mutations(&path).expect("list should load");
        assert_eq!(
            sites[0],
            SiteEntry::supplied("A.java@1..2", vec!["8".to_string(), "0".to_string()])
        );
        assert_eq!(sites[1].supplied.as_deref(), Some(&["true".to_string()][..]));

        std::fs::write(&path, "A.java@1..2\n").expect("write list");
        assert!(matches!(
            load_supplied_mutations(&path),
            Err(SiteError::MissingValues { line: 1 })
        ));
    }

    #[test]
    fn save_then_load_keeps_order() {
        let tmp = tempdir().expect("tempdir should be created");
        let path = tmp.path().join("sites.txt");
        let locators = vec!["Z.java@1..2".to_string(), "A.java@7..9".to_string()];
        save_sites(&path, &locators).expect("sites should save");
        let loaded: Vec<String> = load_sites(&path)
            .expect("sites should load")
            .into_iter()
            .map(|s| s.locator)
            .collect();
        assert_eq!(loaded, locators);
    }
}
