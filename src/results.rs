//! Result records and their JSON Lines streams.
//!
//! Each stream holds one record per line and is flushed after every record, so a crashed run
//! leaves at most one torn trailing line. Reopening a stream for a resumed run keeps only the
//! well-formed records of batches below the checkpoint.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adaptor::TrialResult;

/// Result stream errors.
#[derive(Debug, Error)]
pub enum ResultStreamError {
    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Record could not be encoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Outcome of one mutation combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Measured.
    Finish,
    /// Did not build.
    AbortCompile,
    /// Built but could not be measured.
    AbortExec,
}

/// Result of one mutation combination inside a batch record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPerMut {
    /// Value per site.
    pub mutation: Vec<String>,
    /// Outcome.
    pub status: Status,
    /// Paired reference trials (interleaved protocol).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_results: Option<Vec<TrialResult>>,
    /// Mutant trials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<TrialResult>>,
    /// Failure text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

/// All combinations measured for one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutResult {
    /// Batch locators.
    pub paths: Vec<String>,
    /// Batch start index.
    pub batch_index: usize,
    /// One entry per combination, in production order.
    pub mutations: Vec<ResultPerMut>,
}

impl MutResult {
    /// Empty record for a batch.
    pub fn new(paths: Vec<String>, batch_index: usize) -> Self {
        Self {
            paths,
            batch_index,
            mutations: Vec::new(),
        }
    }

    /// Record block-protocol trials.
    pub fn push_finish(&mut self, mutation: Vec<String>, results: Vec<TrialResult>) {
        self.mutations.push(ResultPerMut {
            mutation,
            status: Status::Finish,
            ref_results: None,
            results: Some(results),
            log: None,
        });
    }

    /// Record interleaved-protocol trials.
    pub fn push_interleaved(
        &mut self,
        mutation: Vec<String>,
        ref_results: Vec<TrialResult>,
        results: Vec<TrialResult>,
    ) {
        self.mutations.push(ResultPerMut {
            mutation,
            status: Status::Finish,
            ref_results: Some(ref_results),
            results: Some(results),
            log: None,
        });
    }

    /// Record a failure.
    pub fn push_abort(&mut self, mutation: Vec<String>, status: Status, log: impl Into<String>) {
        self.mutations.push(ResultPerMut {
            mutation,
            status,
            ref_results: None,
            results: None,
            log: Some(log.into()),
        });
    }
}

/// Reference trials taken at the start of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefResult {
    /// Batch the reference was measured for.
    pub batch_index: usize,
    /// Warm-up trials.
    #[serde(default)]
    pub dummy_results: Vec<TrialResult>,
    /// Measured trials.
    pub results: Vec<TrialResult>,
}

/// Records keyed by batch index.
pub trait BatchRecord: Serialize + DeserializeOwned {
    /// Batch start index.
    fn batch_index(&self) -> usize;
}

impl BatchRecord for MutResult {
    fn batch_index(&self) -> usize {
        self.batch_index
    }
}

impl BatchRecord for RefResult {
    fn batch_index(&self) -> usize {
        self.batch_index
    }
}

/// Records read back from a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamContents<R> {
    /// Well-formed records in file order.
    pub records: Vec<R>,
    /// Lines that did not parse.
    pub malformed_lines: usize,
}

/// Read every well-formed record. A missing file reads as empty.
pub fn read_records<R: BatchRecord>(path: &Path) -> Result<StreamContents<R>, ResultStreamError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(StreamContents {
                records: Vec::new(),
                malformed_lines: 0,
            });
        }
        Err(e) => return Err(e.into()),
    };
    let mut records = Vec::new();
    let mut malformed_lines = 0;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<R>(&line) {
            Ok(record) => records.push(record),
            Err(_) => malformed_lines += 1,
        }
    }
    Ok(StreamContents {
        records,
        malformed_lines,
    })
}

/// Append-only JSON Lines stream.
#[derive(Debug)]
pub struct ResultStream<R> {
    path: PathBuf,
    writer: BufWriter<File>,
    written: usize,
    _record: PhantomData<fn(R)>,
}

impl<R: BatchRecord> ResultStream<R> {
    /// Open for a run resuming at `checkpoint`. Records of batches at or past the checkpoint
    /// and malformed lines are dropped; `0` starts a fresh stream.
    pub fn open(path: impl Into<PathBuf>, checkpoint: usize) -> Result<Self, ResultStreamError> {
        let path = path.into();
        let kept: Vec<R> = if checkpoint == 0 {
            Vec::new()
        } else {
            let contents = read_records::<R>(&path)?;
            let before = contents.records.len();
            let kept: Vec<R> = contents
                .records
                .into_iter()
                .filter(|r| r.batch_index() < checkpoint)
                .collect();
            if kept.len() != before || contents.malformed_lines > 0 {
                tracing::info!(
                    path = %path.display(),
                    kept = kept.len(),
                    dropped = before - kept.len(),
                    malformed = contents.malformed_lines,
                    "truncated result stream"
                );
            }
            kept
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut stream = Self {
            path,
            writer: BufWriter::new(file),
            written: 0,
            _record: PhantomData,
        };
        for record in &kept {
            stream.write_line(record)?;
        }
        stream.writer.flush()?;
        Ok(stream)
    }

    fn write_line(&mut self, record: &R) -> Result<(), ResultStreamError> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    /// Append one record and flush it.
    pub fn append(&mut self, record: &R) -> Result<(), ResultStreamError> {
        self.write_line(record)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Records in the stream, kept ones included.
    pub fn len(&self) -> usize {
        self.written
    }

    /// Whether the stream holds no records.
    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    /// Stream location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and sync to disk.
    pub fn finish(mut self) -> Result<usize, ResultStreamError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(self.written)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn trial(v: f64) -> TrialResult {
        TrialResult::from([("time".to_string(), v)])
    }

    fn record(index: usize) -> MutResult {
        let mut r = MutResult::new(vec![format!("A.java@{index}..{}", index + 1)], index);
        r.push_finish(vec!["8".to_string()], vec![trial(1.0), trial(1.1)]);
        r.push_abort(vec!["0".to_string()], Status::AbortCompile, "does not compile");
        r
    }

    #[test]
    fn status_and_optional_fields_serialize_compactly() {
        let json = serde_json::to_string(&record(0)).expect("record should serialize");
        assert!(json.contains("\"FINISH\""));
        assert!(json.contains("\"ABORT_COMPILE\""));
        assert!(!json.contains("ref_results"));
    }

    #[test]
    fn append_then_read_back() {
        let tmp = tempdir().expect("tempdir should be created");
        let path = tmp.path().join("mut-results.jsonl");
        let mut stream = ResultStream::<MutResult>::open(&path, 0).expect("stream should open");
        stream.append(&record(0)).expect("append");
        stream.append(&record(1)).expect("append");
        assert_eq!(stream.finish().expect("finish"), 2);

        let contents = read_records::<MutResult>(&path).expect("read");
        assert_eq!(contents.records, vec![record(0), record(1)]);
        assert_eq!(contents.malformed_lines, 0);
    }

    #[test]
    fn resume_drops_records_past_checkpoint_and_torn_tail() {
        let tmp = tempdir().expect("tempdir should be created");
        let path = tmp.path().join("mut-results.jsonl");
        let mut raw = String::new();
        for i in 0..3 {
            raw.push_str(&serde_json::to_string(&record(i)).expect("serialize"));
            raw.push('\n');
        }
        raw.push_str("{\"paths\":[\"A.java@3..4\"],\"batch_in");
        std::fs::write(&path, raw).expect("seed stream");

        let mut stream = ResultStream::<MutResult>::open(&path, 2).expect("stream should open");
        assert_eq!(stream.len(), 2);
        stream.append(&record(2)).expect("append");
        stream.finish().expect("finish");

        let contents = read_records::<MutResult>(&path).expect("read");
        assert_eq!(contents.malformed_lines, 0);
        let indices: Vec<usize> = contents.records.iter().map(|r| r.batch_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn fresh_open_truncates_and_missing_reads_empty() {
        let tmp = tempdir().expect("tempdir should be created");
        let path = tmp.path().join("ref-results.jsonl");
        assert!(read_records::<RefResult>(&path).expect("read").records.is_empty());

        std::fs::write(&path, "garbage\n").expect("seed");
        let stream = ResultStream::<RefResult>::open(&path, 0).expect("stream should open");
        assert!(stream.is_empty());
        stream.finish().expect("finish");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "");
    }
}
