//! Summaries of recorded result streams.

use std::path::Path;

use serde::Serialize;

use crate::adaptor::{TrialResult, summarize};
use crate::results::{MutResult, RefResult, ResultStreamError, Status, read_records};

/// Supported output formats for profile reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// Markdown summary.
    Markdown,
    /// JSON summary with every mutation inline.
    Json,
}

/// One mutation combination of a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationReport {
    /// Value per site.
    pub mutation: Vec<String>,
    /// Outcome.
    pub status: Status,
    /// Trials kept.
    pub trials: usize,
    /// Mean of the per-trial metric sums.
    pub mean: Option<f64>,
    /// Reference mean this mutation is compared against.
    pub reference_mean: Option<f64>,
    /// `(mean - reference) / reference`.
    pub relative_change: Option<f64>,
    /// Failure text.
    pub log: Option<String>,
}

/// One batch record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    /// Batch start index.
    pub batch_index: usize,
    /// Batch locators.
    pub paths: Vec<String>,
    /// Mean of the reference set recorded for this batch, if any.
    pub reference_mean: Option<f64>,
    /// Combinations in production order.
    pub mutations: Vec<MutationReport>,
}

/// Aggregated counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProfileSummary {
    /// Batch records.
    pub batches: usize,
    /// Combinations across all batches.
    pub mutations: usize,
    /// Measured combinations.
    pub finished: usize,
    /// Combinations that did not build.
    pub abort_compile: usize,
    /// Combinations that could not be measured.
    pub abort_exec: usize,
}

/// Everything `render_report` prints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileReport {
    /// Counts.
    pub summary: ProfileSummary,
    /// Unparseable lines across both streams.
    pub malformed_lines: usize,
    /// Per-batch detail.
    pub batches: Vec<BatchReport>,
}

fn mean_of(trials: &[TrialResult]) -> Option<f64> {
    summarize(trials).map(|stats| stats.mean)
}

fn relative_change(mean: Option<f64>, reference: Option<f64>) -> Option<f64> {
    match (mean, reference) {
        (Some(mean), Some(reference)) if reference != 0.0 => Some((mean - reference) / reference),
        _ => None,
    }
}

impl ProfileReport {
    /// Join mutation records with the reference that was current for each batch.
    pub fn from_records(refs: &[RefResult], muts: &[MutResult]) -> Self {
        let mut summary = ProfileSummary::default();
        let mut batches = Vec::with_capacity(muts.len());

        for record in muts {
            let batch_ref = refs
                .iter()
                .filter(|r| r.batch_index <= record.batch_index)
                .max_by_key(|r| r.batch_index)
                .and_then(|r| mean_of(&r.results));
            let own_ref = refs
                .iter()
                .any(|r| r.batch_index == record.batch_index)
                .then_some(batch_ref)
                .flatten();

            let mutations = record
                .mutations
                .iter()
                .map(|entry| {
                    match entry.status {
                        Status::Finish => summary.finished += 1,
                        Status::AbortCompile => summary.abort_compile += 1,
                        Status::AbortExec => summary.abort_exec += 1,
                    }
                    let results = entry.results.as_deref().unwrap_or_default();
                    let mean = mean_of(results);
                    let reference_mean = match &entry.ref_results {
                        Some(paired) => mean_of(paired),
                        None => batch_ref,
                    };
                    MutationReport {
                        mutation: entry.mutation.clone(),
                        status: entry.status,
                        trials: results.len(),
                        mean,
                        reference_mean,
                        relative_change: relative_change(mean, reference_mean),
                        log: entry.log.clone(),
                    }
                })
                .collect::<Vec<_>>();

            summary.batches += 1;
            summary.mutations += mutations.len();
            batches.push(BatchReport {
                batch_index: record.batch_index,
                paths: record.paths.clone(),
                reference_mean: own_ref,
                mutations,
            });
        }

        Self {
            summary,
            malformed_lines: 0,
            batches,
        }
    }

    /// Read both streams and build the report.
    pub fn load(ref_path: &Path, mut_path: &Path) -> Result<Self, ResultStreamError> {
        let refs = read_records::<RefResult>(ref_path)?;
        let muts = read_records::<MutResult>(mut_path)?;
        let mut report = Self::from_records(&refs.records, &muts.records);
        report.malformed_lines = refs.malformed_lines + muts.malformed_lines;
        Ok(report)
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.4}")).unwrap_or_else(|| "-".to_string())
}

fn fmt_change(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:+.2}%", v * 100.0))
        .unwrap_or_else(|| "-".to_string())
}

fn status_label(status: Status) -> &'static str {
    match status {
        Status::Finish => "FINISH",
        Status::AbortCompile => "ABORT_COMPILE",
        Status::AbortExec => "ABORT_EXEC",
    }
}

/// Render the report in the requested format.
pub fn render_report(report: &ProfileReport, format: ReportFormat) -> Result<String, serde_json::Error> {
    match format {
        ReportFormat::Json => serde_json::to_string_pretty(report),
        ReportFormat::Markdown => {
            let summary = &report.summary;
            let mut out = String::from("# Literal Profile\n\n");
            out.push_str("## Summary\n\n| metric | count |\n|---|---:|\n");
            out.push_str(&format!("| batches | {} |\n", summary.batches));
            out.push_str(&format!("| mutations | {} |\n", summary.mutations));
            out.push_str(&format!("| finished | {} |\n", summary.finished));
            out.push_str(&format!("| abort compile | {} |\n", summary.abort_compile));
            out.push_str(&format!("| abort exec | {} |\n", summary.abort_exec));
            if report.malformed_lines > 0 {
                out.push_str(&format!("| malformed lines | {} |\n", report.malformed_lines));
            }

            for batch in &report.batches {
                out.push_str(&format!("\n## Batch {}\n\n", batch.batch_index));
                for path in &batch.paths {
                    out.push_str(&format!("- `{path}`\n"));
                }
                if let Some(reference) = batch.reference_mean {
                    out.push_str(&format!("- reference mean: {reference:.4}\n"));
                }
                out.push_str("\n| mutation | status | trials | mean | reference | change |\n");
                out.push_str("|---|---|---:|---:|---:|---:|\n");
                for m in &batch.mutations {
                    out.push_str(&format!(
                        "| {} | {} | {} | {} | {} | {} |\n",
                        m.mutation.join(" "),
                        status_label(m.status),
                        m.trials,
                        fmt_opt(m.mean),
                        fmt_opt(m.reference_mean),
                        fmt_change(m.relative_change),
                    ));
                }
            }
            Ok(out)
        }
    }
}
