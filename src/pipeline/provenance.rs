//! Run provenance: stage receipts, the run log, and the final record.
//!
//! Every stage appends one receipt line to `run_log.ndjson` (the extract
//! stage starts the log over, marking a new run). The build stage folds the
//! receipts into a single immutable [`ProvenanceRecord`] whose `completed`
//! flag is the consumer's authority on whether the output set is trustworthy.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants;
use crate::error::Result;
use crate::pipeline::validate::ValidationSummary;

/// Per-run state threaded Reader → Extractor → Enricher → Builder.
/// Nothing run-scoped lives outside this struct.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Timestamp stamped into every materialized row; pinned via config for
    /// reproducible outputs, otherwise the run's wall clock.
    pub load_ts: DateTime<Utc>,
}

impl RunContext {
    pub fn new(pinned_load_ts: Option<DateTime<Utc>>) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            load_ts: pinned_load_ts.unwrap_or(now),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Extract,
    Enrich,
    Build,
}

/// An input file identity captured for the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputFileMeta {
    pub path: String,
    pub sha256: String,
}

/// Row counts observed by a stage. Stages fill only what they saw.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageCounts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wide_rows: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dropped_rows: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_rows: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enriched_rows: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_rows: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_rows: Option<usize>,
}

impl StageCounts {
    /// Overlay counts from a later stage; present values win.
    pub fn merge(&mut self, other: &StageCounts) {
        if other.wide_rows.is_some() {
            self.wide_rows = other.wide_rows;
        }
        if other.dropped_rows.is_some() {
            self.dropped_rows = other.dropped_rows;
        }
        if other.long_rows.is_some() {
            self.long_rows = other.long_rows;
        }
        if other.enriched_rows.is_some() {
            self.enriched_rows = other.enriched_rows;
        }
        if other.latest_rows.is_some() {
            self.latest_rows = other.latest_rows;
        }
        if other.summary_rows.is_some() {
            self.summary_rows = other.summary_rows;
        }
    }
}

/// One stage's audit line in the run log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReceipt {
    pub run_id: Uuid,
    pub stage: Stage,
    pub recorded_at: DateTime<Utc>,
    pub inputs: Vec<InputFileMeta>,
    pub counts: StageCounts,
    pub validation: ValidationSummary,
}

/// Truncate the run log; the extract stage calls this to mark a new run.
pub fn start_run_log(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, b"")?;
    Ok(())
}

/// Append one receipt as a JSON line.
pub fn append_receipt(path: &Path, receipt: &StageReceipt) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(receipt)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

/// Read every receipt in the log; a missing log reads as empty.
pub fn read_receipts(path: &Path) -> Result<Vec<StageReceipt>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)?;
    let mut receipts = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        receipts.push(serde_json::from_str(line)?);
    }
    Ok(receipts)
}

/// Keep only the newest receipt per stage, in pipeline order. A stage rerun
/// supersedes its earlier line, so folding never double-counts.
pub fn latest_per_stage(receipts: &[StageReceipt]) -> Vec<StageReceipt> {
    [Stage::Extract, Stage::Enrich, Stage::Build]
        .into_iter()
        .filter_map(|stage| receipts.iter().rev().find(|r| r.stage == stage).cloned())
        .collect()
}

/// Fold stage receipts into merged counts, validation, and input set.
pub fn fold_receipts(
    receipts: &[StageReceipt],
) -> (StageCounts, ValidationSummary, Vec<InputFileMeta>) {
    let mut counts = StageCounts::default();
    let mut validation = ValidationSummary::default();
    let mut inputs: Vec<InputFileMeta> = Vec::new();
    for receipt in receipts {
        counts.merge(&receipt.counts);
        validation.merge(&receipt.validation);
        for input in &receipt.inputs {
            match inputs.iter_mut().find(|i| i.path == input.path) {
                Some(existing) => existing.sha256 = input.sha256.clone(),
                None => inputs.push(input.clone()),
            }
        }
    }
    (counts, validation, inputs)
}

/// Enrichment outcome surfaced in the provenance record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichmentSummary {
    pub matched_institutions: usize,
    pub missing_count: usize,
    pub missing_unitids: Vec<i64>,
}

/// Names of the table files this run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputFiles {
    pub long: String,
    pub latest: String,
    pub summary: String,
}

impl Default for OutputFiles {
    fn default() -> Self {
        Self {
            long: constants::LONG_TABLE_FILE.to_string(),
            latest: constants::LATEST_TABLE_FILE.to_string(),
            summary: constants::SUMMARY_TABLE_FILE.to_string(),
        }
    }
}

/// The immutable audit artifact for one pipeline run. Written with
/// `completed: false` before the tables go out and rewritten with
/// `completed: true` only after every table is in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub record_version: String,
    pub run_id: Uuid,
    pub build_ts: DateTime<Utc>,
    pub completed: bool,
    pub inputs: Vec<InputFileMeta>,
    pub counts: StageCounts,
    /// Min and max cohort year present in the long table.
    pub year_range: Option<(i32, i32)>,
    pub enrichment: EnrichmentSummary,
    pub validation: ValidationSummary,
    pub outputs: OutputFiles,
}

impl ProvenanceRecord {
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
