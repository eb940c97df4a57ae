//! Output Builder: the latest-by-institution projection, the summary-by-year
//! aggregation, and the provenance record that makes the run trustworthy.
//!
//! Both derived tables are rebuilt wholesale from the long table on every
//! run; nothing is mutated incrementally.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::checksum;
use crate::config::PipelineConfig;
use crate::constants;
use crate::domain::{GradRateRecord, Sector, SourceFamily, SummaryRow};
use crate::error::{PipelineError, Result};
use crate::pipeline::enrich::MissingMetadataReport;
use crate::pipeline::parquet_out;
use crate::pipeline::provenance::{
    EnrichmentSummary, InputFileMeta, OutputFiles, ProvenanceRecord, RunContext, StageCounts,
};
use crate::pipeline::validate::{self, ValidationSummary};

/// Guard for the run-in-progress marker. Two runs against one output
/// directory are unsupported; the second fails fast on acquisition. The
/// marker is removed when the guard drops, so only a hard crash leaves it
/// behind for an operator to inspect.
pub struct RunMarker {
    path: PathBuf,
}

impl RunMarker {
    pub fn acquire(path: &Path, run_id: Uuid) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    PipelineError::RunInProgress(path.display().to_string())
                } else {
                    PipelineError::Io(e)
                }
            })?;
        let _ = writeln!(file, "{}", run_id);
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for RunMarker {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// One record per institution: the row with the greatest year, ties broken
/// toward official and then revised sources.
pub fn latest_by_institution(records: &[GradRateRecord]) -> Vec<GradRateRecord> {
    let mut latest: BTreeMap<i64, &GradRateRecord> = BTreeMap::new();
    for record in records {
        match latest.get(&record.unitid) {
            Some(current) if rank(current) >= rank(record) => {}
            _ => {
                latest.insert(record.unitid, record);
            }
        }
    }
    latest.into_values().cloned().collect()
}

fn rank(record: &GradRateRecord) -> (i32, bool, bool) {
    (
        record.year,
        record.source_flag == SourceFamily::Official,
        record.is_revised,
    )
}

/// Aggregate by (year, sector label). Rows without an enriched sector fall
/// into the `Unknown` bucket. Statistics run over non-null rates only;
/// `institution_count` is the number of distinct institutions contributing
/// a non-null rate, zero for all-null groups.
pub fn summary_by_year(records: &[GradRateRecord]) -> Vec<SummaryRow> {
    let mut groups: BTreeMap<(i32, &str), Vec<&GradRateRecord>> = BTreeMap::new();
    for record in records {
        let sector = record.sector.unwrap_or(Sector::Unknown).label();
        groups.entry((record.year, sector)).or_default().push(record);
    }

    groups
        .into_iter()
        .map(|((year, sector), members)| {
            let mut rates: Vec<f64> = members.iter().filter_map(|r| r.grad_rate_150).collect();
            rates.sort_by(|a, b| a.total_cmp(b));
            let contributing: BTreeSet<i64> = members
                .iter()
                .filter(|r| r.grad_rate_150.is_some())
                .map(|r| r.unitid)
                .collect();

            SummaryRow {
                year,
                sector: sector.to_string(),
                institution_count: contributing.len() as i64,
                avg_grad_rate: mean(&rates),
                median_grad_rate: quantile(&rates, 0.5),
                p25_grad_rate: quantile(&rates, 0.25),
                p75_grad_rate: quantile(&rates, 0.75),
            }
        })
        .collect()
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Linear-interpolation quantile over an ascending slice, matching the
/// aggregation the historical outputs were built with.
fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        Some(sorted[lo])
    } else {
        Some(sorted[lo] + (pos - lo as f64) * (sorted[hi] - sorted[lo]))
    }
}

/// Derive and write the output set. The provenance record goes out with
/// `completed: false` first and flips to `true` only after every table is
/// renamed into place, so a consumer can always tell a torn run apart.
pub fn build_outputs(
    config: &PipelineConfig,
    ctx: &RunContext,
    records: &[GradRateRecord],
    missing: &MissingMetadataReport,
    mut counts: StageCounts,
    validation: ValidationSummary,
    mut inputs: Vec<InputFileMeta>,
) -> Result<ProvenanceRecord> {
    let _marker = RunMarker::acquire(&config.run_marker_path(), ctx.run_id)?;

    validate::assert_referential(records, &missing.unitid_set())?;

    let latest = latest_by_institution(records);
    let distinct_unitids: BTreeSet<i64> = records.iter().map(|r| r.unitid).collect();
    validate::assert_completeness(latest.len(), distinct_unitids.len())?;

    let summary = summary_by_year(records);

    counts.long_rows = Some(records.len());
    counts.latest_rows = Some(latest.len());
    counts.summary_rows = Some(summary.len());

    let long_path = config.long_table_path();
    if long_path.exists() {
        upsert_input(
            &mut inputs,
            InputFileMeta {
                path: long_path.display().to_string(),
                sha256: checksum::sha256_file(&long_path)?,
            },
        );
    }

    let matched_institutions = records
        .iter()
        .filter(|r| r.control.is_some())
        .map(|r| r.unitid)
        .collect::<BTreeSet<i64>>()
        .len();

    let mut record = ProvenanceRecord {
        record_version: constants::PROVENANCE_RECORD_VERSION.to_string(),
        run_id: ctx.run_id,
        build_ts: Utc::now(),
        completed: false,
        inputs,
        counts,
        year_range: year_range(records),
        enrichment: EnrichmentSummary {
            matched_institutions,
            missing_count: missing.count,
            missing_unitids: missing.unitids.clone(),
        },
        validation,
        outputs: OutputFiles::default(),
    };

    let provenance_path = config.provenance_path();
    record.write(&provenance_path)?;

    parquet_out::write_long_table(&latest, &config.latest_table_path())?;
    parquet_out::write_summary_table(&summary, &config.summary_table_path())?;

    record.completed = true;
    record.write(&provenance_path)?;

    info!(
        latest_rows = latest.len(),
        summary_rows = summary.len(),
        run_id = %ctx.run_id,
        "built canonical outputs"
    );
    Ok(record)
}

fn year_range(records: &[GradRateRecord]) -> Option<(i32, i32)> {
    let min = records.iter().map(|r| r.year).min()?;
    let max = records.iter().map(|r| r.year).max()?;
    Some((min, max))
}

fn upsert_input(inputs: &mut Vec<InputFileMeta>, input: InputFileMeta) {
    match inputs.iter_mut().find(|i| i.path == input.path) {
        Some(existing) => existing.sha256 = input.sha256,
        None => inputs.push(input),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cohort_reference;
    use chrono::Utc;

    fn record(unitid: i64, year: i32, rate: Option<f64>) -> GradRateRecord {
        GradRateRecord {
            unitid,
            year,
            instnm: None,
            control: None,
            level: None,
            state: None,
            sector: Some(Sector::PublicFourYear),
            grad_rate_150: rate,
            source_flag: SourceFamily::Official,
            is_revised: false,
            cohort_reference: cohort_reference(year),
            load_ts: Utc::now(),
        }
    }

    #[test]
    fn latest_takes_the_maximum_year() {
        let records = vec![
            record(1, 2019, Some(40.0)),
            record(1, 2021, Some(50.0)),
            record(1, 2020, Some(45.0)),
            record(2, 2018, Some(30.0)),
        ];
        let latest = latest_by_institution(&records);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].unitid, 1);
        assert_eq!(latest[0].year, 2021);
        assert_eq!(latest[1].unitid, 2);
        assert_eq!(latest[1].year, 2018);
    }

    #[test]
    fn latest_ties_prefer_official_then_revised() {
        let mut fallback = record(1, 2020, Some(40.0));
        fallback.source_flag = SourceFamily::Fallback;
        let official = record(1, 2020, Some(41.0));
        let mut official_revised = record(1, 2020, Some(42.0));
        official_revised.is_revised = true;

        let latest = latest_by_institution(&[fallback.clone(), official.clone()]);
        assert_eq!(latest[0].source_flag, SourceFamily::Official);

        let latest = latest_by_institution(&[official, official_revised]);
        assert!(latest[0].is_revised);
    }

    #[test]
    fn quantiles_interpolate_linearly() {
        let values = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(quantile(&values, 0.5), Some(25.0));
        assert_eq!(quantile(&values, 0.25), Some(17.5));
        assert_eq!(quantile(&values, 0.75), Some(32.5));
        assert_eq!(quantile(&values, 0.0), Some(10.0));
        assert_eq!(quantile(&values, 1.0), Some(40.0));
        assert_eq!(quantile(&[], 0.5), None);
        assert_eq!(quantile(&[7.0], 0.25), Some(7.0));
    }

    #[test]
    fn summary_keeps_all_null_groups_with_zero_count() {
        let records = vec![
            record(1, 2020, Some(50.0)),
            record(2, 2020, Some(60.0)),
            record(3, 2021, None),
        ];
        let summary = summary_by_year(&records);
        assert_eq!(summary.len(), 2);

        let with_rates = &summary[0];
        assert_eq!(with_rates.year, 2020);
        assert_eq!(with_rates.institution_count, 2);
        assert_eq!(with_rates.avg_grad_rate, Some(55.0));
        assert_eq!(with_rates.median_grad_rate, Some(55.0));

        let all_null = &summary[1];
        assert_eq!(all_null.year, 2021);
        assert_eq!(all_null.institution_count, 0);
        assert_eq!(all_null.avg_grad_rate, None);
        assert_eq!(all_null.median_grad_rate, None);
        assert_eq!(all_null.p25_grad_rate, None);
        assert_eq!(all_null.p75_grad_rate, None);
    }

    #[test]
    fn summary_buckets_unenriched_rows_under_unknown() {
        let mut unenriched = record(5, 2020, Some(70.0));
        unenriched.sector = None;
        let summary = summary_by_year(&[unenriched]);
        assert_eq!(summary[0].sector, "Unknown");
    }

    #[test]
    fn marker_blocks_a_second_acquisition() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".run_in_progress");

        let first = RunMarker::acquire(&path, Uuid::new_v4()).unwrap();
        let second = RunMarker::acquire(&path, Uuid::new_v4());
        assert!(matches!(second, Err(PipelineError::RunInProgress(_))));

        drop(first);
        assert!(!path.exists());
        assert!(RunMarker::acquire(&path, Uuid::new_v4()).is_ok());
    }
}
