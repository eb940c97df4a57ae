//! The three ordered build steps. Each step reads its inputs from disk and
//! appends a receipt to the run log, so the steps can run in one process
//! (`run`) or as separate invocations with the same provenance trail.

pub mod build;
pub mod columns;
pub mod enrich;
pub mod extract;
pub mod parquet_out;
pub mod provenance;
pub mod reader;
pub mod validate;

use chrono::Utc;
use tracing::info;

use crate::checksum;
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::pipeline::enrich::MissingMetadataReport;
use crate::pipeline::provenance::{
    InputFileMeta, ProvenanceRecord, RunContext, Stage, StageCounts, StageReceipt,
};
use crate::pipeline::validate::ValidationSummary;

/// Extraction step: wide extract → canonical long table (pre-enrichment).
/// Starts a fresh run log.
pub fn run_extract(config: &PipelineConfig, ctx: &RunContext) -> Result<StageReceipt> {
    let wide_path = &config.inputs.wide_csv;
    let table = reader::read_wide_extract(wide_path)?;

    let mut validation = ValidationSummary::default();
    validation.record_dropped_rows(&wide_path.display().to_string(), table.dropped_rows);

    let records = extract::wide_to_long(&table, ctx.load_ts, &mut validation)?;
    parquet_out::write_long_table(&records, &config.long_table_path())?;

    let receipt = StageReceipt {
        run_id: ctx.run_id,
        stage: Stage::Extract,
        recorded_at: Utc::now(),
        inputs: vec![InputFileMeta {
            path: wide_path.display().to_string(),
            sha256: checksum::sha256_file(wide_path)?,
        }],
        counts: StageCounts {
            wide_rows: Some(table.rows_read),
            dropped_rows: Some(table.dropped_rows),
            long_rows: Some(records.len()),
            ..StageCounts::default()
        },
        validation,
    };
    provenance::start_run_log(&config.run_log_path())?;
    provenance::append_receipt(&config.run_log_path(), &receipt)?;

    info!(stage = "extract", rows = records.len(), "stage complete");
    Ok(receipt)
}

/// Enrichment step: rewrites the long table with institutional metadata and
/// writes the missing-metadata report.
pub fn run_enrich(config: &PipelineConfig, ctx: &RunContext) -> Result<StageReceipt> {
    let institutions_path = &config.inputs.institutions_csv;
    let mut records = parquet_out::read_long_table(&config.long_table_path())?;
    let institutions = reader::read_institution_extract(institutions_path)?;

    let mut validation = ValidationSummary::default();
    validation.record_dropped_rows(
        &institutions_path.display().to_string(),
        institutions.dropped_rows,
    );

    let outcome = enrich::enrich_records(&mut records, &institutions, &mut validation)?;
    parquet_out::write_long_table(&records, &config.long_table_path())?;
    outcome.missing.write(&config.missing_metadata_path())?;

    let receipt = StageReceipt {
        run_id: ctx.run_id,
        stage: Stage::Enrich,
        recorded_at: Utc::now(),
        inputs: vec![InputFileMeta {
            path: institutions_path.display().to_string(),
            sha256: checksum::sha256_file(institutions_path)?,
        }],
        counts: StageCounts {
            enriched_rows: Some(records.len()),
            ..StageCounts::default()
        },
        validation,
    };
    provenance::append_receipt(&config.run_log_path(), &receipt)?;

    info!(
        stage = "enrich",
        matched = outcome.matched_institutions,
        missing = outcome.missing.count,
        "stage complete"
    );
    Ok(receipt)
}

/// Build step: derives the latest and summary tables and writes the
/// provenance record for the whole run.
pub fn run_build(config: &PipelineConfig, ctx: &RunContext) -> Result<ProvenanceRecord> {
    let records = parquet_out::read_long_table(&config.long_table_path())?;
    let missing = MissingMetadataReport::read_or_empty(&config.missing_metadata_path())?;

    // Fold only the upstream receipts; a build receipt already carries the
    // merged totals and folding it back in would double-count them.
    let receipts = provenance::read_receipts(&config.run_log_path())?;
    let upstream: Vec<_> = provenance::latest_per_stage(&receipts)
        .into_iter()
        .filter(|r| r.stage != Stage::Build)
        .collect();
    let (counts, validation, inputs) = provenance::fold_receipts(&upstream);

    let record = build::build_outputs(config, ctx, &records, &missing, counts, validation, inputs)?;

    let receipt = StageReceipt {
        run_id: ctx.run_id,
        stage: Stage::Build,
        recorded_at: Utc::now(),
        inputs: Vec::new(),
        counts: StageCounts {
            latest_rows: record.counts.latest_rows,
            summary_rows: record.counts.summary_rows,
            ..StageCounts::default()
        },
        validation: ValidationSummary::default(),
    };
    provenance::append_receipt(&config.run_log_path(), &receipt)?;

    info!(stage = "build", run_id = %ctx.run_id, "stage complete");
    Ok(record)
}

/// All three steps with one run context.
pub fn run_all(config: &PipelineConfig, ctx: &RunContext) -> Result<ProvenanceRecord> {
    run_extract(config, ctx)?;
    run_enrich(config, ctx)?;
    run_build(config, ctx)
}
