//! Fixed names of the files the pipeline owns inside the processed directory.

pub const LONG_TABLE_FILE: &str = "ipeds_grad_rates_long.parquet";
pub const LATEST_TABLE_FILE: &str = "ipeds_grad_rates_latest_by_inst.parquet";
pub const SUMMARY_TABLE_FILE: &str = "ipeds_grad_rates_summary_by_year.parquet";
pub const PROVENANCE_FILE: &str = "run_provenance.json";
pub const MISSING_METADATA_FILE: &str = "missing_metadata.json";
pub const RUN_LOG_FILE: &str = "run_log.ndjson";
pub const RUN_MARKER_FILE: &str = ".run_in_progress";

/// Version tag stamped into every provenance record.
pub const PROVENANCE_RECORD_VERSION: &str = "1.0.0";
