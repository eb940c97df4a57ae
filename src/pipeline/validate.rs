//! Cross-cutting data-quality checks.
//!
//! Recoverable findings accumulate into a [`ValidationSummary`] that travels
//! with stage receipts and the provenance record. Invariant breaches that
//! mean the pipeline itself misbehaved (duplicate resolutions, latest-table
//! undercount, unreported metadata misses) are fatal and surface as
//! [`PipelineError::Validation`].

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::domain::GradRateRecord;
use crate::error::{PipelineError, Result};

pub const RATE_MIN: f64 = 0.0;
pub const RATE_MAX: f64 = 100.0;

/// Issue details kept per serialized summary. Counts are always exact;
/// only the per-issue detail list is capped.
const MAX_ISSUE_DETAILS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCheck {
    Range,
    Uniqueness,
    Referential,
    Completeness,
    EntityId,
    CategoryCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationSeverity {
    Warning,
    Error,
}

/// One recoverable data-quality finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub check: ValidationCheck,
    pub severity: ValidationSeverity,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unitid: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
}

/// Aggregated recoverable findings for one stage or one whole run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub out_of_range: usize,
    pub dropped_rows: usize,
    pub missing_metadata: usize,
    pub unknown_control_codes: usize,
    pub unknown_level_codes: usize,
    pub unknown_sector_codes: usize,
    pub total_issues: usize,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationSummary {
    pub fn record(&mut self, issue: ValidationIssue) {
        self.total_issues += 1;
        if self.issues.len() < MAX_ISSUE_DETAILS {
            self.issues.push(issue);
        }
    }

    pub fn record_out_of_range(&mut self, unitid: i64, year: i32, value: f64) {
        self.out_of_range += 1;
        self.record(ValidationIssue {
            check: ValidationCheck::Range,
            severity: ValidationSeverity::Warning,
            detail: format!("grad_rate_150 {} outside [{}, {}], nulled", value, RATE_MIN, RATE_MAX),
            unitid: Some(unitid),
            year: Some(year),
        });
    }

    pub fn record_dropped_rows(&mut self, file: &str, count: usize) {
        if count == 0 {
            return;
        }
        self.dropped_rows += count;
        self.record(ValidationIssue {
            check: ValidationCheck::EntityId,
            severity: ValidationSeverity::Warning,
            detail: format!("{} rows with unparsable UnitID dropped from {}", count, file),
            unitid: None,
            year: None,
        });
    }

    pub fn record_missing_metadata(&mut self, unitid: i64) {
        self.missing_metadata += 1;
        self.record(ValidationIssue {
            check: ValidationCheck::Referential,
            severity: ValidationSeverity::Warning,
            detail: "no institutional metadata for unitid".to_string(),
            unitid: Some(unitid),
            year: None,
        });
    }

    pub fn record_unknown_code(&mut self, field: &str, unitid: i64, code: Option<i64>) {
        match field {
            "control" => self.unknown_control_codes += 1,
            "level" => self.unknown_level_codes += 1,
            _ => self.unknown_sector_codes += 1,
        }
        let rendered = code.map(|c| c.to_string()).unwrap_or_else(|| "blank".to_string());
        self.record(ValidationIssue {
            check: ValidationCheck::CategoryCode,
            severity: ValidationSeverity::Warning,
            detail: format!("unknown {} code {}, mapped to Unknown", field, rendered),
            unitid: Some(unitid),
            year: None,
        });
    }

    /// Fold another summary into this one. Issue details stay capped.
    pub fn merge(&mut self, other: &ValidationSummary) {
        self.out_of_range += other.out_of_range;
        self.dropped_rows += other.dropped_rows;
        self.missing_metadata += other.missing_metadata;
        self.unknown_control_codes += other.unknown_control_codes;
        self.unknown_level_codes += other.unknown_level_codes;
        self.unknown_sector_codes += other.unknown_sector_codes;
        self.total_issues += other.total_issues;
        for issue in &other.issues {
            if self.issues.len() >= MAX_ISSUE_DETAILS {
                break;
            }
            self.issues.push(issue.clone());
        }
    }

    pub fn is_clean(&self) -> bool {
        self.total_issues == 0
    }
}

/// Range invariant for resolved rates.
pub fn rate_in_range(rate: f64) -> bool {
    (RATE_MIN..=RATE_MAX).contains(&rate)
}

/// Uniqueness invariant: no two rows share
/// (unitid, year, cohort_reference, source_flag). A duplicate means the
/// precedence resolver emitted two winners for one logical measurement,
/// which is a pipeline bug rather than a data-quality finding.
pub fn assert_unique(records: &[GradRateRecord]) -> Result<()> {
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        let key = (
            record.unitid,
            record.year,
            record.cohort_reference.as_str(),
            record.source_flag,
        );
        if !seen.insert(key) {
            return Err(PipelineError::Validation(format!(
                "duplicate resolution for unitid {} year {} source {}",
                record.unitid,
                record.year,
                record.source_flag.label()
            )));
        }
    }
    Ok(())
}

/// Referential invariant: every record either carries enriched metadata or
/// its unitid appears in the missing-metadata report.
pub fn assert_referential(records: &[GradRateRecord], reported_missing: &HashSet<i64>) -> Result<()> {
    for record in records {
        if record.control.is_none() && !reported_missing.contains(&record.unitid) {
            return Err(PipelineError::Validation(format!(
                "unitid {} has no metadata and is absent from the missing-metadata report",
                record.unitid
            )));
        }
    }
    Ok(())
}

/// Completeness invariant: the latest projection covers every institution
/// exactly once.
pub fn assert_completeness(latest_rows: usize, distinct_unitids: usize) -> Result<()> {
    if latest_rows != distinct_unitids {
        return Err(PipelineError::Validation(format!(
            "latest-by-institution has {} rows but the long table has {} distinct unitids",
            latest_rows, distinct_unitids
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{cohort_reference, SourceFamily};
    use chrono::Utc;

    fn record(unitid: i64, year: i32, source_flag: SourceFamily) -> GradRateRecord {
        GradRateRecord {
            unitid,
            year,
            instnm: None,
            control: None,
            level: None,
            state: None,
            sector: None,
            grad_rate_150: Some(50.0),
            source_flag,
            is_revised: false,
            cohort_reference: cohort_reference(year),
            load_ts: Utc::now(),
        }
    }

    #[test]
    fn range_bounds_are_inclusive() {
        assert!(rate_in_range(0.0));
        assert!(rate_in_range(100.0));
        assert!(!rate_in_range(-0.1));
        assert!(!rate_in_range(100.1));
    }

    #[test]
    fn duplicate_resolution_is_fatal() {
        let records = vec![record(1, 2020, SourceFamily::Official), record(1, 2020, SourceFamily::Official)];
        assert!(assert_unique(&records).is_err());
    }

    #[test]
    fn same_year_different_family_is_distinct() {
        let records = vec![record(1, 2020, SourceFamily::Official), record(1, 2020, SourceFamily::Fallback)];
        assert!(assert_unique(&records).is_ok());
    }

    #[test]
    fn unreported_metadata_miss_is_fatal() {
        let records = vec![record(7, 2020, SourceFamily::Official)];
        let err = assert_referential(&records, &HashSet::new()).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));

        let reported: HashSet<i64> = [7].into_iter().collect();
        assert!(assert_referential(&records, &reported).is_ok());
    }

    #[test]
    fn issue_details_are_capped_but_counts_exact() {
        let mut summary = ValidationSummary::default();
        for i in 0..200 {
            summary.record_out_of_range(i, 2020, 120.0);
        }
        assert_eq!(summary.out_of_range, 200);
        assert_eq!(summary.total_issues, 200);
        assert!(summary.issues.len() <= 50);
    }

    #[test]
    fn merge_sums_counts() {
        let mut a = ValidationSummary::default();
        a.record_dropped_rows("wide.csv", 2);
        let mut b = ValidationSummary::default();
        b.record_missing_metadata(5);
        b.record_unknown_code("sector", 5, Some(42));

        a.merge(&b);
        assert_eq!(a.dropped_rows, 2);
        assert_eq!(a.missing_metadata, 1);
        assert_eq!(a.unknown_sector_codes, 1);
        assert_eq!(a.total_issues, 3);
    }
}
