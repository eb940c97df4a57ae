//! Extractor: wide annual columns into canonical long rows.
//!
//! Competing source columns for one cohort year are resolved through an
//! explicit ordered ladder, never through merge order. The resolver is a
//! pure function over candidate cells so the policy is testable without I/O.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::domain::{cohort_reference, GradRateRecord, SourceFamily};
use crate::error::{PipelineError, Result};
use crate::pipeline::columns::{parse_header, SourceColumn};
use crate::pipeline::reader::WideTable;
use crate::pipeline::validate::{self, ValidationSummary};

/// Resolution order for competing source columns of one cohort year:
/// official revised, official, fallback revised, fallback. An official value
/// beats a fallback value even when the fallback shipped later; that policy
/// is intentionally conservative.
pub const PRECEDENCE: [(SourceFamily, bool); 4] = [
    (SourceFamily::Official, true),
    (SourceFamily::Official, false),
    (SourceFamily::Fallback, true),
    (SourceFamily::Fallback, false),
];

/// One candidate cell for a given (institution, year). `value` is `None`
/// when the column exists but the cell is blank or non-numeric.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub family: SourceFamily,
    pub revised: bool,
    pub value: Option<f64>,
}

/// Walk the precedence ladder and return the first candidate carrying a
/// value. A blank cell does not win its rung; the year is absent only when
/// every rung is empty.
pub fn resolve_year(candidates: &[Candidate]) -> Option<(SourceFamily, bool, f64)> {
    for (family, revised) in PRECEDENCE {
        let hit = candidates
            .iter()
            .find(|c| c.family == family && c.revised == revised)
            .and_then(|c| c.value);
        if let Some(value) = hit {
            return Some((family, revised, value));
        }
    }
    None
}

/// Reshape the wide table into one long row per resolved
/// (institution, cohort year). Out-of-range winners keep their row with the
/// rate nulled; absent years emit nothing.
pub fn wide_to_long(
    table: &WideTable,
    load_ts: DateTime<Utc>,
    summary: &mut ValidationSummary,
) -> Result<Vec<GradRateRecord>> {
    let mut by_key: HashMap<SourceColumn, usize> = HashMap::new();
    for (idx, column) in table.columns.iter().enumerate() {
        let Some(key) = parse_header(&column.header) else {
            continue;
        };
        if by_key.insert(key, idx).is_some() {
            return Err(PipelineError::Validation(format!(
                "ambiguous wide schema: multiple {}{}{} columns",
                key.family.table_prefix(),
                key.year,
                if key.revised { "_RV" } else { "" }
            )));
        }
    }
    if by_key.is_empty() {
        return Err(PipelineError::NoSourceColumns);
    }

    let mut years: Vec<i32> = by_key.keys().map(|k| k.year).collect();
    years.sort_unstable();
    years.dedup();

    let mut records = Vec::new();
    for (row, &unitid) in table.unitids.iter().enumerate() {
        for &year in &years {
            let candidates: Vec<Candidate> = PRECEDENCE
                .iter()
                .filter_map(|&(family, revised)| {
                    let key = SourceColumn { family, year, revised };
                    by_key.get(&key).map(|&idx| Candidate {
                        family,
                        revised,
                        value: table.columns[idx].values[row],
                    })
                })
                .collect();

            let Some((source_flag, is_revised, value)) = resolve_year(&candidates) else {
                continue;
            };

            let grad_rate_150 = if validate::rate_in_range(value) {
                Some(value)
            } else {
                summary.record_out_of_range(unitid, year, value);
                None
            };

            records.push(GradRateRecord {
                unitid,
                year,
                instnm: table.names[row].clone(),
                control: None,
                level: None,
                state: None,
                sector: None,
                grad_rate_150,
                source_flag,
                is_revised,
                cohort_reference: cohort_reference(year),
                load_ts,
            });
        }
    }

    records.sort_by(|a, b| (a.unitid, a.year).cmp(&(b.unitid, b.year)));
    validate::assert_unique(&records)?;

    info!(
        long_rows = records.len(),
        years = years.len(),
        institutions = table.unitids.len(),
        "extracted canonical long rows"
    );
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::reader::WideValueColumn;
    use chrono::Utc;

    fn candidate(family: SourceFamily, revised: bool, value: Option<f64>) -> Candidate {
        Candidate { family, revised, value }
    }

    #[test]
    fn official_revised_wins_over_everything() {
        let resolved = resolve_year(&[
            candidate(SourceFamily::Fallback, false, Some(50.0)),
            candidate(SourceFamily::Official, false, Some(55.0)),
            candidate(SourceFamily::Official, true, Some(58.0)),
        ]);
        assert_eq!(resolved, Some((SourceFamily::Official, true, 58.0)));
    }

    #[test]
    fn official_beats_fallback_regardless_of_candidate_order() {
        let forward = resolve_year(&[
            candidate(SourceFamily::Official, false, Some(55.0)),
            candidate(SourceFamily::Fallback, false, Some(50.0)),
        ]);
        let reversed = resolve_year(&[
            candidate(SourceFamily::Fallback, false, Some(50.0)),
            candidate(SourceFamily::Official, false, Some(55.0)),
        ]);
        assert_eq!(forward, Some((SourceFamily::Official, false, 55.0)));
        assert_eq!(reversed, forward);
    }

    #[test]
    fn blank_official_cell_falls_through_to_fallback() {
        let resolved = resolve_year(&[
            candidate(SourceFamily::Official, false, None),
            candidate(SourceFamily::Fallback, true, Some(40.0)),
        ]);
        assert_eq!(resolved, Some((SourceFamily::Fallback, true, 40.0)));
    }

    #[test]
    fn all_blank_means_absent() {
        let resolved = resolve_year(&[
            candidate(SourceFamily::Official, false, None),
            candidate(SourceFamily::Fallback, false, None),
        ]);
        assert_eq!(resolved, None);
        assert_eq!(resolve_year(&[]), None);
    }

    fn wide_table(headers_and_cells: Vec<(&str, Vec<Option<f64>>)>, unitids: Vec<i64>) -> WideTable {
        WideTable {
            names: unitids.iter().map(|_| Some("Test U".to_string())).collect(),
            unitids,
            columns: headers_and_cells
                .into_iter()
                .map(|(h, values)| WideValueColumn {
                    header: h.to_string(),
                    values,
                })
                .collect(),
            rows_read: 1,
            dropped_rows: 0,
        }
    }

    #[test]
    fn revised_value_and_flag_survive_reshape() {
        let table = wide_table(
            vec![
                ("Rate (DRVGR2020)", vec![Some(55.0)]),
                ("Rate (DRVGR2020_RV)", vec![Some(58.0)]),
                ("Rate (DFR2020)", vec![Some(50.0)]),
            ],
            vec![1],
        );

        let mut summary = ValidationSummary::default();
        let records = wide_to_long(&table, Utc::now(), &mut summary).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].grad_rate_150, Some(58.0));
        assert_eq!(records[0].source_flag, SourceFamily::Official);
        assert!(records[0].is_revised);
        assert_eq!(records[0].cohort_reference, "2020 cohort, total cohort");
    }

    #[test]
    fn absent_year_emits_no_row() {
        let table = wide_table(
            vec![
                ("Rate (DRVGR2018)", vec![None]),
                ("Rate (DRVGR2019)", vec![Some(60.0)]),
            ],
            vec![3],
        );

        let mut summary = ValidationSummary::default();
        let records = wide_to_long(&table, Utc::now(), &mut summary).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].year, 2019);
    }

    #[test]
    fn out_of_range_winner_is_nulled_not_clamped() {
        let table = wide_table(
            vec![
                ("Rate (DRVGR2020)", vec![Some(120.0)]),
                ("Rate (DFR2020)", vec![Some(50.0)]),
            ],
            vec![4],
        );

        let mut summary = ValidationSummary::default();
        let records = wide_to_long(&table, Utc::now(), &mut summary).unwrap();
        // The official column still wins the year; its value is rejected.
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source_flag, SourceFamily::Official);
        assert_eq!(records[0].grad_rate_150, None);
        assert_eq!(summary.out_of_range, 1);
    }

    #[test]
    fn duplicate_source_columns_are_a_fatal_schema_error() {
        let table = wide_table(
            vec![
                ("Rate, total (DRVGR2020)", vec![Some(10.0)]),
                ("Rate, men (DRVGR2020)", vec![Some(20.0)]),
            ],
            vec![5],
        );

        let mut summary = ValidationSummary::default();
        let err = wide_to_long(&table, Utc::now(), &mut summary).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn no_source_columns_is_fatal() {
        let table = wide_table(vec![("Enrollment", vec![Some(10.0)])], vec![6]);
        let mut summary = ValidationSummary::default();
        let err = wide_to_long(&table, Utc::now(), &mut summary).unwrap_err();
        assert!(matches!(err, PipelineError::NoSourceColumns));
    }
}
