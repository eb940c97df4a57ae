//! Wide Source Reader: delimited extracts into typed in-memory tables.
//!
//! Pure I/O and type coercion. Rows whose entity id does not parse as an
//! integer are dropped and counted; nothing else is transformed here.

use std::path::Path;

use tracing::warn;

use crate::domain::InstitutionRow;
use crate::error::{PipelineError, Result};

const UNIT_ID_COL: &str = "UnitID";
const INST_NAME_COL: &str = "Institution Name";
const STATE_COL: &str = "STATE";
const LEVEL_COL: &str = "LEVEL";
const CONTROL_COL: &str = "CONTROL";
const SECTOR_COL: &str = "SECTOR";

/// The wide graduation-rate extract, value columns still keyed by raw header.
#[derive(Debug, Clone)]
pub struct WideTable {
    pub unitids: Vec<i64>,
    pub names: Vec<Option<String>>,
    pub columns: Vec<WideValueColumn>,
    pub rows_read: usize,
    pub dropped_rows: usize,
}

/// One non-id column of the wide extract, cells coerced to numbers.
/// Empty or non-numeric cells become `None`, matching the source exports
/// where suppressed values arrive as blanks or footnote markers.
#[derive(Debug, Clone)]
pub struct WideValueColumn {
    pub header: String,
    pub values: Vec<Option<f64>>,
}

/// The institutional-characteristics extract, codes left raw.
#[derive(Debug, Clone)]
pub struct InstitutionTable {
    pub rows: Vec<InstitutionRow>,
    pub rows_read: usize,
    pub dropped_rows: usize,
}

pub fn read_wide_extract(path: &Path) -> Result<WideTable> {
    if !path.exists() {
        return Err(PipelineError::MissingInput(format!(
            "wide extract not found: {}",
            path.display()
        )));
    }

    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;

    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
    let unitid_idx = require_column(&headers, UNIT_ID_COL, path)?;
    let name_idx = require_column(&headers, INST_NAME_COL, path)?;

    let value_indices: Vec<usize> = (0..headers.len())
        .filter(|&i| i != unitid_idx && i != name_idx)
        .collect();

    let mut table = WideTable {
        unitids: Vec::new(),
        names: Vec::new(),
        columns: value_indices
            .iter()
            .map(|&i| WideValueColumn {
                header: headers[i].clone(),
                values: Vec::new(),
            })
            .collect(),
        rows_read: 0,
        dropped_rows: 0,
    };

    for record in reader.records() {
        let record = record?;
        table.rows_read += 1;

        let unitid = match parse_int(record.get(unitid_idx)) {
            Some(id) => id,
            None => {
                table.dropped_rows += 1;
                continue;
            }
        };

        table.unitids.push(unitid);
        table.names.push(parse_string(record.get(name_idx)));
        for (slot, &idx) in table.columns.iter_mut().zip(&value_indices) {
            slot.values.push(parse_float(record.get(idx)));
        }
    }

    if table.dropped_rows > 0 {
        warn!(
            dropped = table.dropped_rows,
            file = %path.display(),
            "dropped wide rows with unparsable UnitID"
        );
    }

    Ok(table)
}

pub fn read_institution_extract(path: &Path) -> Result<InstitutionTable> {
    if !path.exists() {
        return Err(PipelineError::MissingInput(format!(
            "institutions extract not found: {}",
            path.display()
        )));
    }

    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;

    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
    let unitid_idx = require_column(&headers, UNIT_ID_COL, path)?;
    let state_idx = require_column(&headers, STATE_COL, path)?;
    let level_idx = require_column(&headers, LEVEL_COL, path)?;
    let control_idx = require_column(&headers, CONTROL_COL, path)?;
    let sector_idx = require_column(&headers, SECTOR_COL, path)?;
    // Name is optional here; the wide extract is the primary source for it.
    let name_idx = headers.iter().position(|h| h == INST_NAME_COL);

    let mut table = InstitutionTable {
        rows: Vec::new(),
        rows_read: 0,
        dropped_rows: 0,
    };

    for record in reader.records() {
        let record = record?;
        table.rows_read += 1;

        let unitid = match parse_int(record.get(unitid_idx)) {
            Some(id) => id,
            None => {
                table.dropped_rows += 1;
                continue;
            }
        };

        table.rows.push(InstitutionRow {
            unitid,
            name: name_idx.and_then(|i| parse_string(record.get(i))),
            state: parse_string(record.get(state_idx)),
            control_code: parse_int(record.get(control_idx)),
            level_code: parse_int(record.get(level_idx)),
            sector_code: parse_int(record.get(sector_idx)),
        });
    }

    if table.dropped_rows > 0 {
        warn!(
            dropped = table.dropped_rows,
            file = %path.display(),
            "dropped institution rows with unparsable UnitID"
        );
    }

    Ok(table)
}

fn require_column(headers: &[String], name: &str, path: &Path) -> Result<usize> {
    headers
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| PipelineError::MissingColumn {
            column: name.to_string(),
            file: path.display().to_string(),
        })
}

fn parse_int(cell: Option<&str>) -> Option<i64> {
    cell.map(str::trim).filter(|s| !s.is_empty())?.parse().ok()
}

fn parse_float(cell: Option<&str>) -> Option<f64> {
    cell.map(str::trim).filter(|s| !s.is_empty())?.parse().ok()
}

fn parse_string(cell: Option<&str>) -> Option<String> {
    let trimmed = cell.map(str::trim).filter(|s| !s.is_empty())?;
    Some(trimmed.to_string())
}
