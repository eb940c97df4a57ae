//! Metadata Enricher: left-join institutional characteristics onto the
//! long table and map raw IPEDS codes into the closed enumerations.
//!
//! Institutions absent from the metadata extract keep their rates and null
//! categoricals; they are reported, never dropped.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::{Control, GradRateRecord, InstitutionRow, Level, Sector};
use crate::error::{PipelineError, Result};
use crate::pipeline::reader::InstitutionTable;
use crate::pipeline::validate::ValidationSummary;

/// Institutions in the long table with no row in the metadata extract.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MissingMetadataReport {
    pub count: usize,
    pub unitids: Vec<i64>,
}

impl MissingMetadataReport {
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Read a report written by a prior enrich step; a missing file means
    /// no misses were reported.
    pub fn read_or_empty(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn unitid_set(&self) -> HashSet<i64> {
        self.unitids.iter().copied().collect()
    }
}

/// Enrichment tallies for the stage receipt.
#[derive(Debug, Clone)]
pub struct EnrichOutcome {
    pub matched_institutions: usize,
    pub missing: MissingMetadataReport,
}

/// Attach name, state, and mapped control/level/sector to every record.
/// Codes outside the known mappings become `Unknown` and are counted; a
/// duplicate unitid in the metadata extract makes the join ambiguous and is
/// fatal.
pub fn enrich_records(
    records: &mut [GradRateRecord],
    institutions: &InstitutionTable,
    summary: &mut ValidationSummary,
) -> Result<EnrichOutcome> {
    let mut meta: HashMap<i64, &InstitutionRow> = HashMap::with_capacity(institutions.rows.len());
    for row in &institutions.rows {
        if meta.insert(row.unitid, row).is_some() {
            return Err(PipelineError::Validation(format!(
                "duplicate unitid {} in institutions extract; join must be many-to-one",
                row.unitid
            )));
        }
    }

    // Tally per institution, not per row-year, so the report and the
    // unknown-code counts are independent of how many years a school has.
    let referenced: BTreeSet<i64> = records.iter().map(|r| r.unitid).collect();
    let mut missing_ids: BTreeSet<i64> = BTreeSet::new();
    let mut matched = 0usize;
    for &unitid in &referenced {
        match meta.get(&unitid) {
            Some(row) => {
                matched += 1;
                if row.control_code.map(Control::from_code).unwrap_or(Control::Unknown)
                    == Control::Unknown
                {
                    summary.record_unknown_code("control", unitid, row.control_code);
                }
                if row.level_code.map(Level::from_code).unwrap_or(Level::Unknown) == Level::Unknown
                {
                    summary.record_unknown_code("level", unitid, row.level_code);
                }
                if row.sector_code.map(Sector::from_code).unwrap_or(Sector::Unknown)
                    == Sector::Unknown
                {
                    summary.record_unknown_code("sector", unitid, row.sector_code);
                }
            }
            None => {
                missing_ids.insert(unitid);
                summary.record_missing_metadata(unitid);
            }
        }
    }

    for record in records.iter_mut() {
        let Some(row) = meta.get(&record.unitid) else {
            continue;
        };
        record.control = Some(row.control_code.map(Control::from_code).unwrap_or(Control::Unknown));
        record.level = Some(row.level_code.map(Level::from_code).unwrap_or(Level::Unknown));
        record.sector = Some(row.sector_code.map(Sector::from_code).unwrap_or(Sector::Unknown));
        record.state = row.state.clone();
        if record.instnm.is_none() {
            record.instnm = row.name.clone();
        }
    }

    if !missing_ids.is_empty() {
        warn!(
            missing = missing_ids.len(),
            "institutions without metadata retained with null categoricals"
        );
    }
    info!(matched, missing = missing_ids.len(), "enriched long table");

    Ok(EnrichOutcome {
        matched_institutions: matched,
        missing: MissingMetadataReport {
            count: missing_ids.len(),
            unitids: missing_ids.into_iter().collect(),
        },
    })
}
