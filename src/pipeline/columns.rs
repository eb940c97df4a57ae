//! Header parsing for the wide IPEDS extracts.
//!
//! Wide column names encode the source table, cohort year, and revision
//! status in a trailing parenthesized tag, e.g.
//! `"Graduation rate, total cohort (DRVGR2021_RV)"`. Downstream logic never
//! touches the raw strings; it works on the parsed [`SourceColumn`] key.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::SourceFamily;

static SOURCE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((DRVGR|DFR)(\d{4})(_RV)?\)").unwrap());

/// Parsed identity of one wide value column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceColumn {
    pub family: SourceFamily,
    pub year: i32,
    pub revised: bool,
}

/// Parse a wide header into its source key. Headers without a DRVGR/DFR tag
/// (id columns, stray exports) return `None` and are ignored upstream.
pub fn parse_header(header: &str) -> Option<SourceColumn> {
    let caps = SOURCE_PATTERN.captures(header)?;
    let family = match caps.get(1).map(|m| m.as_str()) {
        Some("DRVGR") => SourceFamily::Official,
        Some("DFR") => SourceFamily::Fallback,
        _ => return None,
    };
    let year: i32 = caps.get(2)?.as_str().parse().ok()?;
    Some(SourceColumn {
        family,
        year,
        revised: caps.get(3).is_some(),
    })
}
