use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which IPEDS source table family produced a resolved rate.
///
/// `Official` is the derived graduation-rate table (DRVGR); `Fallback` is the
/// frozen survey table (DFR). Official wins whenever both carry a value for
/// the same cohort year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFamily {
    Official,
    Fallback,
}

impl SourceFamily {
    pub fn label(&self) -> &'static str {
        match self {
            SourceFamily::Official => "official",
            SourceFamily::Fallback => "fallback",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "official" => Some(SourceFamily::Official),
            "fallback" => Some(SourceFamily::Fallback),
            _ => None,
        }
    }

    /// The table prefix this family uses in wide column headers.
    pub fn table_prefix(&self) -> &'static str {
        match self {
            SourceFamily::Official => "DRVGR",
            SourceFamily::Fallback => "DFR",
        }
    }
}

/// Institutional control, mapped from the IPEDS CONTROL code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Control {
    Public,
    PrivateNonprofit,
    PrivateForProfit,
    Unknown,
}

impl Control {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Control::Public,
            2 => Control::PrivateNonprofit,
            3 => Control::PrivateForProfit,
            _ => Control::Unknown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Control::Public => "Public",
            Control::PrivateNonprofit => "Private nonprofit",
            Control::PrivateForProfit => "Private for-profit",
            Control::Unknown => "Unknown",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "Public" => Some(Control::Public),
            "Private nonprofit" => Some(Control::PrivateNonprofit),
            "Private for-profit" => Some(Control::PrivateForProfit),
            "Unknown" => Some(Control::Unknown),
            _ => None,
        }
    }
}

/// Institutional level, mapped from the IPEDS LEVEL code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    FourYear,
    TwoYear,
    LessThanTwoYear,
    Unknown,
}

impl Level {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Level::FourYear,
            2 => Level::TwoYear,
            3 => Level::LessThanTwoYear,
            _ => Level::Unknown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Level::FourYear => "4-year",
            Level::TwoYear => "2-year",
            Level::LessThanTwoYear => "less-than-2-year",
            Level::Unknown => "Unknown",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "4-year" => Some(Level::FourYear),
            "2-year" => Some(Level::TwoYear),
            "less-than-2-year" => Some(Level::LessThanTwoYear),
            "Unknown" => Some(Level::Unknown),
            _ => None,
        }
    }
}

/// The nine IPEDS sectors (control crossed with level), plus Unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sector {
    PublicFourYear,
    PrivateNonprofitFourYear,
    PrivateForProfitFourYear,
    PublicTwoYear,
    PrivateNonprofitTwoYear,
    PrivateForProfitTwoYear,
    PublicLessThanTwoYear,
    PrivateNonprofitLessThanTwoYear,
    PrivateForProfitLessThanTwoYear,
    Unknown,
}

impl Sector {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Sector::PublicFourYear,
            2 => Sector::PrivateNonprofitFourYear,
            3 => Sector::PrivateForProfitFourYear,
            4 => Sector::PublicTwoYear,
            5 => Sector::PrivateNonprofitTwoYear,
            6 => Sector::PrivateForProfitTwoYear,
            7 => Sector::PublicLessThanTwoYear,
            8 => Sector::PrivateNonprofitLessThanTwoYear,
            9 => Sector::PrivateForProfitLessThanTwoYear,
            _ => Sector::Unknown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Sector::PublicFourYear => "Public, 4-year or above",
            Sector::PrivateNonprofitFourYear => "Private nonprofit, 4-year or above",
            Sector::PrivateForProfitFourYear => "Private for-profit, 4-year or above",
            Sector::PublicTwoYear => "Public, 2-year",
            Sector::PrivateNonprofitTwoYear => "Private nonprofit, 2-year",
            Sector::PrivateForProfitTwoYear => "Private for-profit, 2-year",
            Sector::PublicLessThanTwoYear => "Public, less-than 2-year",
            Sector::PrivateNonprofitLessThanTwoYear => "Private nonprofit, less-than 2-year",
            Sector::PrivateForProfitLessThanTwoYear => "Private for-profit, less-than 2-year",
            Sector::Unknown => "Unknown",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let all = [
            Sector::PublicFourYear,
            Sector::PrivateNonprofitFourYear,
            Sector::PrivateForProfitFourYear,
            Sector::PublicTwoYear,
            Sector::PrivateNonprofitTwoYear,
            Sector::PrivateForProfitTwoYear,
            Sector::PublicLessThanTwoYear,
            Sector::PrivateNonprofitLessThanTwoYear,
            Sector::PrivateForProfitLessThanTwoYear,
            Sector::Unknown,
        ];
        all.into_iter().find(|s| s.label() == label)
    }
}

/// One canonical institution-by-year row of the long table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradRateRecord {
    /// Stable IPEDS unit id; primary join key.
    pub unitid: i64,
    /// Cohort reference year.
    pub year: i32,
    /// Institution name; null until enrichment fills it from either extract.
    pub instnm: Option<String>,
    pub control: Option<Control>,
    pub level: Option<Level>,
    pub state: Option<String>,
    pub sector: Option<Sector>,
    /// 150%-of-normal-time graduation rate, percent. Out-of-range source
    /// values are nulled, never clamped.
    pub grad_rate_150: Option<f64>,
    pub source_flag: SourceFamily,
    pub is_revised: bool,
    /// Human-readable cohort descriptor derived from the source column.
    pub cohort_reference: String,
    pub load_ts: DateTime<Utc>,
}

/// Cohort descriptor for a resolved year. The wide exports carry only the
/// total cohort.
pub fn cohort_reference(year: i32) -> String {
    format!("{} cohort, total cohort", year)
}

/// One aggregated row of the summary-by-year table. `sector` holds the
/// closed-enumeration label, with unenriched rows bucketed under `Unknown`.
/// A (year, sector) group whose rates are all null still appears, with a
/// zero count and null statistics, so coverage gaps stay visible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub year: i32,
    pub sector: String,
    pub institution_count: i64,
    pub avg_grad_rate: Option<f64>,
    pub median_grad_rate: Option<f64>,
    pub p25_grad_rate: Option<f64>,
    pub p75_grad_rate: Option<f64>,
}

/// One row of the institutional-characteristics extract, codes still raw.
#[derive(Debug, Clone)]
pub struct InstitutionRow {
    pub unitid: i64,
    pub name: Option<String>,
    pub state: Option<String>,
    pub control_code: Option<i64>,
    pub level_code: Option<i64>,
    pub sector_code: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_codes_map_to_closed_enum() {
        assert_eq!(Control::from_code(1), Control::Public);
        assert_eq!(Control::from_code(2), Control::PrivateNonprofit);
        assert_eq!(Control::from_code(3), Control::PrivateForProfit);
        assert_eq!(Control::from_code(4), Control::Unknown);
        assert_eq!(Control::from_code(-2), Control::Unknown);
    }

    #[test]
    fn sector_codes_cover_all_nine() {
        for code in 1..=9 {
            assert_ne!(Sector::from_code(code), Sector::Unknown);
        }
        assert_eq!(Sector::from_code(0), Sector::Unknown);
        assert_eq!(Sector::from_code(99), Sector::Unknown);
    }

    #[test]
    fn labels_round_trip() {
        for c in [
            Control::Public,
            Control::PrivateNonprofit,
            Control::PrivateForProfit,
            Control::Unknown,
        ] {
            assert_eq!(Control::from_label(c.label()), Some(c));
        }
        for l in [
            Level::FourYear,
            Level::TwoYear,
            Level::LessThanTwoYear,
            Level::Unknown,
        ] {
            assert_eq!(Level::from_label(l.label()), Some(l));
        }
        for code in 1..=9 {
            let s = Sector::from_code(code);
            assert_eq!(Sector::from_label(s.label()), Some(s));
        }
    }

    #[test]
    fn cohort_reference_names_the_total_cohort() {
        assert_eq!(cohort_reference(2020), "2020 cohort, total cohort");
    }
}
