//! Columnar output: the long, latest, and summary tables as ZSTD Parquet.
//!
//! Readers live here too so the enrich and build steps can re-run from files
//! written by an earlier process. `load_ts` is stored as epoch microseconds.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int32Array, Int64Array, StringArray,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;

use crate::domain::{Control, GradRateRecord, Level, Sector, SourceFamily, SummaryRow};
use crate::error::{PipelineError, Result};

fn long_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("unitid", DataType::Int64, false),
        Field::new("year", DataType::Int32, false),
        Field::new("instnm", DataType::Utf8, true),
        Field::new("control", DataType::Utf8, true),
        Field::new("level", DataType::Utf8, true),
        Field::new("state", DataType::Utf8, true),
        Field::new("sector", DataType::Utf8, true),
        Field::new("grad_rate_150", DataType::Float64, true),
        Field::new("source_flag", DataType::Utf8, false),
        Field::new("is_revised", DataType::Boolean, false),
        Field::new("cohort_reference", DataType::Utf8, false),
        Field::new("load_ts", DataType::Int64, false),
    ]))
}

fn summary_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("year", DataType::Int32, false),
        Field::new("sector", DataType::Utf8, false),
        Field::new("institution_count", DataType::Int64, false),
        Field::new("avg_grad_rate", DataType::Float64, true),
        Field::new("median_grad_rate", DataType::Float64, true),
        Field::new("p25_grad_rate", DataType::Float64, true),
        Field::new("p75_grad_rate", DataType::Float64, true),
    ]))
}

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .build()
}

/// Write a batch to `<path>.tmp` and rename into place, so a crashed run
/// never leaves a half-written table under the canonical name.
fn write_batch(batch: RecordBatch, schema: Arc<Schema>, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    let file = File::create(&tmp)?;
    let mut writer = ArrowWriter::try_new(file, schema, Some(writer_properties()))?;
    writer.write(&batch)?;
    writer.close()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write the long (or latest, same schema) table.
pub fn write_long_table(records: &[GradRateRecord], path: &Path) -> Result<()> {
    let schema = long_schema();
    let unitids: Vec<i64> = records.iter().map(|r| r.unitid).collect();
    let years: Vec<i32> = records.iter().map(|r| r.year).collect();
    let names: Vec<Option<String>> = records.iter().map(|r| r.instnm.clone()).collect();
    let controls: Vec<Option<String>> = records
        .iter()
        .map(|r| r.control.map(|c| c.label().to_string()))
        .collect();
    let levels: Vec<Option<String>> = records
        .iter()
        .map(|r| r.level.map(|l| l.label().to_string()))
        .collect();
    let states: Vec<Option<String>> = records.iter().map(|r| r.state.clone()).collect();
    let sectors: Vec<Option<String>> = records
        .iter()
        .map(|r| r.sector.map(|s| s.label().to_string()))
        .collect();
    let rates: Vec<Option<f64>> = records.iter().map(|r| r.grad_rate_150).collect();
    let flags: Vec<&str> = records.iter().map(|r| r.source_flag.label()).collect();
    let revised: Vec<bool> = records.iter().map(|r| r.is_revised).collect();
    let cohorts: Vec<&str> = records.iter().map(|r| r.cohort_reference.as_str()).collect();
    let load_ts: Vec<i64> = records.iter().map(|r| r.load_ts.timestamp_micros()).collect();

    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(unitids)),
        Arc::new(Int32Array::from(years)),
        Arc::new(StringArray::from(names)),
        Arc::new(StringArray::from(controls)),
        Arc::new(StringArray::from(levels)),
        Arc::new(StringArray::from(states)),
        Arc::new(StringArray::from(sectors)),
        Arc::new(Float64Array::from(rates)),
        Arc::new(StringArray::from(flags)),
        Arc::new(BooleanArray::from(revised)),
        Arc::new(StringArray::from(cohorts)),
        Arc::new(Int64Array::from(load_ts)),
    ];
    let batch = RecordBatch::try_new(schema.clone(), columns)?;
    write_batch(batch, schema, path)
}

/// Read a long-schema table back into records.
pub fn read_long_table(path: &Path) -> Result<Vec<GradRateRecord>> {
    if !path.exists() {
        return Err(PipelineError::MissingInput(format!(
            "long table not found: {}",
            path.display()
        )));
    }

    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch?;
        let unitids: &Int64Array = column(&batch, "unitid")?;
        let years: &Int32Array = column(&batch, "year")?;
        let names: &StringArray = column(&batch, "instnm")?;
        let controls: &StringArray = column(&batch, "control")?;
        let levels: &StringArray = column(&batch, "level")?;
        let states: &StringArray = column(&batch, "state")?;
        let sectors: &StringArray = column(&batch, "sector")?;
        let rates: &Float64Array = column(&batch, "grad_rate_150")?;
        let flags: &StringArray = column(&batch, "source_flag")?;
        let revised: &BooleanArray = column(&batch, "is_revised")?;
        let cohorts: &StringArray = column(&batch, "cohort_reference")?;
        let load_ts: &Int64Array = column(&batch, "load_ts")?;

        for i in 0..batch.num_rows() {
            records.push(GradRateRecord {
                unitid: unitids.value(i),
                year: years.value(i),
                instnm: opt_string(names, i),
                control: parse_opt(controls, i, Control::from_label, "control")?,
                level: parse_opt(levels, i, Level::from_label, "level")?,
                state: opt_string(states, i),
                sector: parse_opt(sectors, i, Sector::from_label, "sector")?,
                grad_rate_150: opt_f64(rates, i),
                source_flag: SourceFamily::from_label(flags.value(i)).ok_or_else(|| {
                    PipelineError::Validation(format!(
                        "unrecognized source_flag '{}' in {}",
                        flags.value(i),
                        path.display()
                    ))
                })?,
                is_revised: revised.value(i),
                cohort_reference: cohorts.value(i).to_string(),
                load_ts: chrono::DateTime::from_timestamp_micros(load_ts.value(i)).ok_or_else(
                    || {
                        PipelineError::Validation(format!(
                            "load_ts out of range in {}",
                            path.display()
                        ))
                    },
                )?,
            });
        }
    }
    Ok(records)
}

pub fn write_summary_table(rows: &[SummaryRow], path: &Path) -> Result<()> {
    let schema = summary_schema();
    let years: Vec<i32> = rows.iter().map(|r| r.year).collect();
    let sectors: Vec<&str> = rows.iter().map(|r| r.sector.as_str()).collect();
    let counts: Vec<i64> = rows.iter().map(|r| r.institution_count).collect();
    let avgs: Vec<Option<f64>> = rows.iter().map(|r| r.avg_grad_rate).collect();
    let medians: Vec<Option<f64>> = rows.iter().map(|r| r.median_grad_rate).collect();
    let p25s: Vec<Option<f64>> = rows.iter().map(|r| r.p25_grad_rate).collect();
    let p75s: Vec<Option<f64>> = rows.iter().map(|r| r.p75_grad_rate).collect();

    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int32Array::from(years)),
        Arc::new(StringArray::from(sectors)),
        Arc::new(Int64Array::from(counts)),
        Arc::new(Float64Array::from(avgs)),
        Arc::new(Float64Array::from(medians)),
        Arc::new(Float64Array::from(p25s)),
        Arc::new(Float64Array::from(p75s)),
    ];
    let batch = RecordBatch::try_new(schema.clone(), columns)?;
    write_batch(batch, schema, path)
}

pub fn read_summary_table(path: &Path) -> Result<Vec<SummaryRow>> {
    if !path.exists() {
        return Err(PipelineError::MissingInput(format!(
            "summary table not found: {}",
            path.display()
        )));
    }

    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch?;
        let years: &Int32Array = column(&batch, "year")?;
        let sectors: &StringArray = column(&batch, "sector")?;
        let counts: &Int64Array = column(&batch, "institution_count")?;
        let avgs: &Float64Array = column(&batch, "avg_grad_rate")?;
        let medians: &Float64Array = column(&batch, "median_grad_rate")?;
        let p25s: &Float64Array = column(&batch, "p25_grad_rate")?;
        let p75s: &Float64Array = column(&batch, "p75_grad_rate")?;

        for i in 0..batch.num_rows() {
            rows.push(SummaryRow {
                year: years.value(i),
                sector: sectors.value(i).to_string(),
                institution_count: counts.value(i),
                avg_grad_rate: opt_f64(avgs, i),
                median_grad_rate: opt_f64(medians, i),
                p25_grad_rate: opt_f64(p25s, i),
                p75_grad_rate: opt_f64(p75s, i),
            });
        }
    }
    Ok(rows)
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| {
            PipelineError::Validation(format!("table is missing expected column '{}'", name))
        })
}

fn opt_string(array: &StringArray, i: usize) -> Option<String> {
    if array.is_null(i) {
        None
    } else {
        Some(array.value(i).to_string())
    }
}

fn opt_f64(array: &Float64Array, i: usize) -> Option<f64> {
    if array.is_null(i) {
        None
    } else {
        Some(array.value(i))
    }
}

fn parse_opt<T>(
    array: &StringArray,
    i: usize,
    parse: fn(&str) -> Option<T>,
    what: &str,
) -> Result<Option<T>> {
    if array.is_null(i) {
        return Ok(None);
    }
    let label = array.value(i);
    parse(label).map(Some).ok_or_else(|| {
        PipelineError::Validation(format!("unrecognized {} label '{}'", what, label))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cohort_reference;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn record(unitid: i64, year: i32, rate: Option<f64>) -> GradRateRecord {
        GradRateRecord {
            unitid,
            year,
            instnm: Some(format!("School {}", unitid)),
            control: Some(Control::Public),
            level: Some(Level::FourYear),
            state: Some("AL".to_string()),
            sector: Some(Sector::PublicFourYear),
            grad_rate_150: rate,
            source_flag: SourceFamily::Official,
            is_revised: false,
            cohort_reference: cohort_reference(year),
            load_ts: Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn long_table_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("long.parquet");

        let mut unmatched = record(2, 2021, None);
        unmatched.instnm = None;
        unmatched.control = None;
        unmatched.level = None;
        unmatched.state = None;
        unmatched.sector = None;

        let records = vec![record(1, 2020, Some(55.5)), unmatched];
        write_long_table(&records, &path).unwrap();

        let loaded = read_long_table(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].unitid, 1);
        assert_eq!(loaded[0].grad_rate_150, Some(55.5));
        assert_eq!(loaded[0].control, Some(Control::Public));
        assert_eq!(loaded[0].load_ts, records[0].load_ts);
        assert_eq!(loaded[1].control, None);
        assert_eq!(loaded[1].grad_rate_150, None);
    }

    #[test]
    fn summary_table_round_trips_null_statistics() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("summary.parquet");

        let rows = vec![
            SummaryRow {
                year: 2020,
                sector: Sector::PublicFourYear.label().to_string(),
                institution_count: 3,
                avg_grad_rate: Some(52.0),
                median_grad_rate: Some(51.0),
                p25_grad_rate: Some(45.0),
                p75_grad_rate: Some(60.0),
            },
            SummaryRow {
                year: 2020,
                sector: Sector::Unknown.label().to_string(),
                institution_count: 0,
                avg_grad_rate: None,
                median_grad_rate: None,
                p25_grad_rate: None,
                p75_grad_rate: None,
            },
        ];
        write_summary_table(&rows, &path).unwrap();

        let loaded = read_summary_table(&path).unwrap();
        assert_eq!(loaded, rows);
    }

    #[test]
    fn no_tmp_file_remains_after_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("long.parquet");
        write_long_table(&[record(1, 2020, Some(50.0))], &path).unwrap();

        assert!(path.exists());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn reading_a_missing_table_reports_missing_input() {
        let err = read_long_table(Path::new("/nonexistent/long.parquet")).unwrap_err();
        assert!(matches!(err, PipelineError::MissingInput(_)));
    }
}
