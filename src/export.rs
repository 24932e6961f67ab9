//! CSV import of the onset cohort and CSV export of feature rows.

use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

use crate::config::OnsetColumns;
use crate::pipeline::{parse_timestamp, BinFeatureRecord, StayOnset};
use crate::query::FEATURE_COLUMNS;

const CSV_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV header is missing column '{0}'")]
    MissingColumn(String),
    #[error("invalid timestamp on line {line}: {value}")]
    InvalidTimestamp { line: u64, value: String },
}

/// Reads a headered cohort CSV. Rows with an empty onset are skipped.
pub fn read_onsets_csv<R: Read>(
    reader: R,
    columns: &OnsetColumns,
) -> Result<Vec<StayOnset>, ExportError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = reader.headers()?.clone();
    let stay_idx = header_index(&headers, &columns.stay_id)?;
    let onset_idx = header_index(&headers, &columns.onset_time)?;

    let mut onsets = Vec::new();
    for record in reader.records() {
        let record = record?;
        let stay_id = record.get(stay_idx).unwrap_or_default();
        let raw_onset = record.get(onset_idx).unwrap_or_default();
        if stay_id.is_empty() || raw_onset.is_empty() {
            continue;
        }
        let onset_time =
            parse_timestamp(raw_onset).map_err(|_| ExportError::InvalidTimestamp {
                line: record.position().map(|p| p.line()).unwrap_or_default(),
                value: raw_onset.to_string(),
            })?;
        onsets.push(StayOnset {
            stay_id: stay_id.to_string(),
            onset_time,
        });
    }
    Ok(onsets)
}

pub fn write_features_csv<W: Write>(
    writer: W,
    records: &[BinFeatureRecord],
) -> Result<(), ExportError> {
    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record(FEATURE_COLUMNS.iter().map(|(name, _)| *name))?;

    for record in records {
        writer.write_record([
            record.stay_id.clone(),
            record.signal.clone(),
            record.modality.clone().unwrap_or_default(),
            opt(record.vital_source_type),
            fmt_ts(record.bin_start),
            fmt_ts(record.bin_end),
            record.minutes_from_onset.to_string(),
            record.count_val.to_string(),
            opt(record.min_val),
            opt(record.max_val),
            opt(record.mean_val),
            opt(record.std_val),
            opt(record.first_val),
            record.first_time.map(fmt_ts).unwrap_or_default(),
            opt(record.last_val),
            record.last_time.map(fmt_ts).unwrap_or_default(),
            opt(record.slope),
            opt(record.prev_last_val),
            opt(record.delta_last),
            record.label.to_string(),
        ])?;
    }
    writer.flush()?;

    info!(
        component = "export",
        event = "export.csv.written",
        rows = records.len()
    );
    Ok(())
}

fn header_index(headers: &csv::StringRecord, name: &str) -> Result<usize, ExportError> {
    headers
        .iter()
        .position(|header| header == name)
        .ok_or_else(|| ExportError::MissingColumn(name.to_string()))
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format(CSV_TIMESTAMP_FORMAT).to_string()
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}
