//! Local SQLite extract of the onset and chart-event relations.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Value;
use rusqlite::Connection;
use thiserror::Error;
use tracing::info;

use crate::config::{FeatureWindowConfig, FeatureWindowError, TypeCode};
use crate::pipeline::{
    materialize_features, parse_timestamp, BinFeatureRecord, MaterializeReport, Observation,
    StayOnset,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid timestamp in {column}: {value}")]
    InvalidTimestamp { column: String, value: String },
    #[error("invalid value in {column}: {value}")]
    InvalidValue { column: String, value: String },
    #[error(transparent)]
    Config(#[from] FeatureWindowError),
}

pub fn load_store_inputs(
    store_path: &Path,
    cfg: &FeatureWindowConfig,
) -> Result<(Vec<StayOnset>, Vec<Observation>), StoreError> {
    let conn = Connection::open(store_path)?;
    let onsets = load_onsets(&conn, cfg)?;
    let observations = load_observations(&conn, cfg)?;

    info!(
        component = "store",
        event = "store.load.finish",
        store_path = %store_path.display(),
        onsets = onsets.len(),
        observations = observations.len()
    );

    Ok((onsets, observations))
}

pub fn materialize_store_features(
    store_path: &Path,
    cfg: &FeatureWindowConfig,
) -> Result<(Vec<BinFeatureRecord>, MaterializeReport), StoreError> {
    cfg.validate()?;
    let (onsets, observations) = load_store_inputs(store_path, cfg)?;
    Ok(materialize_features(&onsets, &observations, cfg)?)
}

fn load_onsets(conn: &Connection, cfg: &FeatureWindowConfig) -> Result<Vec<StayOnset>, StoreError> {
    let cols = &cfg.onset_columns;
    let mut stmt = conn.prepare(&format!(
        "SELECT {stay}, {onset} FROM {table} WHERE {onset} IS NOT NULL",
        stay = quote_ident(&cols.stay_id),
        onset = quote_ident(&cols.onset_time),
        table = quote_ident(cfg.onset_source.as_str()),
    ))?;

    let mut rows = stmt.query([])?;
    let mut onsets = Vec::new();
    while let Some(row) = rows.next()? {
        let stay_id = stay_id_from_value(row.get(0)?, &cols.stay_id)?;
        let onset_time = timestamp_from_value(row.get(1)?, &cols.onset_time)?;
        onsets.push(StayOnset {
            stay_id,
            onset_time,
        });
    }
    Ok(onsets)
}

fn load_observations(
    conn: &Connection,
    cfg: &FeatureWindowConfig,
) -> Result<Vec<Observation>, StoreError> {
    let cols = &cfg.observation_columns;
    let mut stmt = conn.prepare(&format!(
        "SELECT {stay}, {time}, {code}, {value} FROM {table} WHERE {time} IS NOT NULL",
        stay = quote_ident(&cols.stay_id),
        time = quote_ident(&cols.time),
        code = quote_ident(&cols.type_code),
        value = quote_ident(&cols.value),
        table = quote_ident(cfg.observation_source.as_str()),
    ))?;

    let mut rows = stmt.query([])?;
    let mut observations = Vec::new();
    while let Some(row) = rows.next()? {
        let Some(type_code) = type_code_from_value(row.get(2)?, &cols.type_code)? else {
            continue;
        };
        observations.push(Observation {
            stay_id: stay_id_from_value(row.get(0)?, &cols.stay_id)?,
            charttime: timestamp_from_value(row.get(1)?, &cols.time)?,
            type_code,
            value: numeric_from_value(row.get(3)?),
        });
    }
    Ok(observations)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn stay_id_from_value(value: Value, column: &str) -> Result<String, StoreError> {
    match value {
        Value::Integer(id) => Ok(id.to_string()),
        Value::Text(id) if !id.trim().is_empty() => Ok(id.trim().to_string()),
        other => Err(StoreError::InvalidValue {
            column: column.to_string(),
            value: format!("{other:?}"),
        }),
    }
}

/// Text timestamps go through `parse_timestamp`; numbers are epoch seconds.
fn timestamp_from_value(value: Value, column: &str) -> Result<DateTime<Utc>, StoreError> {
    let invalid = |value: String| StoreError::InvalidTimestamp {
        column: column.to_string(),
        value,
    };
    match value {
        Value::Text(raw) => parse_timestamp(&raw).map_err(|_| invalid(raw)),
        Value::Integer(secs) => Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| invalid(secs.to_string())),
        Value::Real(secs) => {
            let millis = (secs * 1_000.0).round() as i64;
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| invalid(secs.to_string()))
        }
        other => Err(invalid(format!("{other:?}"))),
    }
}

/// Digit-only text codes normalize to numeric; NULL codes are skipped.
fn type_code_from_value(value: Value, column: &str) -> Result<Option<TypeCode>, StoreError> {
    match value {
        Value::Null => Ok(None),
        Value::Integer(code) => Ok(Some(TypeCode::Numeric(code))),
        Value::Text(raw) => {
            let trimmed = raw.trim();
            match trimmed.parse::<i64>() {
                Ok(code) => Ok(Some(TypeCode::Numeric(code))),
                Err(_) => Ok(Some(TypeCode::Symbolic(trimmed.to_string()))),
            }
        }
        other => Err(StoreError::InvalidValue {
            column: column.to_string(),
            value: format!("{other:?}"),
        }),
    }
}

fn numeric_from_value(value: Value) -> Option<f64> {
    let parsed = match value {
        Value::Integer(v) => Some(v as f64),
        Value::Real(v) => Some(v),
        Value::Text(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}
