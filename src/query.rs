//! Feature-window query builder: one parameterized BigQuery CTE pipeline
//! (events -> window -> bins -> aggregates -> fusion -> lag -> label).

use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::{
    BinAnchor, ConfigWarning, FeatureWindowConfig, FeatureWindowError, ReferenceTime, TypeCode,
};

pub const POSITIVE_LABEL: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Key,
    Text,
    Timestamp,
    Float64,
    Int64,
}

pub const FEATURE_COLUMNS: [(&str, ColumnType); 20] = [
    ("stay_id", ColumnType::Key),
    ("signal", ColumnType::Text),
    ("modality", ColumnType::Text),
    ("vital_source_type", ColumnType::Int64),
    ("bin_start", ColumnType::Timestamp),
    ("bin_end", ColumnType::Timestamp),
    ("minutes_from_onset", ColumnType::Int64),
    ("count_val", ColumnType::Int64),
    ("min_val", ColumnType::Float64),
    ("max_val", ColumnType::Float64),
    ("mean_val", ColumnType::Float64),
    ("std_val", ColumnType::Float64),
    ("first_val", ColumnType::Float64),
    ("first_time", ColumnType::Timestamp),
    ("last_val", ColumnType::Float64),
    ("last_time", ColumnType::Timestamp),
    ("slope", ColumnType::Float64),
    ("prev_last_val", ColumnType::Float64),
    ("delta_last", ColumnType::Float64),
    ("label", ColumnType::Int64),
];

/// Per-bin statistics carried through fusion, in output order.
const STAT_COLUMNS: [&str; 10] = [
    "count_val",
    "min_val",
    "max_val",
    "mean_val",
    "std_val",
    "first_val",
    "first_time",
    "last_val",
    "last_time",
    "slope",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputColumn {
    pub name: String,
    pub dtype: ColumnType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub sql: String,
    pub columns: Vec<OutputColumn>,
    pub fingerprint: String,
    pub warnings: Vec<ConfigWarning>,
}

pub fn output_columns() -> Vec<OutputColumn> {
    FEATURE_COLUMNS
        .iter()
        .map(|(name, dtype)| OutputColumn {
            name: (*name).to_string(),
            dtype: *dtype,
        })
        .collect()
}

pub fn build_feature_table(cfg: &FeatureWindowConfig) -> Result<QuerySpec, FeatureWindowError> {
    info!(
        component = "query",
        event = "query.build.start",
        onset_source = %cfg.onset_source,
        observation_source = %cfg.observation_source,
        lookback_hours = cfg.lookback_hours,
        bin_size_minutes = cfg.bin_size_minutes,
        anchor = ?cfg.anchor,
        reference_time = ?cfg.reference_time,
        dense_grid = cfg.dense_grid,
        signal_count = cfg.signals.len()
    );

    let warnings = cfg.validate()?;
    let columns = output_columns();
    let sql = render_sql(cfg);
    let fingerprint = query_fingerprint(&sql, &columns);

    info!(
        component = "query",
        event = "query.build.finish",
        sql_bytes = sql.len(),
        warning_count = warnings.len(),
        fingerprint = %fingerprint
    );

    Ok(QuerySpec {
        sql,
        columns,
        fingerprint,
        warnings,
    })
}

pub fn assert_query_compatible(
    expected_fingerprint: &str,
    actual: &QuerySpec,
) -> Result<(), FeatureWindowError> {
    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureWindowError::FingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }
    Ok(())
}

/// `expr IN (...)`, or `FALSE` for an empty set so nothing matches.
pub fn type_code_membership(expr: &str, codes: &BTreeSet<TypeCode>) -> String {
    if codes.is_empty() {
        return "FALSE".to_string();
    }
    let list = codes
        .iter()
        .map(type_code_literal)
        .collect::<Vec<_>>()
        .join(", ");
    format!("{expr} IN ({list})")
}

pub fn string_literal(raw: &str) -> String {
    let escaped = raw.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}

fn type_code_literal(code: &TypeCode) -> String {
    match code {
        TypeCode::Numeric(code) => code.to_string(),
        TypeCode::Symbolic(code) => string_literal(code),
    }
}

fn quote_relation(name: &str) -> String {
    format!("`{name}`")
}

fn quote_ident(name: &str) -> String {
    format!("`{name}`")
}

/// Floor of `time_expr` onto the bin grid.
fn bin_start_expr(anchor: BinAnchor, time_expr: &str, onset_expr: &str, bin_seconds: i64) -> String {
    match anchor {
        BinAnchor::OnsetRelative => {
            let bin_ms = bin_seconds * 1_000;
            format!(
                "TIMESTAMP_ADD({onset_expr}, INTERVAL CAST(FLOOR(TIMESTAMP_DIFF({time_expr}, {onset_expr}, MILLISECOND) / {bin_ms}) AS INT64) * {bin_ms} MILLISECOND)"
            )
        }
        BinAnchor::ClockAligned => format!(
            "TIMESTAMP_SECONDS(CAST(FLOOR(UNIX_SECONDS({time_expr}) / {bin_seconds}) AS INT64) * {bin_seconds})"
        ),
    }
}

fn render_sql(cfg: &FeatureWindowConfig) -> String {
    let onset_cols = &cfg.onset_columns;
    let obs_cols = &cfg.observation_columns;
    let bin_seconds = i64::from(cfg.bin_size_minutes) * 60;
    let code_expr = format!("c.{}", quote_ident(&obs_cols.type_code));

    let mut sql = String::new();

    // 1) cohort onsets, normalized to TIMESTAMP; earliest onset per stay
    let _ = write!(
        sql,
        "WITH onsets AS (
    SELECT
        o.{stay} AS stay_id,
        MIN(TIMESTAMP(o.{onset})) AS onset_time
    FROM {table} o
    WHERE o.{onset} IS NOT NULL
    GROUP BY o.{stay}
),
",
        stay = quote_ident(&onset_cols.stay_id),
        onset = quote_ident(&onset_cols.onset_time),
        table = quote_relation(cfg.onset_source.as_str()),
    );

    // 2) map type codes to (signal, modality, rank)
    let mut signal_arms = String::new();
    let mut modality_arms = String::new();
    let mut rank_arms = String::new();
    for signal in &cfg.signals {
        for (idx, modality) in signal.modalities.iter().enumerate() {
            let predicate = type_code_membership(&code_expr, &modality.type_codes);
            let _ = write!(
                signal_arms,
                "\n            WHEN {predicate} THEN {}",
                string_literal(&signal.name)
            );
            let _ = write!(
                modality_arms,
                "\n            WHEN {predicate} THEN {}",
                string_literal(&modality.name)
            );
            let _ = write!(rank_arms, "\n            WHEN {predicate} THEN {}", idx + 1);
        }
    }
    let _ = write!(
        sql,
        "mapped AS (
    SELECT
        c.{stay} AS stay_id,
        TIMESTAMP(c.{time}) AS charttime,
        c.{value} AS valuenum,
        CASE{signal_arms}
        END AS signal,
        CASE{modality_arms}
        END AS modality,
        CASE{rank_arms}
        END AS source_rank
    FROM {table} c
    WHERE c.{value} IS NOT NULL
        AND {all_codes}
),
",
        stay = quote_ident(&obs_cols.stay_id),
        time = quote_ident(&obs_cols.time),
        value = quote_ident(&obs_cols.value),
        table = quote_relation(cfg.observation_source.as_str()),
        all_codes = type_code_membership(&code_expr, &cfg.all_type_codes()),
    );

    // 3) cohort restriction and per-signal plausibility bounds
    let plausible = cfg
        .signals
        .iter()
        .map(|signal| match signal.value_range {
            Some(range) => format!(
                "(m.signal = {} AND m.valuenum BETWEEN {} AND {})",
                string_literal(&signal.name),
                range.min,
                range.max
            ),
            None => format!("m.signal = {}", string_literal(&signal.name)),
        })
        .collect::<Vec<_>>()
        .join("\n        OR ");
    let _ = write!(
        sql,
        "events AS (
    SELECT m.*
    FROM mapped m
    JOIN onsets s ON s.stay_id = m.stay_id
    WHERE {plausible}
),
"
    );

    // 4) window = [max(onset - lookback, first observation), onset]
    let _ = write!(
        sql,
        "first_obs AS (
    SELECT stay_id, MIN(charttime) AS first_time
    FROM events
    GROUP BY stay_id
),
bounds AS (
    SELECT
        s.stay_id,
        s.onset_time,
        GREATEST(TIMESTAMP_SUB(s.onset_time, INTERVAL {lookback} HOUR), f.first_time) AS window_start
    FROM onsets s
    JOIN first_obs f ON f.stay_id = s.stay_id
),
windowed AS (
    SELECT e.*, b.onset_time
    FROM events e
    JOIN bounds b ON b.stay_id = e.stay_id
    WHERE e.charttime >= b.window_start
        AND e.charttime <= b.onset_time
),
",
        lookback = cfg.lookback_hours,
    );

    // 5) bins and per-modality aggregates
    let _ = write!(
        sql,
        "binned AS (
    SELECT *, {bin_expr} AS bin_start
    FROM windowed
),
modality_bins AS (
    SELECT
        stay_id,
        signal,
        modality,
        source_rank,
        bin_start,
        ANY_VALUE(onset_time) AS onset_time,
        COUNT(*) AS count_val,
        MIN(valuenum) AS min_val,
        MAX(valuenum) AS max_val,
        AVG(valuenum) AS mean_val,
        STDDEV_SAMP(valuenum) AS std_val,
        ARRAY_AGG(valuenum ORDER BY charttime ASC LIMIT 1)[OFFSET(0)] AS first_val,
        ARRAY_AGG(valuenum ORDER BY charttime DESC LIMIT 1)[OFFSET(0)] AS last_val,
        MIN(charttime) AS first_time,
        MAX(charttime) AS last_time
    FROM binned
    GROUP BY stay_id, signal, modality, source_rank, bin_start
),
",
        bin_expr = bin_start_expr(cfg.anchor, "charttime", "onset_time", bin_seconds),
    );

    // 6) rank-and-pick fusion across modalities, then slope
    let _ = write!(
        sql,
        "fused AS (
    SELECT
        stay_id,
        signal,
        bin_start,
        ARRAY_AGG(
            STRUCT(modality, source_rank, onset_time, count_val, min_val, max_val, mean_val, std_val, first_val, first_time, last_val, last_time)
            ORDER BY source_rank ASC
            LIMIT 1
        )[OFFSET(0)] AS pick
    FROM modality_bins
    GROUP BY stay_id, signal, bin_start
),
features AS (
    SELECT
        stay_id,
        signal,
        bin_start,
        pick.modality AS modality,
        pick.source_rank AS vital_source_type,
        pick.onset_time AS onset_time,
        pick.count_val AS count_val,
        pick.min_val AS min_val,
        pick.max_val AS max_val,
        pick.mean_val AS mean_val,
        pick.std_val AS std_val,
        pick.first_val AS first_val,
        pick.first_time AS first_time,
        pick.last_val AS last_val,
        pick.last_time AS last_time,
        SAFE_DIVIDE(
            pick.last_val - pick.first_val,
            TIMESTAMP_DIFF(pick.last_time, pick.first_time, SECOND)
        ) AS slope
    FROM fused
),
"
    );

    // 7) optional dense grid of empty placeholder bins
    let lag_source = if cfg.dense_grid {
        let signal_list = cfg
            .signals
            .iter()
            .map(|signal| string_literal(&signal.name))
            .collect::<Vec<_>>()
            .join(", ");
        let stat_projection = STAT_COLUMNS
            .iter()
            .map(|column| {
                if *column == "count_val" {
                    "COALESCE(f.count_val, 0) AS count_val".to_string()
                } else {
                    format!("f.{column}")
                }
            })
            .collect::<Vec<_>>()
            .join(",\n        ");
        let _ = write!(
            sql,
            "grid AS (
    SELECT b.stay_id, b.onset_time, sig AS signal, grid_bin AS bin_start
    FROM bounds b
    CROSS JOIN UNNEST([{signal_list}]) AS sig
    CROSS JOIN UNNEST(GENERATE_TIMESTAMP_ARRAY(
        {first_bin},
        {last_bin},
        INTERVAL {bin_minutes} MINUTE
    )) AS grid_bin
),
dense AS (
    SELECT
        g.stay_id,
        g.signal,
        g.bin_start,
        g.onset_time,
        f.modality,
        f.vital_source_type,
        {stat_projection}
    FROM grid g
    LEFT JOIN features f
        ON f.stay_id = g.stay_id
        AND f.signal = g.signal
        AND f.bin_start = g.bin_start
),
",
            first_bin = bin_start_expr(cfg.anchor, "b.window_start", "b.onset_time", bin_seconds),
            last_bin = bin_start_expr(cfg.anchor, "b.onset_time", "b.onset_time", bin_seconds),
            bin_minutes = cfg.bin_size_minutes,
        );
        "dense"
    } else {
        "features"
    };

    // 8) lag within (stay, signal), label, leakage guard
    let reference = match cfg.reference_time {
        ReferenceTime::BinStart => "bin_start",
        ReferenceTime::LastObservation => "COALESCE(last_time, bin_start)",
    };
    let leakage_guard = if cfg.dense_grid {
        "last_time IS NULL OR last_time <= onset_time"
    } else {
        "last_time <= onset_time"
    };
    let _ = write!(
        sql,
        "with_lag AS (
    SELECT
        *,
        LAG(last_val) OVER (PARTITION BY stay_id, signal ORDER BY bin_start) AS prev_last_val
    FROM {lag_source}
)
SELECT
    stay_id,
    signal,
    modality,
    vital_source_type,
    bin_start,
    TIMESTAMP_ADD(bin_start, INTERVAL {bin_minutes} MINUTE) AS bin_end,
    TIMESTAMP_DIFF({reference}, onset_time, MINUTE) AS minutes_from_onset,
    count_val,
    min_val,
    max_val,
    mean_val,
    std_val,
    first_val,
    first_time,
    last_val,
    last_time,
    slope,
    prev_last_val,
    last_val - prev_last_val AS delta_last,
    {label} AS label
FROM with_lag
WHERE {leakage_guard}
ORDER BY stay_id, signal, bin_start;
",
        bin_minutes = cfg.bin_size_minutes,
        label = POSITIVE_LABEL,
    );

    sql
}

fn query_fingerprint(sql: &str, columns: &[OutputColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update("sql:");
    hasher.update(sql.as_bytes());
    hasher.update(";columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(format!(":{:?};", column.dtype));
    }
    hex::encode(hasher.finalize())
}
