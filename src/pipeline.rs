//! In-memory feature-window transform with the same semantics as the
//! generated query: window, bin, aggregate, fuse, lag, label.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{FeatureWindowConfig, FeatureWindowError, ReferenceTime, TypeCode};
use crate::query::POSITIVE_LABEL;

const NAIVE_TIMESTAMP_FORMATS: [&str; 3] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f UTC",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StayOnset {
    pub stay_id: String,
    pub onset_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub stay_id: String,
    pub charttime: DateTime<Utc>,
    pub type_code: TypeCode,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StayWindow {
    pub stay_id: String,
    pub onset_time: DateTime<Utc>,
    pub first_observation_time: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinFeatureRecord {
    pub stay_id: String,
    pub signal: String,
    pub modality: Option<String>,
    pub vital_source_type: Option<u32>,
    pub bin_start: DateTime<Utc>,
    pub bin_end: DateTime<Utc>,
    pub minutes_from_onset: i64,
    pub count_val: u64,
    pub min_val: Option<f64>,
    pub max_val: Option<f64>,
    pub mean_val: Option<f64>,
    pub std_val: Option<f64>,
    pub first_val: Option<f64>,
    pub first_time: Option<DateTime<Utc>>,
    pub last_val: Option<f64>,
    pub last_time: Option<DateTime<Utc>>,
    pub slope: Option<f64>,
    pub prev_last_val: Option<f64>,
    pub delta_last: Option<f64>,
    pub label: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializeReport {
    pub stays_in_cohort: u64,
    pub duplicate_onsets: u64,
    pub stays_with_window: u64,
    pub input_observations: u64,
    pub dropped_outside_cohort: u64,
    pub dropped_missing_value: u64,
    pub dropped_unmatched: u64,
    pub dropped_out_of_range: u64,
    pub dropped_outside_window: u64,
    pub used_observations: u64,
    pub output_records: u64,
}

/// Normalizes onset/chart timestamps: RFC 3339, naive date-times (taken as
/// UTC), BigQuery `... UTC` strings, or bare dates.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, FeatureWindowError> {
    let trimmed = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in NAIVE_TIMESTAMP_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(FeatureWindowError::InvalidTimestamp(trimmed.to_string()))
}

#[derive(Debug, Clone, Copy)]
struct MatchedObservation<'a> {
    stay_id: &'a str,
    signal: usize,
    rank: u32,
    charttime: DateTime<Utc>,
    value: f64,
}

/// Type code -> (signal index, 1-based modality rank). Empty sets add nothing.
struct SignalMatcher {
    by_code: HashMap<TypeCode, (usize, u32)>,
}

impl SignalMatcher {
    fn new(cfg: &FeatureWindowConfig) -> Self {
        let mut by_code = HashMap::new();
        for (signal_idx, signal) in cfg.signals.iter().enumerate() {
            for (modality_idx, modality) in signal.modalities.iter().enumerate() {
                for code in &modality.type_codes {
                    by_code.insert(code.clone(), (signal_idx, modality_idx as u32 + 1));
                }
            }
        }
        Self { by_code }
    }

    fn lookup(&self, code: &TypeCode) -> Option<(usize, u32)> {
        self.by_code.get(code).copied()
    }
}

#[derive(Debug, Clone)]
struct BinAccumulator {
    count: u64,
    min: f64,
    max: f64,
    mean: f64,
    m2: f64,
    first: (DateTime<Utc>, f64),
    last: (DateTime<Utc>, f64),
}

impl BinAccumulator {
    fn new(charttime: DateTime<Utc>, value: f64) -> Self {
        Self {
            count: 1,
            min: value,
            max: value,
            mean: value,
            m2: 0.0,
            first: (charttime, value),
            last: (charttime, value),
        }
    }

    fn push(&mut self, charttime: DateTime<Utc>, value: f64) {
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        if charttime < self.first.0 {
            self.first = (charttime, value);
        }
        if charttime >= self.last.0 {
            self.last = (charttime, value);
        }
    }

    /// Sample standard deviation; undefined below two observations.
    fn std_sample(&self) -> Option<f64> {
        if self.count < 2 {
            return None;
        }
        Some((self.m2 / (self.count - 1) as f64).sqrt())
    }

    fn slope(&self) -> Option<f64> {
        let seconds = (self.last.0 - self.first.0).num_seconds();
        if seconds == 0 {
            return None;
        }
        Some((self.last.1 - self.first.1) / seconds as f64)
    }
}

struct Cohort<'a> {
    onsets: BTreeMap<&'a str, DateTime<Utc>>,
    duplicates: u64,
}

fn build_cohort(onsets: &[StayOnset]) -> Cohort<'_> {
    let mut map: BTreeMap<&str, DateTime<Utc>> = BTreeMap::new();
    let mut duplicates = 0;
    for onset in onsets {
        match map.get_mut(onset.stay_id.as_str()) {
            Some(existing) => {
                duplicates += 1;
                if onset.onset_time < *existing {
                    *existing = onset.onset_time;
                }
            }
            None => {
                map.insert(onset.stay_id.as_str(), onset.onset_time);
            }
        }
    }
    Cohort {
        onsets: map,
        duplicates,
    }
}

fn match_observations<'a>(
    cohort: &Cohort<'_>,
    observations: &'a [Observation],
    cfg: &FeatureWindowConfig,
    report: &mut MaterializeReport,
) -> Vec<MatchedObservation<'a>> {
    let matcher = SignalMatcher::new(cfg);
    let mut matched = Vec::new();
    for obs in observations {
        if !cohort.onsets.contains_key(obs.stay_id.as_str()) {
            report.dropped_outside_cohort += 1;
            continue;
        }
        let Some(value) = obs.value.filter(|v| v.is_finite()) else {
            report.dropped_missing_value += 1;
            continue;
        };
        let Some((signal, rank)) = matcher.lookup(&obs.type_code) else {
            report.dropped_unmatched += 1;
            continue;
        };
        if let Some(range) = cfg.signals[signal].value_range {
            if !range.contains(value) {
                report.dropped_out_of_range += 1;
                continue;
            }
        }
        matched.push(MatchedObservation {
            stay_id: &obs.stay_id,
            signal,
            rank,
            charttime: obs.charttime,
            value,
        });
    }
    matched
}

fn windows_for(
    cohort: &Cohort<'_>,
    matched: &[MatchedObservation<'_>],
    lookback: ChronoDuration,
) -> BTreeMap<String, StayWindow> {
    let mut first_seen: HashMap<&str, DateTime<Utc>> = HashMap::new();
    for obs in matched {
        first_seen
            .entry(obs.stay_id)
            .and_modify(|first| {
                if obs.charttime < *first {
                    *first = obs.charttime;
                }
            })
            .or_insert(obs.charttime);
    }

    cohort
        .onsets
        .iter()
        .filter_map(|(stay_id, onset)| {
            let first = *first_seen.get(stay_id)?;
            Some((
                (*stay_id).to_string(),
                StayWindow {
                    stay_id: (*stay_id).to_string(),
                    onset_time: *onset,
                    first_observation_time: first,
                    window_start: onset
                        .checked_sub_signed(lookback)
                        .map_or(first, |start| std::cmp::max(start, first)),
                },
            ))
        })
        .collect()
}

/// Per-stay window bounds. Stays with no usable observation get no window.
pub fn resolve_stay_windows(
    onsets: &[StayOnset],
    observations: &[Observation],
    cfg: &FeatureWindowConfig,
) -> Result<Vec<StayWindow>, FeatureWindowError> {
    cfg.validate()?;
    let cohort = build_cohort(onsets);
    let mut report = MaterializeReport::default();
    let matched = match_observations(&cohort, observations, cfg, &mut report);
    let mut windows: Vec<StayWindow> = windows_for(&cohort, &matched, cfg.lookback())
        .into_values()
        .collect();
    windows.sort_by(|a, b| stay_order(&a.stay_id).cmp(&stay_order(&b.stay_id)));
    Ok(windows)
}

/// Integer-like stay ids sort numerically ahead of any other id, which sort
/// as text.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum StayOrder<'a> {
    Numeric(i64, &'a str),
    Text(&'a str),
}

fn stay_order(stay_id: &str) -> StayOrder<'_> {
    match stay_id.parse::<i64>() {
        Ok(id) => StayOrder::Numeric(id, stay_id),
        Err(_) => StayOrder::Text(stay_id),
    }
}

type GroupKey = (String, usize, DateTime<Utc>);

pub fn materialize_features(
    onsets: &[StayOnset],
    observations: &[Observation],
    cfg: &FeatureWindowConfig,
) -> Result<(Vec<BinFeatureRecord>, MaterializeReport), FeatureWindowError> {
    cfg.validate()?;

    info!(
        component = "pipeline",
        event = "pipeline.materialize.start",
        onsets = onsets.len(),
        observations = observations.len(),
        lookback_hours = cfg.lookback_hours,
        bin_size_minutes = cfg.bin_size_minutes,
        anchor = ?cfg.anchor,
        dense_grid = cfg.dense_grid
    );

    let bin_size = cfg.bin_size();
    let cohort = build_cohort(onsets);
    let mut report = MaterializeReport {
        stays_in_cohort: cohort.onsets.len() as u64,
        duplicate_onsets: cohort.duplicates,
        input_observations: observations.len() as u64,
        ..MaterializeReport::default()
    };

    let matched = match_observations(&cohort, observations, cfg, &mut report);
    let windows = windows_for(&cohort, &matched, cfg.lookback());
    report.stays_with_window = windows.len() as u64;

    // (stay, signal, bin) -> rank -> accumulator; the lowest rank wins fusion.
    let mut groups: BTreeMap<GroupKey, BTreeMap<u32, BinAccumulator>> = BTreeMap::new();
    for obs in &matched {
        let Some(window) = windows.get(obs.stay_id) else {
            continue;
        };
        if obs.charttime < window.window_start || obs.charttime > window.onset_time {
            report.dropped_outside_window += 1;
            continue;
        }
        report.used_observations += 1;
        let bin_start = cfg.anchor.bin_start(obs.charttime, window.onset_time, bin_size);
        groups
            .entry((obs.stay_id.to_string(), obs.signal, bin_start))
            .or_default()
            .entry(obs.rank)
            .and_modify(|acc| acc.push(obs.charttime, obs.value))
            .or_insert_with(|| BinAccumulator::new(obs.charttime, obs.value));
    }

    if cfg.dense_grid {
        for window in windows.values() {
            if window.window_start > window.onset_time {
                continue;
            }
            let first_bin = cfg
                .anchor
                .bin_start(window.window_start, window.onset_time, bin_size);
            let last_bin = cfg
                .anchor
                .bin_start(window.onset_time, window.onset_time, bin_size);
            for signal_idx in 0..cfg.signals.len() {
                let mut bin_start = first_bin;
                while bin_start <= last_bin {
                    groups
                        .entry((window.stay_id.clone(), signal_idx, bin_start))
                        .or_default();
                    bin_start += bin_size;
                }
            }
        }
    }

    let mut records = Vec::with_capacity(groups.len());
    for ((stay_id, signal_idx, bin_start), by_rank) in groups {
        let Some(window) = windows.get(&stay_id) else {
            continue;
        };
        let signal = &cfg.signals[signal_idx];
        let winner = by_rank.into_iter().next();
        let reference = match (cfg.reference_time, &winner) {
            (ReferenceTime::LastObservation, Some((_, acc))) => acc.last.0,
            _ => bin_start,
        };

        let mut record = BinFeatureRecord {
            stay_id,
            signal: signal.name.clone(),
            modality: None,
            vital_source_type: None,
            bin_start,
            bin_end: bin_start + bin_size,
            minutes_from_onset: (reference - window.onset_time).num_minutes(),
            count_val: 0,
            min_val: None,
            max_val: None,
            mean_val: None,
            std_val: None,
            first_val: None,
            first_time: None,
            last_val: None,
            last_time: None,
            slope: None,
            prev_last_val: None,
            delta_last: None,
            label: POSITIVE_LABEL,
        };

        if let Some((rank, acc)) = winner {
            record.modality = signal
                .modalities
                .get(rank as usize - 1)
                .map(|m| m.name.clone());
            record.vital_source_type = Some(rank);
            record.count_val = acc.count;
            record.min_val = Some(acc.min);
            record.max_val = Some(acc.max);
            record.mean_val = Some(acc.mean);
            record.std_val = acc.std_sample();
            record.first_val = Some(acc.first.1);
            record.first_time = Some(acc.first.0);
            record.last_val = Some(acc.last.1);
            record.last_time = Some(acc.last.0);
            record.slope = acc.slope();
        }

        records.push(record);
    }

    records.sort_by(|a, b| {
        stay_order(&a.stay_id)
            .cmp(&stay_order(&b.stay_id))
            .then_with(|| a.signal.cmp(&b.signal))
            .then_with(|| a.bin_start.cmp(&b.bin_start))
    });
    apply_lag(&mut records);

    report.output_records = records.len() as u64;

    debug!(
        component = "pipeline",
        event = "pipeline.materialize.drops",
        dropped_outside_cohort = report.dropped_outside_cohort,
        dropped_missing_value = report.dropped_missing_value,
        dropped_unmatched = report.dropped_unmatched,
        dropped_out_of_range = report.dropped_out_of_range,
        dropped_outside_window = report.dropped_outside_window
    );
    info!(
        component = "pipeline",
        event = "pipeline.materialize.finish",
        stays_in_cohort = report.stays_in_cohort,
        stays_with_window = report.stays_with_window,
        used_observations = report.used_observations,
        output_records = report.output_records
    );

    Ok((records, report))
}

/// Records must already be ordered by (stay, signal, bin_start).
fn apply_lag(records: &mut [BinFeatureRecord]) {
    let mut previous: Option<(String, String, Option<f64>)> = None;
    for record in records.iter_mut() {
        record.prev_last_val = match &previous {
            Some((stay_id, signal, last_val))
                if *stay_id == record.stay_id && *signal == record.signal =>
            {
                *last_val
            }
            _ => None,
        };
        record.delta_last = match (record.last_val, record.prev_last_val) {
            (Some(last), Some(prev)) => Some(last - prev),
            _ => None,
        };
        previous = Some((
            record.stay_id.clone(),
            record.signal.clone(),
            record.last_val,
        ));
    }
}
