//! Feature-window configuration surface and validation.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::catalog::{
    blood_pressure_signals, chartevents_table, standard_vitals, DEFAULT_ICU_DATASET,
    DEFAULT_ONSET_TABLE,
};
use crate::observability::parse_bool;

pub const DEFAULT_LOOKBACK_HOURS: u32 = 12;
pub const DEFAULT_BIN_SIZE_MINUTES: u32 = 15;
pub const DEFAULT_MODALITY: &str = "default";

pub const MAX_LOOKBACK_HOURS: u32 = 24 * 366 * 100;

const MINUTES_PER_DAY: u32 = 1_440;

#[derive(Debug, Error)]
pub enum FeatureWindowError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("query fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },
    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Non-fatal findings from [`FeatureWindowConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigWarning {
    /// The modality matches nothing; it contributes zero observations.
    EmptyTypeCodeSet { signal: String, modality: String },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyTypeCodeSet { signal, modality } => write!(
                f,
                "signal '{signal}' modality '{modality}' has no type codes and matches nothing"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableRef(pub String);

impl TableRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnsetColumns {
    pub stay_id: String,
    pub onset_time: String,
}

impl Default for OnsetColumns {
    fn default() -> Self {
        Self {
            stay_id: "stay_id".to_string(),
            onset_time: "sofa_time".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservationColumns {
    pub stay_id: String,
    pub time: String,
    pub type_code: String,
    pub value: String,
}

impl Default for ObservationColumns {
    fn default() -> Self {
        Self {
            stay_id: "stay_id".to_string(),
            time: "charttime".to_string(),
            type_code: "itemid".to_string(),
            value: "valuenum".to_string(),
        }
    }
}

/// Observation type code: a warehouse item id or a symbolic code.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeCode {
    Numeric(i64),
    Symbolic(String),
}

impl fmt::Display for TypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(code) => write!(f, "{code}"),
            Self::Symbolic(code) => f.write_str(code),
        }
    }
}

impl From<i64> for TypeCode {
    fn from(code: i64) -> Self {
        Self::Numeric(code)
    }
}

impl From<&str> for TypeCode {
    fn from(code: &str) -> Self {
        Self::Symbolic(code.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModalitySpec {
    pub name: String,
    #[serde(default)]
    pub type_codes: BTreeSet<TypeCode>,
}

impl ModalitySpec {
    pub fn new<C: Into<TypeCode>>(
        name: impl Into<String>,
        type_codes: impl IntoIterator<Item = C>,
    ) -> Self {
        Self {
            name: name.into(),
            type_codes: type_codes.into_iter().map(Into::into).collect(),
        }
    }
}

/// Inclusive physiologic plausibility bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// One physiological signal. Modality order is fusion priority: the first
/// modality with data in a bin wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSpec {
    pub name: String,
    pub modalities: Vec<ModalitySpec>,
    #[serde(default)]
    pub value_range: Option<ValueRange>,
}

impl SignalSpec {
    pub fn single<C: Into<TypeCode>>(
        name: impl Into<String>,
        type_codes: impl IntoIterator<Item = C>,
    ) -> Self {
        Self {
            name: name.into(),
            modalities: vec![ModalitySpec::new(DEFAULT_MODALITY, type_codes)],
            value_range: None,
        }
    }

    pub fn multi(name: impl Into<String>, modalities: Vec<ModalitySpec>) -> Self {
        Self {
            name: name.into(),
            modalities,
            value_range: None,
        }
    }

    pub fn with_value_range(mut self, min: f64, max: f64) -> Self {
        self.value_range = Some(ValueRange::new(min, max));
        self
    }

    /// 1-based priority rank, reported as `vital_source_type`.
    pub fn source_rank(&self, modality: &str) -> Option<u32> {
        self.modalities
            .iter()
            .position(|m| m.name == modality)
            .map(|idx| idx as u32 + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinAnchor {
    /// Grid of `bin_size` steps anchored on the stay's onset time.
    #[default]
    OnsetRelative,
    /// Grid anchored on the epoch (wall-clock multiples of `bin_size`).
    ClockAligned,
}

impl BinAnchor {
    pub fn bin_start(
        self,
        ts: DateTime<Utc>,
        onset: DateTime<Utc>,
        bin_size: ChronoDuration,
    ) -> DateTime<Utc> {
        match self {
            Self::OnsetRelative => {
                let bin_ms = bin_size.num_milliseconds();
                let offset_ms = (ts - onset).num_milliseconds();
                onset + ChronoDuration::milliseconds(offset_ms.div_euclid(bin_ms) * bin_ms)
            }
            Self::ClockAligned => {
                let bin_s = bin_size.num_seconds();
                ts - ChronoDuration::seconds(ts.timestamp().rem_euclid(bin_s))
                    - ChronoDuration::nanoseconds(i64::from(ts.timestamp_subsec_nanos()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceTime {
    #[default]
    BinStart,
    LastObservation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureWindowConfig {
    pub onset_source: TableRef,
    pub observation_source: TableRef,
    #[serde(default)]
    pub onset_columns: OnsetColumns,
    #[serde(default)]
    pub observation_columns: ObservationColumns,
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: u32,
    #[serde(default = "default_bin_size_minutes")]
    pub bin_size_minutes: u32,
    #[serde(default)]
    pub anchor: BinAnchor,
    #[serde(default)]
    pub reference_time: ReferenceTime,
    /// Emit empty placeholder bins across the whole window.
    #[serde(default)]
    pub dense_grid: bool,
    pub signals: Vec<SignalSpec>,
}

fn default_lookback_hours() -> u32 {
    DEFAULT_LOOKBACK_HOURS
}

fn default_bin_size_minutes() -> u32 {
    DEFAULT_BIN_SIZE_MINUTES
}

impl FeatureWindowConfig {
    pub fn new(
        onset_source: TableRef,
        observation_source: TableRef,
        signals: Vec<SignalSpec>,
    ) -> Self {
        Self {
            onset_source,
            observation_source,
            onset_columns: OnsetColumns::default(),
            observation_columns: ObservationColumns::default(),
            lookback_hours: DEFAULT_LOOKBACK_HOURS,
            bin_size_minutes: DEFAULT_BIN_SIZE_MINUTES,
            anchor: BinAnchor::default(),
            reference_time: ReferenceTime::default(),
            dense_grid: false,
            signals,
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, FeatureWindowError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, FeatureWindowError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn lookback(&self) -> ChronoDuration {
        ChronoDuration::hours(i64::from(self.lookback_hours))
    }

    pub fn bin_size(&self) -> ChronoDuration {
        ChronoDuration::minutes(i64::from(self.bin_size_minutes))
    }

    pub fn all_type_codes(&self) -> BTreeSet<TypeCode> {
        self.signals
            .iter()
            .flat_map(|s| s.modalities.iter())
            .flat_map(|m| m.type_codes.iter().cloned())
            .collect()
    }

    pub fn validate(&self) -> Result<Vec<ConfigWarning>, FeatureWindowError> {
        if self.lookback_hours == 0 {
            return Err(invalid("lookback_hours must be > 0"));
        }
        if self.lookback_hours > MAX_LOOKBACK_HOURS {
            return Err(invalid(format!(
                "lookback_hours must be <= {MAX_LOOKBACK_HOURS}, got {}",
                self.lookback_hours
            )));
        }
        if self.bin_size_minutes == 0 {
            return Err(invalid("bin_size_minutes must be > 0"));
        }
        if u64::from(self.bin_size_minutes) > u64::from(self.lookback_hours) * 60 {
            return Err(invalid("bin_size_minutes must not exceed the lookback window"));
        }
        if self.anchor == BinAnchor::ClockAligned && MINUTES_PER_DAY % self.bin_size_minutes != 0
        {
            return Err(invalid(format!(
                "clock-aligned bin_size_minutes must divide {MINUTES_PER_DAY}, got {}",
                self.bin_size_minutes
            )));
        }
        if self.signals.is_empty() {
            return Err(invalid("at least one signal must be configured"));
        }

        let mut warnings = Vec::new();
        let mut signal_names = HashSet::new();
        let mut claimed: HashMap<&TypeCode, (&str, &str)> = HashMap::new();
        let mut saw_numeric = false;
        let mut saw_symbolic = false;

        for signal in &self.signals {
            if signal.name.trim().is_empty() {
                return Err(invalid("signal names must not be empty"));
            }
            if !signal_names.insert(signal.name.as_str()) {
                return Err(invalid(format!("duplicate signal '{}'", signal.name)));
            }
            if signal.modalities.is_empty() {
                return Err(invalid(format!(
                    "signal '{}' has no modalities",
                    signal.name
                )));
            }
            if let Some(range) = signal.value_range {
                if !range.min.is_finite() || !range.max.is_finite() {
                    return Err(invalid(format!(
                        "signal '{}' value range bounds must be finite",
                        signal.name
                    )));
                }
                if range.min > range.max {
                    return Err(invalid(format!(
                        "signal '{}' value_min {} exceeds value_max {}",
                        signal.name, range.min, range.max
                    )));
                }
            }

            let mut modality_names = HashSet::new();
            for modality in &signal.modalities {
                if modality.name.trim().is_empty() {
                    return Err(invalid(format!(
                        "signal '{}' has a modality with an empty name",
                        signal.name
                    )));
                }
                if !modality_names.insert(modality.name.as_str()) {
                    return Err(invalid(format!(
                        "signal '{}' lists modality '{}' twice",
                        signal.name, modality.name
                    )));
                }
                if modality.type_codes.is_empty() {
                    warn!(
                        component = "config",
                        event = "query.config.empty_type_codes",
                        signal = %signal.name,
                        modality = %modality.name
                    );
                    warnings.push(ConfigWarning::EmptyTypeCodeSet {
                        signal: signal.name.clone(),
                        modality: modality.name.clone(),
                    });
                }

                for code in &modality.type_codes {
                    match code {
                        TypeCode::Numeric(_) => saw_numeric = true,
                        TypeCode::Symbolic(raw) => {
                            if raw.trim().is_empty() {
                                return Err(invalid("symbolic type codes must not be empty"));
                            }
                            saw_symbolic = true;
                        }
                    }
                    if let Some((other_signal, other_modality)) =
                        claimed.insert(code, (signal.name.as_str(), modality.name.as_str()))
                    {
                        return Err(invalid(format!(
                            "type code {code} is claimed by {other_signal}/{other_modality} and {}/{}",
                            signal.name, modality.name
                        )));
                    }
                }
            }
        }

        if saw_numeric && saw_symbolic {
            return Err(invalid(
                "type codes must be all numeric or all symbolic, not a mix",
            ));
        }

        Ok(warnings)
    }

    /// Applies `SEPSIS_SEQ_*` overrides. Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(table) = non_empty_env("SEPSIS_SEQ_ONSET_TABLE") {
            self.onset_source = TableRef::new(table);
        }
        if let Some(table) = non_empty_env("SEPSIS_SEQ_OBSERVATION_TABLE") {
            self.observation_source = TableRef::new(table);
        }
        if let Some(hours) = non_empty_env("SEPSIS_SEQ_LOOKBACK_HOURS")
            .and_then(|raw| raw.parse::<u32>().ok())
        {
            self.lookback_hours = hours;
        }
        if let Some(minutes) =
            non_empty_env("SEPSIS_SEQ_BIN_MINUTES").and_then(|raw| raw.parse::<u32>().ok())
        {
            self.bin_size_minutes = minutes;
        }
        if let Some(anchor) = non_empty_env("SEPSIS_SEQ_ANCHOR").and_then(|raw| parse_anchor(&raw))
        {
            self.anchor = anchor;
        }
        if let Some(reference) =
            non_empty_env("SEPSIS_SEQ_REFERENCE").and_then(|raw| parse_reference(&raw))
        {
            self.reference_time = reference;
        }
        if let Some(dense) = non_empty_env("SEPSIS_SEQ_DENSE_GRID").and_then(|raw| parse_bool(&raw))
        {
            self.dense_grid = dense;
        }
    }
}

pub fn config_from_env(base: FeatureWindowConfig) -> FeatureWindowConfig {
    let mut config = base;
    config.apply_env_overrides();
    config
}

/// Base config for the binaries: `SEPSIS_SEQ_CONFIG` (JSON file) when set,
/// otherwise the `SEPSIS_SEQ_PRESET` catalog preset, then env overrides.
pub fn load_cli_config() -> Result<FeatureWindowConfig, FeatureWindowError> {
    let base = match non_empty_env("SEPSIS_SEQ_CONFIG") {
        Some(path) => FeatureWindowConfig::from_json_file(Path::new(&path))?,
        None => {
            let signals = match non_empty_env("SEPSIS_SEQ_PRESET").as_deref() {
                None | Some("vitals") => standard_vitals(),
                Some("blood_pressure") => blood_pressure_signals(),
                Some(other) => {
                    return Err(invalid(format!(
                        "unknown SEPSIS_SEQ_PRESET '{other}' (expected vitals or blood_pressure)"
                    )))
                }
            };
            FeatureWindowConfig::new(
                TableRef::new(DEFAULT_ONSET_TABLE),
                chartevents_table(DEFAULT_ICU_DATASET),
                signals,
            )
        }
    };
    Ok(config_from_env(base))
}

fn invalid(message: impl Into<String>) -> FeatureWindowError {
    FeatureWindowError::InvalidConfiguration(message.into())
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn parse_anchor(raw: &str) -> Option<BinAnchor> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "onset" | "onset_relative" => Some(BinAnchor::OnsetRelative),
        "clock" | "clock_aligned" => Some(BinAnchor::ClockAligned),
        _ => None,
    }
}

fn parse_reference(raw: &str) -> Option<ReferenceTime> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "bin_start" => Some(ReferenceTime::BinStart),
        "last_obs" | "last_observation" => Some(ReferenceTime::LastObservation),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::{Mutex, OnceLock};

    const OVERRIDE_KEYS: [&str; 7] = [
        "SEPSIS_SEQ_ONSET_TABLE",
        "SEPSIS_SEQ_OBSERVATION_TABLE",
        "SEPSIS_SEQ_LOOKBACK_HOURS",
        "SEPSIS_SEQ_BIN_MINUTES",
        "SEPSIS_SEQ_ANCHOR",
        "SEPSIS_SEQ_REFERENCE",
        "SEPSIS_SEQ_DENSE_GRID",
    ];

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn with_env_vars<R>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> R) -> R {
        let _guard = env_lock().lock().expect("env lock should not be poisoned");
        let previous: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, _)| ((*key).to_string(), env::var(key).ok()))
            .collect();

        for (key, value) in vars {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        let output = f();

        for (key, value) in previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        output
    }

    fn sample_config() -> FeatureWindowConfig {
        FeatureWindowConfig::new(
            TableRef::new("proj.cohort.sepsis3"),
            TableRef::new("proj.icu.chartevents"),
            vec![
                SignalSpec::single("heart_rate", [220045_i64]),
                SignalSpec::multi(
                    "sbp",
                    vec![
                        ModalitySpec::new("arterial", [220050_i64]),
                        ModalitySpec::new("cuff", [220179_i64]),
                    ],
                )
                .with_value_range(0.0, 300.0),
            ],
        )
    }

    fn expect_invalid(cfg: &FeatureWindowConfig, needle: &str) {
        match cfg.validate() {
            Err(FeatureWindowError::InvalidConfiguration(message)) => {
                assert!(message.contains(needle), "message={message}")
            }
            other => panic!("expected InvalidConfiguration, got {other:?}"),
        }
    }

    #[test]
    fn sample_config_is_valid_without_warnings() {
        assert_eq!(sample_config().validate().unwrap(), Vec::new());
    }

    #[test]
    fn rejects_non_positive_intervals() {
        let mut cfg = sample_config();
        cfg.lookback_hours = 0;
        expect_invalid(&cfg, "lookback_hours");

        let mut cfg = sample_config();
        cfg.bin_size_minutes = 0;
        expect_invalid(&cfg, "bin_size_minutes");

        let mut cfg = sample_config();
        cfg.lookback_hours = 1;
        cfg.bin_size_minutes = 90;
        expect_invalid(&cfg, "exceed");
    }

    #[test]
    fn rejects_unbounded_lookback() {
        let mut cfg = sample_config();
        cfg.lookback_hours = u32::MAX;
        expect_invalid(&cfg, "lookback_hours must be <=");

        cfg.lookback_hours = MAX_LOOKBACK_HOURS;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn clock_aligned_bins_must_divide_a_day() {
        let mut cfg = sample_config();
        cfg.anchor = BinAnchor::ClockAligned;
        cfg.bin_size_minutes = 7;
        expect_invalid(&cfg, "must divide 1440");

        cfg.anchor = BinAnchor::OnsetRelative;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_inverted_or_non_finite_value_range() {
        let mut cfg = sample_config();
        cfg.signals[1].value_range = Some(ValueRange::new(300.0, 0.0));
        expect_invalid(&cfg, "exceeds value_max");

        cfg.signals[1].value_range = Some(ValueRange::new(0.0, f64::INFINITY));
        expect_invalid(&cfg, "finite");
    }

    #[test]
    fn rejects_overlapping_type_codes() {
        let mut cfg = sample_config();
        cfg.signals[1].modalities[1]
            .type_codes
            .insert(TypeCode::Numeric(220050));
        expect_invalid(&cfg, "claimed by sbp/arterial and sbp/cuff");

        let mut cfg = sample_config();
        cfg.signals.push(SignalSpec::single("hr_copy", [220045_i64]));
        expect_invalid(&cfg, "claimed by heart_rate/default");
    }

    #[test]
    fn rejects_duplicate_names_and_mixed_code_kinds() {
        let mut cfg = sample_config();
        cfg.signals.push(SignalSpec::single("sbp", [1_i64]));
        expect_invalid(&cfg, "duplicate signal");

        let mut cfg = sample_config();
        cfg.signals.push(SignalSpec::single("note", ["hr_text"]));
        expect_invalid(&cfg, "not a mix");

        let mut cfg = sample_config();
        cfg.signals.clear();
        expect_invalid(&cfg, "at least one signal");
    }

    #[test]
    fn empty_type_code_set_is_a_warning_not_an_error() {
        let mut cfg = sample_config();
        cfg.signals[1].modalities[1].type_codes.clear();
        let warnings = cfg.validate().expect("empty set is not fatal");
        assert_eq!(
            warnings,
            vec![ConfigWarning::EmptyTypeCodeSet {
                signal: "sbp".to_string(),
                modality: "cuff".to_string(),
            }]
        );
    }

    #[test]
    fn json_config_fills_explicit_defaults() {
        let cfg = FeatureWindowConfig::from_json_str(
            r#"{
                "onset_source": "proj.cohort.sepsis3",
                "observation_source": "proj.icu.chartevents",
                "signals": [
                    {"name": "sbp", "modalities": [
                        {"name": "arterial", "type_codes": [220050]},
                        {"name": "cuff", "type_codes": [220179]}
                    ], "value_range": {"min": 0, "max": 300}}
                ]
            }"#,
        )
        .expect("parse config");

        assert_eq!(cfg.lookback_hours, DEFAULT_LOOKBACK_HOURS);
        assert_eq!(cfg.bin_size_minutes, DEFAULT_BIN_SIZE_MINUTES);
        assert_eq!(cfg.anchor, BinAnchor::OnsetRelative);
        assert_eq!(cfg.reference_time, ReferenceTime::BinStart);
        assert_eq!(cfg.onset_columns.onset_time, "sofa_time");
        assert_eq!(cfg.signals[0].source_rank("cuff"), Some(2));
        assert_eq!(cfg.signals[0].value_range, Some(ValueRange::new(0.0, 300.0)));
    }

    #[test]
    fn env_overrides_replace_fields_and_ignore_garbage() {
        let cfg = with_env_vars(
            &[
                ("SEPSIS_SEQ_ONSET_TABLE", Some("other.cohort")),
                ("SEPSIS_SEQ_OBSERVATION_TABLE", None),
                ("SEPSIS_SEQ_LOOKBACK_HOURS", Some("24")),
                ("SEPSIS_SEQ_BIN_MINUTES", Some("not-a-number")),
                ("SEPSIS_SEQ_ANCHOR", Some("clock")),
                ("SEPSIS_SEQ_REFERENCE", Some("last_obs")),
                ("SEPSIS_SEQ_DENSE_GRID", Some("yes")),
            ],
            || config_from_env(sample_config()),
        );

        assert_eq!(cfg.onset_source, TableRef::new("other.cohort"));
        assert_eq!(cfg.observation_source, TableRef::new("proj.icu.chartevents"));
        assert_eq!(cfg.lookback_hours, 24);
        assert_eq!(cfg.bin_size_minutes, DEFAULT_BIN_SIZE_MINUTES);
        assert_eq!(cfg.anchor, BinAnchor::ClockAligned);
        assert_eq!(cfg.reference_time, ReferenceTime::LastObservation);
        assert!(cfg.dense_grid);
    }

    #[test]
    fn no_env_leaves_config_untouched() {
        let vars: Vec<(&str, Option<&str>)> = OVERRIDE_KEYS.iter().map(|k| (*k, None)).collect();
        let cfg = with_env_vars(&vars, || config_from_env(sample_config()));
        assert_eq!(cfg, sample_config());
    }

    #[test]
    fn onset_relative_bins_floor_toward_the_past() {
        let onset = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let bin = ChronoDuration::minutes(15);
        let at = |h, m| Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap();

        assert_eq!(
            BinAnchor::OnsetRelative.bin_start(at(9, 58), onset, bin),
            at(9, 45)
        );
        assert_eq!(
            BinAnchor::OnsetRelative.bin_start(at(9, 45), onset, bin),
            at(9, 45)
        );
        assert_eq!(BinAnchor::OnsetRelative.bin_start(onset, onset, bin), onset);
    }

    #[test]
    fn clock_aligned_bins_ignore_onset_offset() {
        let onset = Utc.with_ymd_and_hms(2024, 1, 1, 10, 7, 0).unwrap();
        let bin = ChronoDuration::minutes(15);
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 9, 58, 30).unwrap();
        assert_eq!(
            BinAnchor::ClockAligned.bin_start(ts, onset, bin),
            Utc.with_ymd_and_hms(2024, 1, 1, 9, 45, 0).unwrap()
        );
        assert_eq!(
            BinAnchor::OnsetRelative.bin_start(ts, onset, bin),
            Utc.with_ymd_and_hms(2024, 1, 1, 9, 52, 0).unwrap()
        );
    }
}
