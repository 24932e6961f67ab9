//! Positive-sequence feature windows for ICU chart events.
//!
//! Current implemented scope:
//! - feature-window configuration and validation
//! - BigQuery query generation for binned pre-onset vital features
//! - in-memory equivalent transform over extracted rows (SQLite / CSV)

mod catalog;
mod config;
mod export;
mod observability;
mod pipeline;
mod query;
mod store;

pub use catalog::{
    arterial_cuff_signal, blood_pressure_signals, chartevents_table, standard_vitals,
    DBP_ARTERIAL_ITEMS, DBP_CUFF_ITEMS, DBP_ITEMS, DEFAULT_ICU_DATASET, DEFAULT_ONSET_TABLE,
    HEART_RATE_ITEMS, MAP_ARTERIAL_ITEMS, MAP_CUFF_ITEMS, MAP_ITEMS, MODALITY_ARTERIAL,
    MODALITY_CUFF, RESP_RATE_ITEMS, SBP_ARTERIAL_ITEMS, SBP_CUFF_ITEMS, SBP_ITEMS, SPO2_ITEMS,
    TEMPERATURE_ITEMS,
};
pub use config::{
    config_from_env, load_cli_config, BinAnchor, ConfigWarning, FeatureWindowConfig,
    FeatureWindowError, ModalitySpec, ObservationColumns, OnsetColumns, ReferenceTime,
    SignalSpec, TableRef, TypeCode, ValueRange, DEFAULT_BIN_SIZE_MINUTES, DEFAULT_LOOKBACK_HOURS,
    DEFAULT_MODALITY, MAX_LOOKBACK_HOURS,
};
pub use export::{read_onsets_csv, write_features_csv, ExportError};
pub use observability::{
    init_logging, log_app_start, log_output_written, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use pipeline::{
    materialize_features, parse_timestamp, resolve_stay_windows, BinFeatureRecord,
    MaterializeReport, Observation, StayOnset, StayWindow,
};
pub use query::{
    assert_query_compatible, build_feature_table, output_columns, string_literal,
    type_code_membership, ColumnType, OutputColumn, QuerySpec, FEATURE_COLUMNS, POSITIVE_LABEL,
};
pub use store::{load_store_inputs, materialize_store_features, StoreError};
