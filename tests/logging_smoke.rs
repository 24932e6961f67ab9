use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};
use sepsis_seq::{
    build_feature_table, log_app_start, log_output_written, materialize_features,
    standard_vitals, FeatureWindowConfig, LoggingConfig, ModalitySpec, Observation, SignalSpec,
    StayOnset, TableRef, TypeCode,
};
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

fn vitals_config() -> FeatureWindowConfig {
    FeatureWindowConfig::new(
        TableRef::new("cohort"),
        TableRef::new("icu.chartevents"),
        standard_vitals(),
    )
}

#[test]
fn query_build_emits_start_and_finish_events() {
    let logs = capture_logs(Level::INFO, || {
        build_feature_table(&vitals_config()).expect("preset config should build");
    });

    assert!(logs.contains("\"event\":\"query.build.start\""));
    assert!(logs.contains("\"event\":\"query.build.finish\""));
    assert!(logs.contains("\"component\":\"query\""));
}

#[test]
fn empty_type_code_set_logs_a_warning() {
    let cfg = FeatureWindowConfig::new(
        TableRef::new("cohort"),
        TableRef::new("icu.chartevents"),
        vec![SignalSpec::multi(
            "sbp",
            vec![ModalitySpec::new("arterial", Vec::<i64>::new())],
        )],
    );
    let logs = capture_logs(Level::WARN, || {
        build_feature_table(&cfg).expect("empty sets are not fatal");
    });

    assert!(logs.contains("\"event\":\"query.config.empty_type_codes\""));
    assert!(!logs.contains("query.build.start"));
}

#[test]
fn materialize_logs_summary_and_debug_drop_counts() {
    let onset_time = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
    let onsets = vec![StayOnset {
        stay_id: "S1".to_string(),
        onset_time,
    }];
    let observations = vec![Observation {
        stay_id: "S1".to_string(),
        charttime: Utc.with_ymd_and_hms(2024, 1, 1, 9, 58, 0).unwrap(),
        type_code: TypeCode::Numeric(220045),
        value: Some(80.0),
    }];

    let info_logs = capture_logs(Level::INFO, || {
        materialize_features(&onsets, &observations, &vitals_config())
            .expect("materialize should succeed");
    });
    assert!(info_logs.contains("\"event\":\"pipeline.materialize.start\""));
    assert!(info_logs.contains("\"event\":\"pipeline.materialize.finish\""));
    assert!(info_logs.contains("\"output_records\":1"));
    assert!(!info_logs.contains("pipeline.materialize.drops"));

    let debug_logs = capture_logs(Level::DEBUG, || {
        materialize_features(&onsets, &observations, &vitals_config())
            .expect("materialize should succeed");
    });
    assert!(debug_logs.contains("\"event\":\"pipeline.materialize.drops\""));
}

#[test]
fn binary_lifecycle_helpers_emit_baseline_events() {
    let logs = capture_logs(Level::INFO, || {
        let logging = LoggingConfig::default();
        log_app_start("feature_query", &logging, &vitals_config());
        log_output_written("store_features", Some(Path::new("out/features.csv")), 12);
        log_output_written("store_features", None, 0);
    });

    assert!(logs.contains("\"event\":\"app.start\""));
    assert!(logs.contains("\"onset_source\":\"cohort\""));
    assert!(logs.contains("\"event\":\"app.output.written\""));
    assert!(logs.contains("\"destination\":\"out/features.csv\""));
    assert!(logs.contains("\"destination\":\"stdout\""));
}
