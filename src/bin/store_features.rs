use std::fs::File;
use std::io;
use std::path::PathBuf;

use sepsis_seq::{
    init_logging, load_cli_config, log_app_start, log_output_written, logging_config_from_env,
    materialize_store_features, write_features_csv,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging = logging_config_from_env();
    init_logging(&logging)?;

    let cfg = load_cli_config()?;
    log_app_start("store_features", &logging, &cfg);

    let store_path = std::env::var("SEPSIS_SEQ_STORE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data/icu_store.sqlite"));
    let output_path = std::env::var("SEPSIS_SEQ_OUTPUT_CSV").ok().map(PathBuf::from);

    let (records, report) = materialize_store_features(&store_path, &cfg)?;
    eprintln!(
        "stays={} with_window={} used_observations={} records={}",
        report.stays_in_cohort,
        report.stays_with_window,
        report.used_observations,
        report.output_records
    );

    match &output_path {
        Some(path) => write_features_csv(File::create(path)?, &records)?,
        None => write_features_csv(io::stdout().lock(), &records)?,
    }
    log_output_written("store_features", output_path.as_deref(), records.len());

    Ok(())
}
