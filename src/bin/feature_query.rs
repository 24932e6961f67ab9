use sepsis_seq::{
    build_feature_table, init_logging, load_cli_config, log_app_start, logging_config_from_env,
};
use tracing::warn;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging = logging_config_from_env();
    init_logging(&logging)?;

    let cfg = load_cli_config()?;
    log_app_start("feature_query", &logging, &cfg);

    let spec = build_feature_table(&cfg)?;
    for warning in &spec.warnings {
        warn!(
            component = "feature_query",
            event = "query.warning",
            warning = %warning
        );
    }

    println!("-- fingerprint: {}", spec.fingerprint);
    println!("{}", spec.sql);
    Ok(())
}
