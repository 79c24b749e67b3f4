use daily_features::{
    init_logging, log_app_start, log_run_report, logging_config_from_env, run_context_from_env,
    run_feature_build, store_config_from_env, FeatureStore,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;

    let store_cfg = store_config_from_env();
    let ctx = run_context_from_env()?;
    log_app_start(&logging_cfg, &store_cfg, &ctx);

    println!(
        "Processing ticker {} | mode={} run_id={} overwrite={}",
        ctx.ticker,
        ctx.mode.as_str(),
        ctx.run_id,
        ctx.overwrite
    );

    let mut store = FeatureStore::open(store_cfg)?;
    let report = run_feature_build(&mut store, &ctx)?;
    log_run_report(&report);

    println!("Rows inserted/updated: {}", report.rows_affected);
    println!("Duration: {:.2} seconds", report.duration.as_secs_f64());
    println!(
        "Date range processed: {} to {}",
        report.resolved_start_date, report.resolved_end_date
    );
    if report.malformed_rows > 0 {
        println!("Malformed raw rows (undefined features): {}", report.malformed_rows);
    }

    Ok(())
}
