//! Logging setup plus the start and report events of the `build_features` binary.

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::range::RunContext;
use crate::run::RunReport;
use crate::store::{non_blank_var, StoreConfig};

const LOG_LEVEL_VAR: &str = "DAILY_FEATURES_LOG_LEVEL";
const LOG_FORMAT_VAR: &str = "DAILY_FEATURES_LOG_FORMAT";
const LOG_TARGET_VAR: &str = "DAILY_FEATURES_LOG_TARGET";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            _ => None,
        }
    }
}

/// Subscriber settings. `level` is an `EnvFilter` directive such as `info`
/// or `daily_features=debug`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("a global subscriber is already installed: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Unset, blank or unrecognized variables keep their default.
pub fn logging_config_from_env() -> LoggingConfig {
    let defaults = LoggingConfig::default();
    LoggingConfig {
        level: non_blank_var(LOG_LEVEL_VAR).unwrap_or(defaults.level),
        format: non_blank_var(LOG_FORMAT_VAR)
            .and_then(|raw| LogFormat::parse(&raw))
            .unwrap_or(defaults.format),
        include_target: non_blank_var(LOG_TARGET_VAR)
            .and_then(|raw| parse_bool(&raw))
            .unwrap_or(defaults.include_target),
    }
}

/// Install the global subscriber. Fails if one is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.include_target);

    match config.format {
        LogFormat::Json => {
            tracing::subscriber::set_global_default(fmt.with_ansi(false).json().finish())?
        }
        LogFormat::Pretty => tracing::subscriber::set_global_default(fmt.pretty().finish())?,
    }
    Ok(())
}

pub fn log_app_start(config: &LoggingConfig, store: &StoreConfig, ctx: &RunContext) {
    info!(
        component = "build_features",
        event = "app.start",
        log_level = %config.level,
        log_format = ?config.format,
        raw_store = %store.raw_store_path.display(),
        feature_store = %store.feature_store_path.display(),
        ticker = %ctx.ticker,
        mode = ctx.mode.as_str(),
        run_id = %ctx.run_id,
        overwrite = ctx.overwrite
    );
}

pub fn log_run_report(report: &RunReport) {
    info!(
        component = "build_features",
        event = "app.report",
        ticker = %report.ticker,
        run_id = %report.run_id,
        policy = report.policy.as_str(),
        start_date = %report.resolved_start_date,
        end_date = %report.resolved_end_date,
        rows_affected = report.rows_affected,
        duration_secs = report.duration.as_secs_f64()
    );
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn config_with(level: &str, format: &str, target: &str) -> LoggingConfig {
        let _guard = ENV_LOCK.lock().expect("env lock should not be poisoned");
        env::set_var(LOG_LEVEL_VAR, level);
        env::set_var(LOG_FORMAT_VAR, format);
        env::set_var(LOG_TARGET_VAR, target);
        let cfg = logging_config_from_env();
        for key in [LOG_LEVEL_VAR, LOG_FORMAT_VAR, LOG_TARGET_VAR] {
            env::remove_var(key);
        }
        cfg
    }

    #[test]
    fn env_overrides_level_format_and_target() {
        let cfg = config_with("daily_features=debug", " JSON ", "off");
        assert_eq!(cfg.level, "daily_features=debug");
        assert_eq!(cfg.format, LogFormat::Json);
        assert!(!cfg.include_target);
    }

    #[test]
    fn blank_or_unknown_values_keep_defaults() {
        assert_eq!(config_with("  ", "yaml", "maybe"), LoggingConfig::default());
    }

    #[test]
    fn bool_spellings() {
        assert_eq!(parse_bool("Yes"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
