//! Run context and date range resolution.

use chrono::NaiveDate;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::BuildError;
use crate::materialize::ConflictPolicy;
use crate::observability::parse_bool;
use crate::store::{non_blank_var, parse_stored_date, StoreConfig, PRICES_TABLE};

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    /// Process the ticker's whole raw history.
    Full,
    /// Process an explicit start/end range.
    ByDateRange,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::ByDateRange => "by-date-range",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "full" => Some(Self::Full),
            "by-date-range" | "by_date_range" => Some(Self::ByDateRange),
            _ => None,
        }
    }
}

/// Everything one invocation needs; never persisted beyond `run_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub mode: RunMode,
    pub ticker: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub run_id: String,
    pub overwrite: bool,
}

impl RunContext {
    pub fn full(ticker: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            mode: RunMode::Full,
            ticker: ticker.into(),
            start_date: None,
            end_date: None,
            run_id: run_id.into(),
            overwrite: false,
        }
    }

    pub fn by_date_range(
        ticker: impl Into<String>,
        start_date: NaiveDate,
        end_date: NaiveDate,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            mode: RunMode::ByDateRange,
            ticker: ticker.into(),
            start_date: Some(start_date),
            end_date: Some(end_date),
            run_id: run_id.into(),
            overwrite: false,
        }
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn policy(&self) -> ConflictPolicy {
        if self.overwrite {
            ConflictPolicy::Overwrite
        } else {
            ConflictPolicy::Skip
        }
    }

    /// Checks that need no store access.
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.ticker.trim().is_empty() {
            return Err(BuildError::InvalidRunContext(
                "ticker must not be empty".to_string(),
            ));
        }
        if self.run_id.trim().is_empty() {
            return Err(BuildError::InvalidRunContext(
                "run_id must not be empty".to_string(),
            ));
        }
        if self.mode == RunMode::ByDateRange {
            explicit_range(self)?;
        }
        Ok(())
    }
}

/// Run context from `DAILY_FEATURES_MODE`, `_TICKER`, `_START_DATE`,
/// `_END_DATE`, `_RUN_ID` and `_OVERWRITE`. Unrecognized values are errors,
/// never defaults.
pub fn run_context_from_env() -> Result<RunContext, BuildError> {
    let mode_raw = required_var("DAILY_FEATURES_MODE")?;
    let mode = RunMode::parse(&mode_raw).ok_or_else(|| {
        BuildError::InvalidRunContext(format!(
            "DAILY_FEATURES_MODE must be full or by-date-range, got '{mode_raw}'"
        ))
    })?;
    let overwrite = match non_blank_var("DAILY_FEATURES_OVERWRITE") {
        Some(raw) => parse_bool(&raw).ok_or_else(|| {
            BuildError::InvalidRunContext(format!(
                "DAILY_FEATURES_OVERWRITE must be true or false, got '{raw}'"
            ))
        })?,
        None => false,
    };

    Ok(RunContext {
        mode,
        ticker: required_var("DAILY_FEATURES_TICKER")?,
        start_date: optional_date("DAILY_FEATURES_START_DATE")?,
        end_date: optional_date("DAILY_FEATURES_END_DATE")?,
        run_id: required_var("DAILY_FEATURES_RUN_ID")?,
        overwrite,
    })
}

fn required_var(key: &str) -> Result<String, BuildError> {
    non_blank_var(key).ok_or_else(|| BuildError::InvalidRunContext(format!("{key} must be set")))
}

fn optional_date(key: &str) -> Result<Option<NaiveDate>, BuildError> {
    non_blank_var(key)
        .map(|raw| {
            NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                .map_err(|err| BuildError::InvalidRange(format!("{key} must be YYYY-MM-DD: {err}")))
        })
        .transpose()
}

/// Resolve the inclusive range to process.
///
/// Explicit ranges are not clamped to the available history; a range with no
/// raw rows simply derives nothing.
pub fn resolve_range(
    conn: &Connection,
    cfg: &StoreConfig,
    ctx: &RunContext,
) -> Result<DateRange, BuildError> {
    let range = match ctx.mode {
        RunMode::ByDateRange => explicit_range(ctx)?,
        RunMode::Full => history_bounds(conn, cfg, &ctx.ticker)?.ok_or_else(|| {
            BuildError::EmptyTickerHistory {
                ticker: ctx.ticker.clone(),
            }
        })?,
    };

    info!(
        component = "range",
        event = "features.range.resolved",
        ticker = %ctx.ticker,
        mode = ctx.mode.as_str(),
        start_date = %range.start,
        end_date = %range.end
    );

    Ok(range)
}

/// MIN/MAX readable date of the ticker's raw history.
pub fn history_bounds(
    conn: &Connection,
    cfg: &StoreConfig,
    ticker: &str,
) -> Result<Option<DateRange>, BuildError> {
    let sql = format!(
        "
        SELECT MIN(date(date)), MAX(date(date))
        FROM {ns}.{PRICES_TABLE}
        WHERE ticker = ?1
          AND date(date) IS NOT NULL
        ",
        ns = cfg.raw_namespace
    );
    let (min, max): (Option<String>, Option<String>) =
        conn.query_row(&sql, params![ticker], |row| Ok((row.get(0)?, row.get(1)?)))?;

    let bounds = match (
        min.as_deref().and_then(parse_stored_date),
        max.as_deref().and_then(parse_stored_date),
    ) {
        (Some(start), Some(end)) => Some(DateRange::new(start, end)),
        _ => None,
    };
    Ok(bounds)
}

fn explicit_range(ctx: &RunContext) -> Result<DateRange, BuildError> {
    match (ctx.start_date, ctx.end_date) {
        (Some(start), Some(end)) if start <= end => Ok(DateRange::new(start, end)),
        (Some(start), Some(end)) => Err(BuildError::InvalidRange(format!(
            "start_date {start} is after end_date {end}"
        ))),
        (None, _) => Err(BuildError::InvalidRange(
            "start_date is required in by-date-range mode".to_string(),
        )),
        (_, None) => Err(BuildError::InvalidRange(
            "end_date is required in by-date-range mode".to_string(),
        )),
    }
}
