//! One feature build run: resolve, derive, materialize, report.

use std::time::{Duration, Instant};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::BuildError;
use crate::features::{derive_features, EarningsCalendar};
use crate::materialize::{materialize_rows, ConflictPolicy};
use crate::range::{resolve_range, RunContext, RunMode};
use crate::schema::ensure_feature_schema;
use crate::store::{load_earnings_events, load_price_history, FeatureStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub ticker: String,
    pub run_id: String,
    pub mode: RunMode,
    pub policy: ConflictPolicy,
    pub resolved_start_date: NaiveDate,
    pub resolved_end_date: NaiveDate,
    pub rows_derived: u64,
    pub rows_affected: u64,
    pub malformed_rows: u64,
    pub duration: Duration,
}

/// Run the build for one ticker end to end.
///
/// Context validation happens before any store access. Everything after
/// schema initialization runs in a single transaction, so a failure leaves
/// the feature table exactly as it was.
pub fn run_feature_build(
    store: &mut FeatureStore,
    ctx: &RunContext,
) -> Result<RunReport, BuildError> {
    let started = Instant::now();
    info!(
        component = "run",
        event = "features.run.start",
        ticker = %ctx.ticker,
        run_id = %ctx.run_id,
        mode = ctx.mode.as_str(),
        policy = ctx.policy().as_str()
    );

    let result = run_inner(store, ctx, started);
    match &result {
        Ok(report) => info!(
            component = "run",
            event = "features.run.finish",
            ticker = %report.ticker,
            run_id = %report.run_id,
            start_date = %report.resolved_start_date,
            end_date = %report.resolved_end_date,
            rows_derived = report.rows_derived,
            rows_affected = report.rows_affected,
            malformed_rows = report.malformed_rows,
            duration_ms = report.duration.as_millis() as u64
        ),
        Err(err) => error!(
            component = "run",
            event = "features.run.error",
            ticker = %ctx.ticker,
            run_id = %ctx.run_id,
            kind = err.kind(),
            error = %err
        ),
    }
    result
}

fn run_inner(
    store: &mut FeatureStore,
    ctx: &RunContext,
    started: Instant,
) -> Result<RunReport, BuildError> {
    ctx.validate()?;
    let policy = ctx.policy();

    let (conn, cfg) = store.parts_mut();
    ensure_feature_schema(conn, cfg)?;

    let tx = conn.transaction()?;
    let range = resolve_range(&tx, cfg, ctx)?;
    let history = load_price_history(&tx, cfg, &ctx.ticker, range)?;
    let events = load_earnings_events(&tx, cfg, &ctx.ticker, range)?;
    let earnings = EarningsCalendar::for_ticker(&ctx.ticker, &events);

    let mut rows_derived = 0u64;
    let mut malformed_rows = 0u64;
    let rows = derive_features(&ctx.ticker, history, &earnings, range).inspect(|row| {
        rows_derived += 1;
        if row.is_malformed() {
            malformed_rows += 1;
        }
    });
    let outcome = materialize_rows(&tx, cfg, rows, policy, &ctx.run_id)?;
    tx.commit()?;

    Ok(RunReport {
        ticker: ctx.ticker.clone(),
        run_id: ctx.run_id.clone(),
        mode: ctx.mode,
        policy,
        resolved_start_date: range.start,
        resolved_end_date: range.end,
        rows_derived,
        rows_affected: outcome.rows_affected,
        malformed_rows,
        duration: started.elapsed(),
    })
}
