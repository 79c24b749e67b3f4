//! Keyed writes of derived rows under a conflict policy.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::BuildError;
use crate::features::FeatureRow;
use crate::schema::feature_table_schema;
use crate::store::{format_date, format_timestamp, FeatureStore, StoreConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// Existing (date, ticker) rows are left untouched.
    Skip,
    /// Existing rows get every derived column, `ingested_at_utc` and `run_id` replaced.
    Overwrite,
}

impl ConflictPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Overwrite => "overwrite",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializeOutcome {
    pub rows_attempted: u64,
    /// Inserted rows, plus updated rows under `Overwrite`.
    pub rows_affected: u64,
}

impl MaterializeOutcome {
    pub fn rows_skipped(&self) -> u64 {
        self.rows_attempted.saturating_sub(self.rows_affected)
    }
}

/// Write `rows` through `conn`, which is expected to be inside the caller's
/// transaction. Timestamps are taken per row at write time.
pub fn materialize_rows(
    conn: &Connection,
    cfg: &StoreConfig,
    rows: impl IntoIterator<Item = FeatureRow>,
    policy: ConflictPolicy,
    run_id: &str,
) -> Result<MaterializeOutcome, BuildError> {
    let sql = upsert_sql(cfg, policy);
    let mut stmt = conn.prepare(&sql)?;
    let mut outcome = MaterializeOutcome::default();

    for row in rows {
        let ingested_at_utc = format_timestamp(Utc::now());
        let changed = stmt.execute(params![
            format_date(row.date),
            row.ticker,
            row.open,
            row.high,
            row.low,
            row.close,
            row.volume,
            row.year,
            row.month,
            row.day_of_week,
            row.is_monday,
            row.is_friday,
            row.is_earning_day,
            row.return_close_open,
            row.return_prev_close,
            row.volatility_7_days,
            row.volatility_30_days,
            row.close_lag1,
            ingested_at_utc,
            run_id,
        ])?;
        outcome.rows_attempted += 1;
        outcome.rows_affected += changed as u64;

        if changed == 0 {
            debug!(
                component = "materialize",
                event = "features.materialize.row_skipped",
                ticker = %row.ticker,
                date = %row.date
            );
        }
    }

    info!(
        component = "materialize",
        event = "features.materialize.finish",
        table = %cfg.feature_table(),
        policy = policy.as_str(),
        run_id,
        rows_attempted = outcome.rows_attempted,
        rows_affected = outcome.rows_affected,
        rows_skipped = outcome.rows_skipped()
    );

    Ok(outcome)
}

impl FeatureStore {
    /// Materialize in a transaction of its own; all rows or none are written.
    pub fn materialize(
        &mut self,
        rows: impl IntoIterator<Item = FeatureRow>,
        policy: ConflictPolicy,
        run_id: &str,
    ) -> Result<MaterializeOutcome, BuildError> {
        let (conn, cfg) = self.parts_mut();
        let tx = conn.transaction()?;
        let outcome = materialize_rows(&tx, cfg, rows, policy, run_id)?;
        tx.commit()?;
        Ok(outcome)
    }
}

fn upsert_sql(cfg: &StoreConfig, policy: ConflictPolicy) -> String {
    let schema = feature_table_schema();
    let names: Vec<&str> = schema.columns.iter().map(|c| c.name.as_str()).collect();
    let placeholders: Vec<String> = (1..=names.len()).map(|idx| format!("?{idx}")).collect();
    let key = schema.primary_key.join(", ");

    let conflict_clause = match policy {
        ConflictPolicy::Skip => format!("ON CONFLICT({key}) DO NOTHING"),
        ConflictPolicy::Overwrite => {
            let assignments: Vec<String> = names
                .iter()
                .filter(|name| !schema.primary_key.iter().any(|k| k == *name))
                .map(|name| format!("{name} = excluded.{name}"))
                .collect();
            format!(
                "ON CONFLICT({key}) DO UPDATE SET\n    {}",
                assignments.join(",\n    ")
            )
        }
    };

    format!(
        "INSERT INTO {} ({}) VALUES ({})\n{conflict_clause}",
        cfg.feature_table(),
        names.join(", "),
        placeholders.join(", ")
    )
}
