//! SQLite-backed raw source and feature store.
//!
//! The raw store is attached read-only under `raw_namespace`; the feature
//! store is attached read-write under `feature_namespace`. Both live on one
//! in-memory primary connection, so a single transaction spans reads and
//! writes of a run.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::error::BuildError;
use crate::features::{CalendarFields, EarningsEvent, FeatureRow, RawPriceRow, LOOKBACK_ROWS};
use crate::range::DateRange;

pub const PRICES_TABLE: &str = "prices_daily";
pub const EARNINGS_TABLE: &str = "earnings_dates";
pub const FEATURE_TABLE: &str = "prices_daily_features";

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub raw_store_path: PathBuf,
    pub feature_store_path: PathBuf,
    pub raw_namespace: String,
    pub feature_namespace: String,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            raw_store_path: PathBuf::from("data/raw.sqlite"),
            feature_store_path: PathBuf::from("data/analytics.sqlite"),
            raw_namespace: "raw".to_string(),
            feature_namespace: "analytics".to_string(),
            busy_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    pub fn with_paths(raw_store_path: impl Into<PathBuf>, feature_store_path: impl Into<PathBuf>) -> Self {
        Self {
            raw_store_path: raw_store_path.into(),
            feature_store_path: feature_store_path.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), BuildError> {
        for (label, name) in [
            ("raw_namespace", &self.raw_namespace),
            ("feature_namespace", &self.feature_namespace),
        ] {
            if !is_identifier(name) {
                return Err(BuildError::InvalidConfig(format!(
                    "{label} '{name}' is not a valid identifier"
                )));
            }
        }
        if self.raw_namespace.eq_ignore_ascii_case(&self.feature_namespace) {
            return Err(BuildError::InvalidConfig(
                "raw_namespace and feature_namespace must differ".to_string(),
            ));
        }
        if ["main", "temp"]
            .iter()
            .any(|reserved| self.raw_namespace.eq_ignore_ascii_case(reserved)
                || self.feature_namespace.eq_ignore_ascii_case(reserved))
        {
            return Err(BuildError::InvalidConfig(
                "namespaces must not be 'main' or 'temp'".to_string(),
            ));
        }
        Ok(())
    }

    /// Fully qualified feature table name.
    pub fn feature_table(&self) -> String {
        format!("{}.{FEATURE_TABLE}", self.feature_namespace)
    }
}

pub fn store_config_from_env() -> StoreConfig {
    let mut config = StoreConfig::default();

    if let Some(path) = non_blank_var("DAILY_FEATURES_RAW_STORE") {
        config.raw_store_path = PathBuf::from(path);
    }
    if let Some(path) = non_blank_var("DAILY_FEATURES_FEATURE_STORE") {
        config.feature_store_path = PathBuf::from(path);
    }
    if let Some(ns) = non_blank_var("DAILY_FEATURES_RAW_NAMESPACE") {
        config.raw_namespace = ns;
    }
    if let Some(ns) = non_blank_var("DAILY_FEATURES_FEATURE_NAMESPACE") {
        config.feature_namespace = ns;
    }
    if let Some(timeout) = non_blank_var("DAILY_FEATURES_BUSY_TIMEOUT_MS") {
        if let Ok(parsed) = timeout.parse::<u64>() {
            config.busy_timeout_ms = parsed;
        }
    }

    config
}

/// Persisted feature row with its write provenance.
///
/// Provenance is `None` on rows that predate a repaired column and have not
/// been overwritten since.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFeatureRow {
    pub row: FeatureRow,
    pub ingested_at_utc: Option<DateTime<Utc>>,
    pub run_id: Option<String>,
}

#[derive(Debug)]
pub struct FeatureStore {
    conn: Connection,
    cfg: StoreConfig,
}

impl FeatureStore {
    pub fn open(cfg: StoreConfig) -> Result<Self, BuildError> {
        cfg.validate()?;
        if let Some(parent) = cfg.feature_store_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    BuildError::InvalidConfig(format!(
                        "cannot create feature store directory {}: {err}",
                        parent.display()
                    ))
                })?;
            }
        }

        let conn = Connection::open_in_memory()?;
        conn.busy_timeout(Duration::from_millis(cfg.busy_timeout_ms))?;
        attach(&conn, &read_only_uri(&cfg.raw_store_path), &cfg.raw_namespace)?;
        attach(
            &conn,
            &cfg.feature_store_path.display().to_string(),
            &cfg.feature_namespace,
        )?;

        info!(
            component = "store",
            event = "store.open",
            raw_store = %cfg.raw_store_path.display(),
            feature_store = %cfg.feature_store_path.display(),
            raw_namespace = %cfg.raw_namespace,
            feature_namespace = %cfg.feature_namespace
        );

        Ok(Self { conn, cfg })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.cfg
    }

    /// Split borrow for callers that open a transaction and still need config.
    pub fn parts_mut(&mut self) -> (&mut Connection, &StoreConfig) {
        (&mut self.conn, &self.cfg)
    }

    /// Persisted rows for `ticker` within `range`, ascending by date.
    pub fn read_features(
        &self,
        ticker: &str,
        range: DateRange,
    ) -> Result<Vec<StoredFeatureRow>, BuildError> {
        read_features(&self.conn, &self.cfg, ticker, range)
    }

    /// Zero when the feature table has not been created yet.
    pub fn count_features(&self, ticker: &str) -> Result<u64, BuildError> {
        if !table_exists(&self.conn, &self.cfg.feature_namespace, FEATURE_TABLE)? {
            return Ok(0);
        }
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE ticker = ?1",
            self.cfg.feature_table()
        );
        let count: i64 = self.conn.query_row(&sql, params![ticker], |row| row.get(0))?;
        Ok(count as u64)
    }
}

/// Attach `uri` as `namespace` unless a database with that name is already attached.
pub fn attach(conn: &Connection, uri: &str, namespace: &str) -> Result<bool, BuildError> {
    if is_attached(conn, namespace)? {
        return Ok(false);
    }
    conn.execute(&format!("ATTACH DATABASE ?1 AS {namespace}"), params![uri])?;
    Ok(true)
}

pub fn is_attached(conn: &Connection, namespace: &str) -> Result<bool, BuildError> {
    let mut stmt = conn.prepare("PRAGMA database_list")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name.eq_ignore_ascii_case(namespace) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Raw rows for the ticker: up to `LOOKBACK_ROWS` rows before `range.start`
/// followed by every row inside `range`.
pub fn load_price_history(
    conn: &Connection,
    cfg: &StoreConfig,
    ticker: &str,
    range: DateRange,
) -> Result<Vec<RawPriceRow>, BuildError> {
    let ns = &cfg.raw_namespace;
    let lookback_sql = format!(
        "
        SELECT date(date), ticker, open, high, low, close, volume
        FROM {ns}.{PRICES_TABLE}
        WHERE ticker = ?1
          AND date(date) < ?2
        ORDER BY date(date) DESC
        LIMIT ?3
        "
    );
    let range_sql = format!(
        "
        SELECT date(date), ticker, open, high, low, close, volume
        FROM {ns}.{PRICES_TABLE}
        WHERE ticker = ?1
          AND date(date) >= ?2
          AND date(date) <= ?3
        ORDER BY date(date) ASC
        "
    );

    let start = format_date(range.start);
    let end = format_date(range.end);

    let mut rows = Vec::new();
    let mut malformed_fields = 0u64;
    {
        let mut stmt = conn.prepare(&lookback_sql)?;
        let mut cursor = stmt.query(params![ticker, start, LOOKBACK_ROWS as i64])?;
        while let Some(row) = cursor.next()? {
            if let Some(parsed) = raw_price_row(row, &mut malformed_fields)? {
                rows.push(parsed);
            }
        }
    }
    rows.reverse();
    let lookback_rows = rows.len();
    {
        let mut stmt = conn.prepare(&range_sql)?;
        let mut cursor = stmt.query(params![ticker, start, end])?;
        while let Some(row) = cursor.next()? {
            if let Some(parsed) = raw_price_row(row, &mut malformed_fields)? {
                rows.push(parsed);
            }
        }
    }

    if malformed_fields > 0 {
        warn!(
            component = "store",
            event = "store.raw.malformed_fields",
            ticker,
            malformed_fields
        );
    }

    info!(
        component = "store",
        event = "store.raw.loaded",
        ticker,
        lookback_rows,
        range_rows = rows.len() - lookback_rows
    );

    Ok(rows)
}

/// Earnings events for the ticker whose date component falls in `range`.
pub fn load_earnings_events(
    conn: &Connection,
    cfg: &StoreConfig,
    ticker: &str,
    range: DateRange,
) -> Result<Vec<EarningsEvent>, BuildError> {
    let sql = format!(
        "
        SELECT DISTINCT date(earnings_date)
        FROM {ns}.{EARNINGS_TABLE}
        WHERE ticker = ?1
          AND date(earnings_date) >= ?2
          AND date(earnings_date) <= ?3
        ",
        ns = cfg.raw_namespace
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut cursor = stmt.query(params![
        ticker,
        format_date(range.start),
        format_date(range.end)
    ])?;

    let mut events = Vec::new();
    while let Some(row) = cursor.next()? {
        let raw: Option<String> = row.get(0)?;
        if let Some(earnings_date) = raw.as_deref().and_then(parse_stored_date) {
            events.push(EarningsEvent {
                ticker: ticker.to_string(),
                earnings_date,
            });
        }
    }
    Ok(events)
}

/// Persisted rows for `ticker` within `range`, ascending by date. Empty when
/// the feature table has not been created yet.
pub fn read_features(
    conn: &Connection,
    cfg: &StoreConfig,
    ticker: &str,
    range: DateRange,
) -> Result<Vec<StoredFeatureRow>, BuildError> {
    if !table_exists(conn, &cfg.feature_namespace, FEATURE_TABLE)? {
        return Ok(Vec::new());
    }
    let sql = format!(
        "
        SELECT
            date, ticker, open, high, low, close, volume,
            year, month, day_of_week, is_monday, is_friday, is_earning_day,
            return_close_open, return_prev_close, volatility_7_days, volatility_30_days,
            close_lag1, ingested_at_utc, run_id
        FROM {}
        WHERE ticker = ?1
          AND date >= ?2
          AND date <= ?3
        ORDER BY date ASC
        ",
        cfg.feature_table()
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut cursor = stmt.query(params![
        ticker,
        format_date(range.start),
        format_date(range.end)
    ])?;

    let mut out = Vec::new();
    while let Some(row) = cursor.next()? {
        let date_text: String = row.get(0)?;
        let date = parse_stored_date(&date_text).ok_or_else(|| {
            conversion_error(0, format!("invalid stored date '{date_text}'"))
        })?;
        let ingested_at_utc = row
            .get::<_, Option<String>>(18)?
            .map(|text| {
                DateTime::parse_from_rfc3339(&text)
                    .map(|ts| ts.with_timezone(&Utc))
                    .map_err(|err| conversion_error(18, format!("invalid ingested_at_utc: {err}")))
            })
            .transpose()?;

        // Calendar columns added by a schema repair are NULL until the row is
        // overwritten; they follow from the date, so fill them in.
        let calendar = CalendarFields::of(date);
        out.push(StoredFeatureRow {
            row: FeatureRow {
                date,
                ticker: row.get(1)?,
                open: row.get(2)?,
                high: row.get(3)?,
                low: row.get(4)?,
                close: row.get(5)?,
                volume: row.get(6)?,
                year: row.get::<_, Option<i32>>(7)?.unwrap_or(calendar.year),
                month: row.get::<_, Option<u32>>(8)?.unwrap_or(calendar.month),
                day_of_week: row
                    .get::<_, Option<u32>>(9)?
                    .unwrap_or(calendar.day_of_week),
                is_monday: row
                    .get::<_, Option<bool>>(10)?
                    .unwrap_or(calendar.is_monday),
                is_friday: row
                    .get::<_, Option<bool>>(11)?
                    .unwrap_or(calendar.is_friday),
                is_earning_day: row.get::<_, Option<bool>>(12)?.unwrap_or(false),
                return_close_open: row.get(13)?,
                return_prev_close: row.get(14)?,
                volatility_7_days: row.get(15)?,
                volatility_30_days: row.get(16)?,
                close_lag1: row.get(17)?,
            },
            ingested_at_utc,
            run_id: row.get(19)?,
        });
    }
    Ok(out)
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Date component of a stored date or date-time text value.
pub fn parse_stored_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    let head = trimmed.get(..10).unwrap_or(trimmed);
    NaiveDate::parse_from_str(head, DATE_FORMAT).ok()
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn table_exists(conn: &Connection, namespace: &str, table: &str) -> Result<bool, BuildError> {
    let sql = format!(
        "SELECT 1 FROM {namespace}.sqlite_master WHERE type='table' AND name=?1 LIMIT 1"
    );
    let exists = conn
        .query_row(&sql, params![table], |row| row.get::<_, i64>(0))
        .optional()?
        .is_some();
    Ok(exists)
}

pub fn table_columns(
    conn: &Connection,
    namespace: &str,
    table: &str,
) -> Result<Vec<String>, BuildError> {
    let pragma = format!("PRAGMA {namespace}.table_info({table})");
    let mut stmt = conn.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    let mut names = Vec::new();
    while let Some(row) = rows.next()? {
        names.push(row.get::<_, String>(1)?);
    }
    Ok(names)
}

fn raw_price_row(
    row: &rusqlite::Row<'_>,
    malformed_fields: &mut u64,
) -> Result<Option<RawPriceRow>, BuildError> {
    let date_text: Option<String> = row.get(0)?;
    let Some(date) = date_text.as_deref().and_then(parse_stored_date) else {
        return Ok(None);
    };

    let mut numeric = |idx: usize| -> Result<Option<f64>, BuildError> {
        let value = lenient_f64(row.get::<_, Value>(idx)?);
        if value.is_malformed() {
            *malformed_fields += 1;
        }
        Ok(value.into_option())
    };
    let open = numeric(2)?;
    let high = numeric(3)?;
    let low = numeric(4)?;
    let close = numeric(5)?;
    let volume_value = lenient_f64(row.get::<_, Value>(6)?);
    if volume_value.is_malformed() {
        *malformed_fields += 1;
    }

    Ok(Some(RawPriceRow {
        date,
        ticker: row.get(1)?,
        open,
        high,
        low,
        close,
        volume: volume_value.into_option().map(|v| v.round() as i64),
    }))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Lenient {
    Number(f64),
    Null,
    Malformed,
}

impl Lenient {
    fn is_malformed(self) -> bool {
        matches!(self, Self::Malformed)
    }

    fn into_option(self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(v),
            Self::Null | Self::Malformed => None,
        }
    }
}

fn lenient_f64(value: Value) -> Lenient {
    let parsed = match value {
        Value::Null => return Lenient::Null,
        Value::Integer(v) => v as f64,
        Value::Real(v) => v,
        Value::Text(text) => match text.trim().parse::<f64>() {
            Ok(v) => v,
            Err(_) => return Lenient::Malformed,
        },
        Value::Blob(_) => return Lenient::Malformed,
    };
    if parsed.is_finite() {
        Lenient::Number(parsed)
    } else {
        Lenient::Malformed
    }
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

fn read_only_uri(path: &Path) -> String {
    format!("file:{}?mode=ro", path.display())
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn non_blank_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}
