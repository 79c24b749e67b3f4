//! Feature table contract and the create-if-absent schema initializer.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::error::BuildError;
use crate::store::{attach, table_columns, table_exists, StoreConfig, FEATURE_TABLE};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Date,
    Text,
    Real,
    Integer,
    Timestamp,
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Date | Self::Text | Self::Timestamp => "TEXT",
            Self::Real => "REAL",
            Self::Integer => "INTEGER",
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Date => "date",
            Self::Text => "text",
            Self::Real => "real",
            Self::Integer => "integer",
            Self::Timestamp => "timestamp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureTableSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
    pub primary_key: Vec<String>,
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

/// What the initializer had to do; all false on a warm store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaInitReport {
    pub namespace_attached: bool,
    pub table_created: bool,
    pub columns_added: Vec<String>,
}

const COLUMN_SPECS: [(&str, ColumnType, bool); 20] = [
    ("date", ColumnType::Date, false),
    ("ticker", ColumnType::Text, false),
    ("open", ColumnType::Real, true),
    ("high", ColumnType::Real, true),
    ("low", ColumnType::Real, true),
    ("close", ColumnType::Real, true),
    ("volume", ColumnType::Integer, true),
    ("year", ColumnType::Integer, true),
    ("month", ColumnType::Integer, true),
    ("day_of_week", ColumnType::Integer, true),
    ("is_monday", ColumnType::Integer, true),
    ("is_friday", ColumnType::Integer, true),
    ("is_earning_day", ColumnType::Integer, true),
    ("return_close_open", ColumnType::Real, true),
    ("return_prev_close", ColumnType::Real, true),
    ("volatility_7_days", ColumnType::Real, true),
    ("volatility_30_days", ColumnType::Real, true),
    ("close_lag1", ColumnType::Real, true),
    ("ingested_at_utc", ColumnType::Timestamp, true),
    ("run_id", ColumnType::Text, true),
];

const PRIMARY_KEY: [&str; 2] = ["date", "ticker"];

/// Ordered persisted column set; the downstream reader binds to it.
pub fn feature_table_schema() -> FeatureTableSchema {
    let columns: Vec<FeatureColumn> = COLUMN_SPECS
        .iter()
        .map(|(name, column_type, nullable)| FeatureColumn {
            name: (*name).to_string(),
            column_type: *column_type,
            nullable: *nullable,
        })
        .collect();
    let fingerprint = schema_fingerprint(FEATURE_SCHEMA_VERSION, &columns);

    FeatureTableSchema {
        version: FEATURE_SCHEMA_VERSION,
        fingerprint,
        columns,
        primary_key: PRIMARY_KEY.iter().map(|c| (*c).to_string()).collect(),
    }
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureTableSchema,
) -> Result<(), SchemaError> {
    if expected_version != actual.version {
        return Err(SchemaError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(SchemaError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

/// Make sure the feature namespace is attached and the feature table exists
/// with every contract column. Never drops or rewrites existing rows.
pub fn ensure_feature_schema(
    conn: &Connection,
    cfg: &StoreConfig,
) -> Result<SchemaInitReport, BuildError> {
    let ns = &cfg.feature_namespace;
    let uri = cfg.feature_store_path.display().to_string();
    let mut report = SchemaInitReport {
        namespace_attached: attach(conn, &uri, ns)?,
        ..SchemaInitReport::default()
    };

    let schema = feature_table_schema();
    if !table_exists(conn, ns, FEATURE_TABLE)? {
        conn.execute_batch(&create_table_sql(cfg, &schema))?;
        report.table_created = true;
    } else {
        let existing = table_columns(conn, ns, FEATURE_TABLE)?;
        for key in &schema.primary_key {
            if !existing.iter().any(|name| name == key) {
                return Err(BuildError::IncompatibleFeatureTable(format!(
                    "{} is missing key column {key}",
                    cfg.feature_table()
                )));
            }
        }
        for column in &schema.columns {
            if existing.iter().any(|name| name == &column.name) {
                continue;
            }
            conn.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {} {};",
                cfg.feature_table(),
                column.name,
                column.column_type.sql_type()
            ))?;
            warn!(
                component = "schema",
                event = "features.schema.column_added",
                table = %cfg.feature_table(),
                column = %column.name
            );
            report.columns_added.push(column.name.clone());
        }
    }

    info!(
        component = "schema",
        event = "features.schema.ready",
        table = %cfg.feature_table(),
        version = schema.version,
        fingerprint = %schema.fingerprint,
        namespace_attached = report.namespace_attached,
        table_created = report.table_created,
        columns_added = report.columns_added.len()
    );

    Ok(report)
}

fn create_table_sql(cfg: &StoreConfig, schema: &FeatureTableSchema) -> String {
    let mut lines: Vec<String> = schema
        .columns
        .iter()
        .map(|column| {
            let not_null = if column.nullable { "" } else { " NOT NULL" };
            format!(
                "    {} {}{not_null}",
                column.name,
                column.column_type.sql_type()
            )
        })
        .collect();
    lines.push(format!("    PRIMARY KEY({})", schema.primary_key.join(", ")));

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n);",
        cfg.feature_table(),
        lines.join(",\n")
    )
}

fn schema_fingerprint(version: u32, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{version};"));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(format!(
            ":{}:{};",
            column.column_type.as_str(),
            if column.nullable { "null" } else { "not_null" }
        ));
    }
    hasher.update("primary_key:");
    for key in PRIMARY_KEY {
        hasher.update(format!("{key},"));
    }
    hex::encode(hasher.finalize())
}
