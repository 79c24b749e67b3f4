//! Daily per-ticker feature table builder.
//!
//! Current implemented scope:
//! - range resolution (full history or explicit range)
//! - lag, return, rolling volatility and calendar feature derivation
//! - idempotent materialization with skip/overwrite conflict policies
//! - feature table contract and create-if-absent schema initialization

mod error;
mod features;
mod materialize;
mod observability;
mod range;
mod run;
mod schema;
mod scoring;
mod store;

pub use error::BuildError;
pub use features::{
    derive_features, sample_std_dev, DerivedFeatures, EarningsCalendar, EarningsEvent, FeatureRow,
    RawPriceRow, LOOKBACK_ROWS, MIN_VOLATILITY_SAMPLES, VOLATILITY_LONG_WINDOW,
    VOLATILITY_SHORT_WINDOW,
};
pub use materialize::{materialize_rows, ConflictPolicy, MaterializeOutcome};
pub use observability::{
    init_logging, log_app_start, log_run_report, logging_config_from_env, parse_bool, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use range::{
    history_bounds, resolve_range, run_context_from_env, DateRange, RunContext, RunMode,
};
pub use run::{run_feature_build, RunReport};
pub use schema::{
    assert_schema_compatible, ensure_feature_schema, feature_table_schema, ColumnType,
    FeatureColumn, FeatureTableSchema, SchemaError, SchemaInitReport, FEATURE_SCHEMA_VERSION,
};
pub use scoring::{ScoringInput, ScoringInputError, SCORING_FIELDS};
pub use store::{
    load_earnings_events, load_price_history, parse_stored_date, read_features,
    store_config_from_env, FeatureStore, StoreConfig, StoredFeatureRow, EARNINGS_TABLE,
    FEATURE_TABLE, PRICES_TABLE,
};
