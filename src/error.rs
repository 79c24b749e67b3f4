//! Run-level error kinds.

use thiserror::Error;

/// Fatal outcomes of a feature build run. Any of these aborts the run with no
/// rows affected.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("ticker {ticker} has no raw price history")]
    EmptyTickerHistory { ticker: String },
    #[error("invalid date range: {0}")]
    InvalidRange(String),
    #[error("invalid run context: {0}")]
    InvalidRunContext(String),
    #[error("invalid store config: {0}")]
    InvalidConfig(String),
    #[error("feature table is incompatible: {0}")]
    IncompatibleFeatureTable(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] rusqlite::Error),
}

impl BuildError {
    /// Short stable label used in structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyTickerHistory { .. } => "empty_ticker_history",
            Self::InvalidRange(_) => "invalid_range",
            Self::InvalidRunContext(_) => "invalid_run_context",
            Self::InvalidConfig(_) => "invalid_config",
            Self::IncompatibleFeatureTable(_) => "incompatible_feature_table",
            Self::StoreUnavailable(_) => "store_unavailable",
        }
    }
}
