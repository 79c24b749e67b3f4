//! Validated model input built from the feature table column set.
//!
//! Serving code hands over a loosely typed JSON object; this module turns it
//! into a fixed structure or a typed failure naming the offending field.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::features::FeatureRow;

/// Required keys of a scoring payload. Nullable features must be present but may be null.
pub const SCORING_FIELDS: [&str; 16] = [
    "open",
    "high",
    "low",
    "close",
    "volume",
    "year",
    "month",
    "day_of_week",
    "is_monday",
    "is_friday",
    "is_earning_day",
    "return_close_open",
    "return_prev_close",
    "volatility_7_days",
    "volatility_30_days",
    "close_lag1",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScoringInputError {
    #[error("scoring payload must be a JSON object")]
    NotAnObject,
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("field {field} has malformed value {value}")]
    MalformedField { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringInput {
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<i64>,
    pub year: i32,
    pub month: u32,
    pub day_of_week: u32,
    pub is_monday: bool,
    pub is_friday: bool,
    pub is_earning_day: bool,
    pub return_close_open: Option<f64>,
    pub return_prev_close: Option<f64>,
    pub volatility_7_days: Option<f64>,
    pub volatility_30_days: Option<f64>,
    pub close_lag1: Option<f64>,
}

impl ScoringInput {
    pub fn from_json(value: &Value) -> Result<Self, ScoringInputError> {
        let object = value.as_object().ok_or(ScoringInputError::NotAnObject)?;
        for field in SCORING_FIELDS {
            if !object.contains_key(field) {
                return Err(ScoringInputError::MissingField(field));
            }
        }

        Ok(Self {
            open: optional_f64(object, "open")?,
            high: optional_f64(object, "high")?,
            low: optional_f64(object, "low")?,
            close: optional_f64(object, "close")?,
            volume: optional_i64(object, "volume")?,
            year: required_int(object, "year")?,
            month: required_int(object, "month")?,
            day_of_week: required_int(object, "day_of_week")?,
            is_monday: required_flag(object, "is_monday")?,
            is_friday: required_flag(object, "is_friday")?,
            is_earning_day: required_flag(object, "is_earning_day")?,
            return_close_open: optional_f64(object, "return_close_open")?,
            return_prev_close: optional_f64(object, "return_prev_close")?,
            volatility_7_days: optional_f64(object, "volatility_7_days")?,
            volatility_30_days: optional_f64(object, "volatility_30_days")?,
            close_lag1: optional_f64(object, "close_lag1")?,
        })
    }
}

impl From<&FeatureRow> for ScoringInput {
    fn from(row: &FeatureRow) -> Self {
        Self {
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
            year: row.year,
            month: row.month,
            day_of_week: row.day_of_week,
            is_monday: row.is_monday,
            is_friday: row.is_friday,
            is_earning_day: row.is_earning_day,
            return_close_open: row.return_close_open,
            return_prev_close: row.return_prev_close,
            volatility_7_days: row.volatility_7_days,
            volatility_30_days: row.volatility_30_days,
            close_lag1: row.close_lag1,
        }
    }
}

fn malformed(field: &'static str, value: &Value) -> ScoringInputError {
    ScoringInputError::MalformedField {
        field,
        value: value.to_string(),
    }
}

fn optional_f64(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<f64>, ScoringInputError> {
    match &object[field] {
        Value::Null => Ok(None),
        value => value
            .as_f64()
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or_else(|| malformed(field, value)),
    }
}

fn optional_i64(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<i64>, ScoringInputError> {
    match &object[field] {
        Value::Null => Ok(None),
        value => value
            .as_i64()
            .map(Some)
            .ok_or_else(|| malformed(field, value)),
    }
}

fn required_int<T: TryFrom<i64>>(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<T, ScoringInputError> {
    let value = &object[field];
    value
        .as_i64()
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| malformed(field, value))
}

/// Accepts 0/1 or JSON booleans.
fn required_flag(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<bool, ScoringInputError> {
    let value = &object[field];
    match value {
        Value::Bool(flag) => Ok(*flag),
        Value::Number(n) if n.as_i64() == Some(0) => Ok(false),
        Value::Number(n) if n.as_i64() == Some(1) => Ok(true),
        _ => Err(malformed(field, value)),
    }
}
