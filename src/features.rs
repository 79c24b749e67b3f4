//! Per-ticker daily feature derivation.
//!
//! Rows are walked in ascending date order. Lag and rolling state is carried
//! through rows that precede the requested range, so the first in-range row
//! sees the same windows a full-history pass would have produced.

use std::collections::{HashSet, VecDeque};
use std::vec;

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::range::DateRange;

pub const VOLATILITY_SHORT_WINDOW: usize = 7;
pub const VOLATILITY_LONG_WINDOW: usize = 30;

/// Rows of history before `start_date` needed to seed every window.
pub const LOOKBACK_ROWS: usize = VOLATILITY_LONG_WINDOW + 1;

/// Below this many defined returns a window has no volatility.
pub const MIN_VOLATILITY_SAMPLES: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPriceRow {
    pub date: NaiveDate,
    pub ticker: String,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<i64>,
}

impl RawPriceRow {
    /// Missing open or close; such a row only degrades its own values and the
    /// windows that include it.
    pub fn is_malformed(&self) -> bool {
        self.open.is_none() || self.close.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarningsEvent {
    pub ticker: String,
    /// Date component of the announcement timestamp.
    pub earnings_date: NaiveDate,
}

/// Earnings dates of a single ticker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EarningsCalendar {
    dates: HashSet<NaiveDate>,
}

impl EarningsCalendar {
    pub fn for_ticker<'a>(
        ticker: &str,
        events: impl IntoIterator<Item = &'a EarningsEvent>,
    ) -> Self {
        let dates = events
            .into_iter()
            .filter(|event| event.ticker == ticker)
            .map(|event| event.earnings_date)
            .collect();
        Self { dates }
    }

    pub fn is_earning_day(&self, date: NaiveDate) -> bool {
        self.dates.contains(&date)
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

/// One derived row per (date, ticker). `None` marks an undefined value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub date: NaiveDate,
    pub ticker: String,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<i64>,
    pub year: i32,
    pub month: u32,
    /// ISO day number, Monday = 1 through Sunday = 7.
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

impl FeatureRow {
    pub fn is_malformed(&self) -> bool {
        self.open.is_none() || self.close.is_none()
    }
}

/// Columns that are a function of the date alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CalendarFields {
    pub year: i32,
    pub month: u32,
    pub day_of_week: u32,
    pub is_monday: bool,
    pub is_friday: bool,
}

impl CalendarFields {
    pub(crate) fn of(date: NaiveDate) -> Self {
        let weekday = date.weekday();
        Self {
            year: date.year(),
            month: date.month(),
            day_of_week: weekday.number_from_monday(),
            is_monday: weekday == Weekday::Mon,
            is_friday: weekday == Weekday::Fri,
        }
    }
}

#[derive(Debug, Clone)]
struct TickerRolling {
    last_close: Option<f64>,
    returns: VecDeque<Option<f64>>,
    max_window: usize,
}

impl TickerRolling {
    fn new(max_window: usize) -> Self {
        Self {
            last_close: None,
            returns: VecDeque::with_capacity(max_window + 1),
            max_window,
        }
    }

    fn push(&mut self, close: Option<f64>, ret_prev_close: Option<f64>) {
        self.returns.push_back(ret_prev_close);
        while self.returns.len() > self.max_window {
            self.returns.pop_front();
        }
        self.last_close = close;
    }

    /// Sample std dev over the defined returns of the last `w` rows pushed.
    fn vol_w(&self, w: usize) -> Option<f64> {
        let start = self.returns.len().saturating_sub(w);
        let window: Vec<f64> = self.returns.range(start..).filter_map(|v| *v).collect();
        sample_std_dev(&window)
    }

    fn derive(&mut self, raw: RawPriceRow, earnings: &EarningsCalendar) -> FeatureRow {
        let close_lag1 = self.last_close;
        let return_close_open = raw
            .close
            .zip(raw.open)
            .and_then(|(close, open)| guarded_div(close - open, open));
        let return_prev_close = raw
            .close
            .zip(close_lag1)
            .and_then(|(close, prev)| guarded_div(close, prev))
            .map(|ratio| ratio - 1.0);

        // Windows cover the preceding rows only; the current return is pushed after.
        let volatility_7_days = self.vol_w(VOLATILITY_SHORT_WINDOW);
        let volatility_30_days = self.vol_w(VOLATILITY_LONG_WINDOW);
        self.push(raw.close, return_prev_close);

        let calendar = CalendarFields::of(raw.date);

        FeatureRow {
            date: raw.date,
            year: calendar.year,
            month: calendar.month,
            day_of_week: calendar.day_of_week,
            is_monday: calendar.is_monday,
            is_friday: calendar.is_friday,
            is_earning_day: earnings.is_earning_day(raw.date),
            ticker: raw.ticker,
            open: raw.open,
            high: raw.high,
            low: raw.low,
            close: raw.close,
            volume: raw.volume,
            return_close_open,
            return_prev_close,
            volatility_7_days,
            volatility_30_days,
            close_lag1,
        }
    }
}

/// Lazy, date-ordered feature rows for one ticker restricted to a range.
#[derive(Debug)]
pub struct DerivedFeatures<'a> {
    rows: vec::IntoIter<RawPriceRow>,
    earnings: &'a EarningsCalendar,
    range: DateRange,
    state: TickerRolling,
}

impl Iterator for DerivedFeatures<'_> {
    type Item = FeatureRow;

    fn next(&mut self) -> Option<FeatureRow> {
        for raw in self.rows.by_ref() {
            let row = self.state.derive(raw, self.earnings);
            if !self.range.contains(row.date) {
                continue;
            }
            if row.is_malformed() {
                warn!(
                    component = "features",
                    event = "features.derive.malformed_row",
                    ticker = %row.ticker,
                    date = %row.date,
                    open_missing = row.open.is_none(),
                    close_missing = row.close.is_none()
                );
            }
            return Some(row);
        }
        None
    }
}

/// Derive features for `ticker` over `range`.
///
/// `rows` may contain history before `range.start` (it seeds lag and rolling
/// windows), rows of other tickers and rows in any order. Only in-range rows
/// are yielded, ascending by date.
pub fn derive_features<'a>(
    ticker: &str,
    rows: Vec<RawPriceRow>,
    earnings: &'a EarningsCalendar,
    range: DateRange,
) -> DerivedFeatures<'a> {
    let mut rows: Vec<RawPriceRow> = rows
        .into_iter()
        .filter(|row| row.ticker == ticker && row.date <= range.end)
        .collect();
    rows.sort_by_key(|row| row.date);

    let before = rows.len();
    rows.dedup_by(|later, earlier| later.date == earlier.date);
    let duplicates_removed = before - rows.len();
    if duplicates_removed > 0 {
        warn!(
            component = "features",
            event = "features.derive.duplicate_dates",
            ticker,
            duplicates_removed
        );
    }

    debug!(
        component = "features",
        event = "features.derive.start",
        ticker,
        input_rows = rows.len(),
        start_date = %range.start,
        end_date = %range.end,
        earnings_dates = earnings.len()
    );

    DerivedFeatures {
        rows: rows.into_iter(),
        earnings,
        range,
        state: TickerRolling::new(VOLATILITY_LONG_WINDOW),
    }
}

/// Sample standard deviation (n - 1 denominator).
pub fn sample_std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < MIN_VOLATILITY_SAMPLES {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values
        .iter()
        .map(|v| {
            let d = *v - mean;
            d * d
        })
        .sum::<f64>()
        / (n - 1.0);
    finite(variance.sqrt())
}

fn guarded_div(numerator: f64, denominator: f64) -> Option<f64> {
    if denominator == 0.0 {
        return None;
    }
    finite(numerator / denominator)
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}
