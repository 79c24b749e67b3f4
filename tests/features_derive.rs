use chrono::{Days, NaiveDate};
use daily_features::{
    derive_features, sample_std_dev, DateRange, EarningsCalendar, EarningsEvent, FeatureRow,
    RawPriceRow,
};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

fn raw(ticker: &str, day: NaiveDate, open: f64, close: f64) -> RawPriceRow {
    RawPriceRow {
        date: day,
        ticker: ticker.to_string(),
        open: Some(open),
        high: Some(open.max(close) + 0.5),
        low: Some(open.min(close) - 0.5),
        close: Some(close),
        volume: Some(10_000),
    }
}

/// `days` consecutive calendar days of a gently trending series.
fn series(ticker: &str, start: NaiveDate, days: u64) -> Vec<RawPriceRow> {
    (0..days)
        .map(|i| {
            let day = start.checked_add_days(Days::new(i)).expect("date in range");
            let close = 50.0 + (i as f64 * 0.7).sin() * 3.0 + i as f64 * 0.1;
            raw(ticker, day, close - 0.25, close)
        })
        .collect()
}

fn wide_range() -> DateRange {
    DateRange::new(date(2000, 1, 1), date(2100, 1, 1))
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-12,
        "actual={actual} expected={expected}"
    );
}

#[test]
fn two_day_example_matches_hand_computed_values() {
    let rows = vec![
        raw("ABC", date(2024, 1, 2), 10.0, 11.0),
        raw("ABC", date(2024, 1, 3), 11.0, 9.0),
    ];
    let earnings = EarningsCalendar::default();
    let out: Vec<FeatureRow> = derive_features("ABC", rows, &earnings, wide_range()).collect();

    assert_eq!(out.len(), 2);
    let second = &out[1];
    assert_eq!(second.date, date(2024, 1, 3));
    assert_eq!(second.close_lag1, Some(11.0));
    assert_close(second.return_close_open.unwrap(), (9.0 - 11.0) / 11.0);
    assert_close(second.return_prev_close.unwrap(), 9.0 / 11.0 - 1.0);
    assert!(!second.is_earning_day);
    assert_eq!(second.volatility_7_days, None);
    assert_eq!(second.volatility_30_days, None);
    // 2024-01-03 is a Wednesday.
    assert_eq!(second.day_of_week, 3);
}

#[test]
fn first_row_is_unseeded_and_thirty_first_row_has_both_windows() {
    let rows = series("ABC", date(2024, 1, 1), 31);
    let earnings = EarningsCalendar::default();
    let out: Vec<FeatureRow> = derive_features("ABC", rows, &earnings, wide_range()).collect();

    assert_eq!(out.len(), 31);
    let first = &out[0];
    assert_eq!(first.close_lag1, None);
    assert_eq!(first.return_prev_close, None);
    assert_eq!(first.volatility_7_days, None);
    assert_eq!(first.volatility_30_days, None);
    assert!(first.return_close_open.is_some());

    let last = &out[30];
    assert!(last.volatility_7_days.is_some());
    assert!(last.volatility_30_days.is_some());
}

#[test]
fn volatility_uses_only_preceding_returns() {
    let rows = series("ABC", date(2024, 1, 1), 40);
    let earnings = EarningsCalendar::default();
    let out: Vec<FeatureRow> = derive_features("ABC", rows, &earnings, wide_range()).collect();

    let returns: Vec<Option<f64>> = out.iter().map(|row| row.return_prev_close).collect();

    // Row 10: short window is rows 3..=9, long window is rows 0..=9 (row 0 has no return).
    let short: Vec<f64> = returns[3..10].iter().map(|r| r.unwrap()).collect();
    let long: Vec<f64> = returns[0..10].iter().filter_map(|r| *r).collect();
    assert_close(out[10].volatility_7_days.unwrap(), sample_std_dev(&short).unwrap());
    assert_close(out[10].volatility_30_days.unwrap(), sample_std_dev(&long).unwrap());

    // Row 39: long window is rows 9..=38.
    let long: Vec<f64> = returns[9..39].iter().map(|r| r.unwrap()).collect();
    assert_eq!(long.len(), 30);
    assert_close(out[39].volatility_30_days.unwrap(), sample_std_dev(&long).unwrap());
}

#[test]
fn volatility_needs_two_defined_returns() {
    let rows = series("ABC", date(2024, 1, 1), 4);
    let earnings = EarningsCalendar::default();
    let out: Vec<FeatureRow> = derive_features("ABC", rows, &earnings, wide_range()).collect();

    // Row 2 sees one defined return (row 1); row 3 sees two.
    assert_eq!(out[2].volatility_7_days, None);
    assert!(out[3].volatility_7_days.is_some());
}

#[test]
fn division_guards_leave_values_undefined() {
    let rows = vec![
        raw("ABC", date(2024, 1, 2), 0.0, 0.0),
        raw("ABC", date(2024, 1, 3), 5.0, 6.0),
    ];
    let earnings = EarningsCalendar::default();
    let out: Vec<FeatureRow> = derive_features("ABC", rows, &earnings, wide_range()).collect();

    assert_eq!(out[0].return_close_open, None);
    assert_eq!(out[1].close_lag1, Some(0.0));
    assert_eq!(out[1].return_prev_close, None);
    assert_close(out[1].return_close_open.unwrap(), 0.2);
}

#[test]
fn unordered_and_foreign_rows_are_normalized() {
    let mut rows = series("ABC", date(2024, 3, 1), 10);
    rows.reverse();
    rows.push(raw("XYZ", date(2024, 3, 5), 1.0, 2.0));
    rows.swap(2, 7);

    let earnings = EarningsCalendar::default();
    let out: Vec<FeatureRow> = derive_features("ABC", rows, &earnings, wide_range()).collect();

    assert_eq!(out.len(), 10);
    assert!(out.iter().all(|row| row.ticker == "ABC"));
    assert!(out.windows(2).all(|pair| pair[0].date < pair[1].date));
    assert_eq!(out[1].close_lag1, out[0].close);
}

#[test]
fn history_before_range_seeds_boundary_rows() {
    let rows = series("ABC", date(2024, 1, 1), 45);
    let earnings = EarningsCalendar::default();
    let full: Vec<FeatureRow> =
        derive_features("ABC", rows.clone(), &earnings, wide_range()).collect();

    let range = DateRange::new(date(2024, 2, 5), date(2024, 2, 10));
    let sliced: Vec<FeatureRow> = derive_features("ABC", rows, &earnings, range).collect();

    assert_eq!(sliced.len(), 6);
    assert_eq!(sliced[0].date, range.start);
    let expected: Vec<FeatureRow> = full
        .into_iter()
        .filter(|row| range.contains(row.date))
        .collect();
    assert_eq!(sliced, expected);
    assert!(sliced[0].close_lag1.is_some());
    assert!(sliced[0].volatility_30_days.is_some());
}

#[test]
fn range_before_history_or_empty_input_yields_nothing() {
    let earnings = EarningsCalendar::default();
    let rows = series("ABC", date(2024, 1, 1), 10);
    let before = DateRange::new(date(2020, 1, 1), date(2020, 12, 31));
    assert_eq!(derive_features("ABC", rows, &earnings, before).count(), 0);

    assert_eq!(
        derive_features("ABC", Vec::new(), &earnings, wide_range()).count(),
        0
    );
}

#[test]
fn earning_day_flag_matches_calendar_for_ticker_only() {
    let events = vec![
        EarningsEvent {
            ticker: "ABC".to_string(),
            earnings_date: date(2024, 1, 3),
        },
        EarningsEvent {
            ticker: "XYZ".to_string(),
            earnings_date: date(2024, 1, 4),
        },
    ];
    let earnings = EarningsCalendar::for_ticker("ABC", &events);
    assert_eq!(earnings.len(), 1);

    let rows = series("ABC", date(2024, 1, 2), 3);
    let out: Vec<FeatureRow> = derive_features("ABC", rows, &earnings, wide_range()).collect();

    let flags: Vec<bool> = out.iter().map(|row| row.is_earning_day).collect();
    assert_eq!(flags, vec![false, true, false]);
}
