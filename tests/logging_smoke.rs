use std::io;
use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use daily_features::{
    log_app_start, log_run_report, run_feature_build, FeatureStore, LoggingConfig, RunContext,
    StoreConfig,
};
use rusqlite::Connection;
use tempfile::TempDir;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

fn seeded_store(dir: &TempDir) -> StoreConfig {
    let raw_path = dir.path().join("raw.sqlite");
    let conn = Connection::open(&raw_path).expect("raw store opens");
    conn.execute_batch(
        "
        CREATE TABLE prices_daily (
            date TEXT, ticker TEXT, open REAL, high REAL, low REAL, close REAL, volume INTEGER
        );
        CREATE TABLE earnings_dates (ticker TEXT, earnings_date TEXT);
        INSERT INTO prices_daily VALUES
            ('2024-01-02', 'ABC', 10.0, 11.5, 9.5, 11.0, 1000),
            ('2024-01-03', 'ABC', 11.0, 11.5, 8.5, 9.0, 1200),
            ('2024-01-04', 'ABC', NULL, 9.5, 8.5, 9.2, 900);
        ",
    )
    .expect("raw store is seeded");
    StoreConfig::with_paths(raw_path, dir.path().join("analytics.sqlite"))
}

#[test]
fn successful_run_emits_lifecycle_events() {
    let dir = TempDir::new().expect("tempdir");
    let cfg = seeded_store(&dir);

    let logs = capture_logs(Level::INFO, || {
        let ctx = RunContext::full("ABC", "run-1");
        let mut store = FeatureStore::open(cfg).expect("store opens");
        log_app_start(&LoggingConfig::default(), store.config(), &ctx);
        let report = run_feature_build(&mut store, &ctx).expect("run succeeds");
        log_run_report(&report);
        assert_eq!(report.malformed_rows, 1);
    });

    for event in [
        "app.start",
        "store.open",
        "features.run.start",
        "features.schema.ready",
        "features.range.resolved",
        "store.raw.loaded",
        "features.derive.malformed_row",
        "features.materialize.finish",
        "features.run.finish",
        "app.report",
    ] {
        assert!(
            logs.contains(&format!("\"event\":\"{event}\"")),
            "missing {event} in {logs}"
        );
    }
    assert!(!logs.contains("\"event\":\"features.run.error\""));
}

#[test]
fn failed_run_emits_error_event_with_kind() {
    let dir = TempDir::new().expect("tempdir");
    let cfg = seeded_store(&dir);

    let logs = capture_logs(Level::INFO, || {
        let mut store = FeatureStore::open(cfg).expect("store opens");
        let start = NaiveDate::from_ymd_opt(2024, 2, 1).expect("valid date");
        let end = NaiveDate::from_ymd_opt(2024, 1, 1).expect("valid date");
        let ctx = RunContext::by_date_range("ABC", start, end, "run-1");
        run_feature_build(&mut store, &ctx).expect_err("inverted range fails");
    });

    assert!(logs.contains("\"event\":\"features.run.start\""));
    assert!(logs.contains("\"event\":\"features.run.error\""));
    assert!(logs.contains("\"kind\":\"invalid_range\""));
    assert!(!logs.contains("\"event\":\"features.range.resolved\""));
}

#[test]
fn skipped_rows_are_logged_at_debug_only() {
    let dir = TempDir::new().expect("tempdir");
    let cfg = seeded_store(&dir);
    let mut store = FeatureStore::open(cfg).expect("store opens");
    run_feature_build(&mut store, &RunContext::full("ABC", "run-1")).expect("first run");

    let info_logs = capture_logs(Level::INFO, || {
        run_feature_build(&mut store, &RunContext::full("ABC", "run-2")).expect("skip rerun");
    });
    assert!(!info_logs.contains("\"event\":\"features.materialize.row_skipped\""));

    let debug_logs = capture_logs(Level::DEBUG, || {
        run_feature_build(&mut store, &RunContext::full("ABC", "run-3")).expect("skip rerun");
    });
    assert!(debug_logs.contains("\"event\":\"features.materialize.row_skipped\""));
}
