//! End-to-end sync runs against a scripted in-memory provider.

use barsync_core::config::{DateSetting, SyncConfig, UpdateMode};
use barsync_core::data::{BarProvider, Catalog, ProviderError, RateLimiter, SyncStateStore, TableStore};
use barsync_core::domain::{day_start, AssetClass, BarRow, DateRange, Frequency, Instrument, Window};
use barsync_core::sync::{run_sync, JobError, JobStatus, NoProgress, Selection, SkipReason, SyncError, SyncReport};
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
}

/// Serves bars from an in-memory market history and records every call.
#[derive(Default)]
struct MockProvider {
    history: Mutex<HashMap<String, Vec<BarRow>>>,
    calls: Mutex<Vec<(String, Window)>>,
    fatal: HashSet<String>,
    flaky: HashSet<String>,
}

impl MockProvider {
    /// One bar per day in `days`; `factor` gives each day's adjustment factor.
    fn with_history(mut self, code: &str, days: std::ops::RangeInclusive<u32>, factor: impl Fn(u32) -> f64) -> Self {
        let rows = days
            .map(|day| {
                let close = 10.0 + day as f64;
                let mut row = BarRow::new(code, day_start(d(day)), close, close + 0.5, close - 0.5, close, 1000.0, 1.0e4);
                row.adj_factor = Some(factor(day));
                row
            })
            .collect();
        self.history.get_mut().unwrap().insert(code.to_string(), rows);
        self
    }

    /// Append bars that appeared upstream since the last run.
    fn publish(&self, rows: Vec<BarRow>) {
        let mut history = self.history.lock().unwrap();
        for row in rows {
            history.entry(row.code.clone()).or_default().push(row);
        }
    }

    /// Every call for `code` is rejected as unauthenticated.
    fn failing(mut self, code: &str) -> Self {
        self.fatal.insert(code.to_string());
        self
    }

    /// Every call for `code` times out.
    fn timing_out(mut self, code: &str) -> Self {
        self.flaky.insert(code.to_string());
        self
    }

    fn calls_for(&self, code: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(c, _)| c == code).count()
    }

    fn calls(&self) -> Vec<(String, Window)> {
        self.calls.lock().unwrap().clone()
    }

    fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl BarProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn fetch(&self, instrument: &Instrument, _frequency: Frequency, window: Window) -> Result<Vec<BarRow>, ProviderError> {
        self.calls.lock().unwrap().push((instrument.code.clone(), window));
        if self.fatal.contains(&instrument.code) {
            return Err(ProviderError::AuthenticationRequired("token rejected".into()));
        }
        if self.flaky.contains(&instrument.code) {
            return Err(ProviderError::Timeout("upstream did not answer".into()));
        }
        let history = self.history.lock().unwrap();
        Ok(history
            .get(&instrument.code)
            .map(|rows| rows.iter().filter(|r| window.contains(r.date())).cloned().collect())
            .unwrap_or_default())
    }
}

fn config(root: &Path, start: NaiveDate, end: NaiveDate) -> SyncConfig {
    let mut c = SyncConfig::default();
    c.data_root = root.to_path_buf();
    c.threads = 2;
    c.pacing.sleep_ms = 0;
    c.pacing.retry = 1;
    c.date_ranges.default_start_date = DateSetting::Fixed(start);
    c.date_ranges.default_end_date = DateSetting::Fixed(end);
    c
}

fn minute_bar(code: &str, date: NaiveDate, hour: u32, minute: u32) -> BarRow {
    let time: NaiveDateTime = date.and_hms_opt(hour, minute, 0).unwrap();
    BarRow::new(code, time, 8.0, 8.1, 7.9, 8.05, 500.0, 4000.0)
}

fn equities(codes: &[&str]) -> Catalog {
    Catalog::from_instruments(codes.iter().map(|c| Instrument::new(*c, AssetClass::Equity, None)))
}

fn equity_only() -> Selection {
    Selection {
        asset_classes: vec![AssetClass::Equity],
        ..Selection::default()
    }
}

fn sync(config: &SyncConfig, provider: &MockProvider, catalog: &Catalog) -> SyncReport {
    let limiter = RateLimiter::new(Duration::ZERO);
    run_sync(config, provider, &limiter, catalog, &equity_only(), &NoProgress).unwrap()
}

fn stored(root: &Path, code: &str) -> Vec<BarRow> {
    TableStore::new(root).read(AssetClass::Equity, Frequency::Daily, code).unwrap()
}

#[test]
fn second_run_over_same_range_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::default().with_history("600000.SH", 1..=10, |_| 1.0);
    let catalog = equities(&["600000.SH"]);
    let cfg = config(dir.path(), d(1), d(10));

    let first = sync(&cfg, &provider, &catalog);
    assert_eq!(first.succeeded, 1);
    assert_eq!(first.rows_written, 10);
    let before = stored(dir.path(), "600000.SH");

    provider.clear_calls();
    let second = sync(&cfg, &provider, &catalog);
    assert!(provider.calls().is_empty(), "up-to-date pair must not hit the provider");
    assert_eq!(second.skipped, 1);
    assert!(matches!(second.outcomes[0].status, JobStatus::Skipped(SkipReason::UpToDate)));
    assert_eq!(stored(dir.path(), "600000.SH"), before);
}

#[test]
fn incremental_run_requests_only_days_after_last_sync() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::default().with_history("600000.SH", 1..=10, |_| 1.0);
    let catalog = equities(&["600000.SH"]);

    sync(&config(dir.path(), d(1), d(5)), &provider, &catalog);
    let state = SyncStateStore::new(dir.path()).load("600000.SH", Frequency::Daily).unwrap();
    assert_eq!(state.last_synced, day_start(d(5)));

    provider.clear_calls();
    let report = sync(&config(dir.path(), d(1), d(10)), &provider, &catalog);
    assert_eq!(report.rows_written, 5);
    assert_eq!(provider.calls(), vec![("600000.SH".to_string(), DateRange::new(d(6), d(10)))]);

    let rows = stored(dir.path(), "600000.SH");
    assert_eq!(rows.len(), 10);
    let state = SyncStateStore::new(dir.path()).load("600000.SH", Frequency::Daily).unwrap();
    assert_eq!(state.last_synced, day_start(d(10)));
}

#[test]
fn instrument_listed_after_range_is_skipped_without_a_call() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::default();
    let listed = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
    let catalog = Catalog::from_instruments(vec![Instrument::new("688999.SH", AssetClass::Equity, Some(listed))]);

    let report = sync(&config(dir.path(), d(1), d(10)), &provider, &catalog);
    assert!(provider.calls().is_empty());
    assert_eq!(report.skipped, 1);
    assert!(matches!(report.outcomes[0].status, JobStatus::Skipped(SkipReason::NotYetListed)));
    assert!(!TableStore::new(dir.path()).exists(AssetClass::Equity, Frequency::Daily, "688999.SH"));
}

#[test]
fn start_is_clamped_to_listing_date() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::default().with_history("301001.SZ", 4..=10, |_| 1.0);
    let catalog = Catalog::from_instruments(vec![Instrument::new("301001.SZ", AssetClass::Equity, Some(d(4)))]);

    sync(&config(dir.path(), d(1), d(10)), &provider, &catalog);
    assert_eq!(provider.calls(), vec![("301001.SZ".to_string(), DateRange::new(d(4), d(10)))]);
}

#[test]
fn one_failing_pair_does_not_affect_others() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::default()
        .with_history("600000.SH", 1..=10, |_| 1.0)
        .with_history("000001.SZ", 1..=10, |_| 1.0)
        .failing("000001.SZ");
    let catalog = equities(&["600000.SH", "000001.SZ"]);

    let report = sync(&config(dir.path(), d(1), d(10)), &provider, &catalog);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert!(!report.all_succeeded());

    let failed: Vec<String> = report.failures().map(|o| o.code.clone()).collect();
    assert_eq!(failed, vec!["000001.SZ"]);
    assert_eq!(stored(dir.path(), "600000.SH").len(), 10);

    let store = TableStore::new(dir.path());
    let states = SyncStateStore::new(dir.path());
    assert!(!store.exists(AssetClass::Equity, Frequency::Daily, "000001.SZ"));
    assert!(states.load("000001.SZ", Frequency::Daily).is_none());
}

#[test]
fn exhausted_retries_fail_only_their_own_pair() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::default()
        .with_history("600000.SH", 1..=10, |_| 1.0)
        .timing_out("000001.SZ");
    let catalog = equities(&["600000.SH", "000001.SZ"]);
    let mut cfg = config(dir.path(), d(1), d(10));
    cfg.pacing.retry = 3;

    let report = sync(&cfg, &provider, &catalog);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(provider.calls_for("000001.SZ"), 3);
    assert_eq!(provider.calls_for("600000.SH"), 1);

    let failure = report.failures().next().unwrap();
    match &failure.status {
        JobStatus::Failed(JobError::Fetch(f)) => {
            assert_eq!(f.cause.attempts, 3);
            assert_eq!(f.failed_window, DateRange::new(d(1), d(10)));
        }
        other => panic!("expected fetch failure, got {other:?}"),
    }

    let states = SyncStateStore::new(dir.path());
    assert_eq!(states.load("600000.SH", Frequency::Daily).unwrap().last_synced, day_start(d(10)));
    assert!(states.load("000001.SZ", Frequency::Daily).is_none());
}

#[test]
fn intraday_sync_completes_a_day_first_seen_mid_session() {
    let dir = tempfile::tempdir().unwrap();
    let code = "600000.SH";
    let feb = |day| NaiveDate::from_ymd_opt(2024, 2, day).unwrap();
    let provider = MockProvider::default();
    provider.publish(vec![
        minute_bar(code, d(30), 9, 35),
        minute_bar(code, d(30), 15, 0),
        minute_bar(code, d(31), 15, 0),
        minute_bar(code, feb(1), 10, 30),
    ]);
    let catalog = equities(&[code]);
    let mut cfg = config(dir.path(), d(30), feb(1));
    cfg.frequencies = vec![Frequency::Minute5];

    let first = sync(&cfg, &provider, &catalog);
    assert_eq!(first.succeeded, 1);
    // The span crosses a month boundary, so it goes out as two windows.
    assert_eq!(
        provider.calls(),
        vec![
            (code.to_string(), DateRange::new(d(30), d(31))),
            (code.to_string(), DateRange::new(feb(1), feb(1))),
        ]
    );
    assert!(dir.path().join("data/equities/minute_5/600000.SH.parquet").is_file());
    let states = SyncStateStore::new(dir.path());
    assert_eq!(states.load(code, Frequency::Minute5).unwrap().last_synced, minute_bar(code, feb(1), 10, 30).time);

    // The rest of Feb 1 and all of Feb 2 arrive upstream.
    provider.publish(vec![
        minute_bar(code, feb(1), 14, 0),
        minute_bar(code, feb(1), 15, 0),
        minute_bar(code, feb(2), 15, 0),
    ]);
    provider.clear_calls();
    cfg.date_ranges.default_end_date = DateSetting::Fixed(feb(2));
    sync(&cfg, &provider, &catalog);
    assert_eq!(provider.calls(), vec![(code.to_string(), DateRange::new(feb(1), feb(2)))]);

    let rows = TableStore::new(dir.path())
        .read(AssetClass::Equity, Frequency::Minute5, code)
        .unwrap();
    assert_eq!(rows.iter().filter(|r| r.date() == feb(1)).count(), 3);
    assert_eq!(rows.len(), 7);
    assert!(rows.windows(2).all(|w| w[0].time > w[1].time));
    assert!(rows.iter().all(|r| r.adj_close.is_none()));

    // Feb 2 closed at 15:00, so a third run has nothing left to fetch.
    provider.clear_calls();
    let third = sync(&cfg, &provider, &catalog);
    assert!(provider.calls().is_empty());
    assert_eq!(third.skipped, 1);
}

#[test]
fn overlapping_full_runs_keep_one_row_per_date() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::default().with_history("510300.SH", 1..=10, |_| 1.0);
    let catalog = Catalog::from_instruments(vec![Instrument::new("510300.SH", AssetClass::Fund, None)]);
    let selection = Selection {
        asset_classes: vec![AssetClass::Fund],
        ..Selection::default()
    };
    let limiter = RateLimiter::new(Duration::ZERO);

    for (start, end) in [(1, 7), (4, 10), (1, 10)] {
        let mut cfg = config(dir.path(), d(start), d(end));
        cfg.date_ranges.update_mode = UpdateMode::Full;
        run_sync(&cfg, &provider, &limiter, &catalog, &selection, &NoProgress).unwrap();
    }

    let rows = TableStore::new(dir.path())
        .read(AssetClass::Fund, Frequency::Daily, "510300.SH")
        .unwrap();
    assert_eq!(rows.len(), 10);
    assert!(rows.windows(2).all(|w| w[0].time > w[1].time), "rows must be unique and newest first");
}

#[test]
fn adjusted_history_is_stable_across_a_split() {
    let dir = tempfile::tempdir().unwrap();
    // Factor halves from day 6 onward.
    let provider =
        MockProvider::default().with_history("600519.SH", 1..=10, |day| if day >= 6 { 0.5 } else { 1.0 });
    let catalog = equities(&["600519.SH"]);

    sync(&config(dir.path(), d(1), d(5)), &provider, &catalog);
    let early: Vec<(NaiveDate, Option<f64>)> = stored(dir.path(), "600519.SH")
        .iter()
        .map(|r| (r.date(), r.adj_close))
        .collect();
    assert!(early.iter().all(|(day, adj)| *adj == Some(10.0 + chrono::Datelike::day(day) as f64)));

    sync(&config(dir.path(), d(1), d(10)), &provider, &catalog);
    let rows = stored(dir.path(), "600519.SH");
    for (day, adj) in &early {
        let now = rows.iter().find(|r| r.date() == *day).unwrap();
        assert_eq!(now.adj_close, *adj, "adjusted close for {day} changed");
    }
    let split_day = rows.iter().find(|r| r.date() == d(6)).unwrap();
    assert_eq!(split_day.adj_close, Some(16.0 * 0.5));
}

#[test]
fn split_adjusted_close_holds_after_later_rows_arrive() {
    let dir = tempfile::tempdir().unwrap();
    // f(1) = 1.0, f(2) = 0.5: a 2-for-1 split on day 2.
    let provider =
        MockProvider::default().with_history("000002.SZ", 1..=3, |day| if day >= 2 { 0.5 } else { 1.0 });
    let catalog = equities(&["000002.SZ"]);
    let adj_close_on = |day| {
        stored(dir.path(), "000002.SZ")
            .iter()
            .find(|r| r.date() == d(day))
            .and_then(|r| r.adj_close)
    };

    sync(&config(dir.path(), d(1), d(2)), &provider, &catalog);
    assert_eq!(adj_close_on(1), Some(2.0 * 11.0));
    assert_eq!(adj_close_on(2), Some(12.0));

    sync(&config(dir.path(), d(1), d(3)), &provider, &catalog);
    assert_eq!(adj_close_on(1), Some(2.0 * 11.0));
    assert_eq!(adj_close_on(3), Some(13.0));
}

#[test]
fn unwritable_root_aborts_before_any_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not_a_dir");
    std::fs::write(&blocker, b"file").unwrap();

    let provider = MockProvider::default().with_history("600000.SH", 1..=10, |_| 1.0);
    let catalog = equities(&["600000.SH"]);
    let limiter = RateLimiter::new(Duration::ZERO);
    let cfg = config(&blocker, d(1), d(10));

    let err = run_sync(&cfg, &provider, &limiter, &catalog, &equity_only(), &NoProgress).unwrap_err();
    assert!(matches!(err, SyncError::StorageUnavailable(_)));
    assert!(provider.calls().is_empty());
}

#[test]
fn unknown_codes_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::default().with_history("600000.SH", 1..=3, |_| 1.0);
    let catalog = equities(&["600000.SH"]);
    let selection = Selection {
        asset_classes: vec![AssetClass::Equity],
        codes: vec!["600000.SH".into(), "999999.SH".into()],
        ..Selection::default()
    };
    let limiter = RateLimiter::new(Duration::ZERO);

    let report =
        run_sync(&config(dir.path(), d(1), d(3)), &provider, &limiter, &catalog, &selection, &NoProgress).unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.unknown_codes, vec!["999999.SH"]);
}
