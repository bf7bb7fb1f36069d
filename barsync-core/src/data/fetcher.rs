//! Batch fetcher: drive the provider across a job's windows.

use super::pacing::{CallFailure, RateLimiter};
use super::provider::BarProvider;
use crate::domain::{dedup_sorted_desc, BarRow, Frequency, Instrument, Window};
use thiserror::Error;

/// A job's window sequence could not be completed. No rows from the job are kept.
#[derive(Debug, Clone, Error)]
#[error("fetch failed for {code}@{frequency} in window {failed_window}: {cause}")]
pub struct FetchFailure {
    pub code: String,
    pub frequency: Frequency,
    pub failed_window: Window,
    #[source]
    pub cause: CallFailure,
}

/// Fetch every window in chronological order and return the combined rows,
/// deduplicated by key and sorted newest first.
///
/// Rows returned by a later window replace same-key rows from an earlier one,
/// which absorbs providers that repeat boundary rows.
pub fn fetch_all(
    provider: &dyn BarProvider,
    limiter: &RateLimiter,
    instrument: &Instrument,
    frequency: Frequency,
    windows: &[Window],
    attempts: u32,
) -> Result<Vec<BarRow>, FetchFailure> {
    let mut ordered: Vec<Window> = windows.to_vec();
    ordered.sort_by_key(|w| w.start);

    let label = format!("{}@{}", instrument.code, frequency);
    let mut combined: Vec<BarRow> = Vec::new();

    for (i, window) in ordered.iter().enumerate() {
        let rows = limiter
            .call(attempts, &label, || provider.fetch(instrument, frequency, *window))
            .map_err(|cause| FetchFailure {
                code: instrument.code.clone(),
                frequency,
                failed_window: *window,
                cause,
            })?;
        tracing::debug!(
            job = %label,
            window = i + 1,
            windows = ordered.len(),
            range = %window,
            rows = rows.len(),
            "window fetched"
        );
        combined.extend(rows);
    }

    let before = combined.len();
    let rows = dedup_sorted_desc(combined);
    if rows.len() != before {
        tracing::debug!(job = %label, before, after = rows.len(), "dropped duplicate boundary rows");
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::provider::ProviderError;
    use crate::data::window::split;
    use crate::domain::{day_start, AssetClass, DateRange};
    use chrono::NaiveDate;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Returns one row per calendar day in the window, plus a repeat of the
    /// window's first day when `overlap` is set.
    struct DailyRows {
        overlap: bool,
        fail_on: Option<NaiveDate>,
        calls: Mutex<Vec<Window>>,
    }

    impl DailyRows {
        fn new(overlap: bool, fail_on: Option<NaiveDate>) -> Self {
            Self { overlap, fail_on, calls: Mutex::new(Vec::new()) }
        }
    }

    impl BarProvider for DailyRows {
        fn name(&self) -> &str {
            "daily-rows"
        }

        fn fetch(&self, inst: &Instrument, _f: Frequency, w: Window) -> Result<Vec<BarRow>, ProviderError> {
            self.calls.lock().unwrap().push(w);
            if self.fail_on.is_some_and(|d| w.contains(d)) {
                return Err(ProviderError::Timeout("scripted".into()));
            }
            let mut rows: Vec<BarRow> = w
                .start
                .iter_days()
                .take_while(|d| *d <= w.end)
                .map(|d| BarRow::new(&inst.code, day_start(d), 1.0, 1.0, 1.0, 1.0, 1.0, 1.0))
                .collect();
            if self.overlap {
                if let Some(prev) = w.start.pred_opt() {
                    rows.push(BarRow::new(&inst.code, day_start(prev), 1.0, 1.0, 1.0, 1.0, 1.0, 1.0));
                }
            }
            Ok(rows)
        }
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn inst() -> Instrument {
        Instrument::new("600000.SH", AssetClass::Equity, None)
    }

    #[test]
    fn split_fetch_equals_single_fetch() {
        let provider = DailyRows::new(true, None);
        let limiter = RateLimiter::new(Duration::ZERO);
        let range = DateRange::new(d(2024, 1, 10), d(2024, 4, 20));

        let windows = split(range, Frequency::Minute1);
        assert_eq!(windows.len(), 4);
        let batched = fetch_all(&provider, &limiter, &inst(), Frequency::Minute1, &windows, 1).unwrap();
        let single = fetch_all(&provider, &limiter, &inst(), Frequency::Minute1, &[range], 1).unwrap();

        // The single call also carries one overlap row before the range start.
        let batched_in_range: Vec<_> = batched.iter().filter(|r| range.contains(r.date())).collect();
        let single_in_range: Vec<_> = single.iter().filter(|r| range.contains(r.date())).collect();
        assert_eq!(batched_in_range, single_in_range);
        assert_eq!(batched_in_range.len() as i64, range.days());
    }

    #[test]
    fn windows_fetched_in_chronological_order() {
        let provider = DailyRows::new(false, None);
        let limiter = RateLimiter::new(Duration::ZERO);
        let mut windows = split(DateRange::new(d(2024, 1, 1), d(2024, 3, 31)), Frequency::Minute5);
        windows.reverse();
        fetch_all(&provider, &limiter, &inst(), Frequency::Minute5, &windows, 1).unwrap();
        let calls = provider.calls.lock().unwrap();
        assert!(calls.windows(2).all(|p| p[0].start < p[1].start));
    }

    #[test]
    fn failed_window_fails_whole_job() {
        let provider = DailyRows::new(false, Some(d(2024, 2, 10)));
        let limiter = RateLimiter::new(Duration::ZERO);
        let windows = split(DateRange::new(d(2024, 1, 1), d(2024, 3, 31)), Frequency::Minute1);
        let err = fetch_all(&provider, &limiter, &inst(), Frequency::Minute1, &windows, 2).unwrap_err();
        assert_eq!(err.failed_window, Window::new(d(2024, 2, 1), d(2024, 2, 29)));
        assert_eq!(err.cause.attempts, 2);
        // Third window is never requested.
        let calls = provider.calls.lock().unwrap();
        assert!(calls.iter().all(|w| w.start < d(2024, 3, 1)));
    }
}
