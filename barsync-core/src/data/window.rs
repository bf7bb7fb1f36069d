//! Window splitter: decompose a job's date span into provider-sized calls.
//!
//! Intraday row caps (8000 rows per call) hold roughly one month of one-minute
//! bars, so intraday spans are split on calendar month boundaries. Daily spans
//! always fit in one call.

use crate::domain::{DateRange, Frequency, Window};
use chrono::{Datelike, Months, NaiveDate};

/// Split `range` into contiguous, non-overlapping windows covering exactly `range`.
///
/// Returns an empty vector for an empty range.
pub fn split(range: DateRange, frequency: Frequency) -> Vec<Window> {
    if range.is_empty() {
        return Vec::new();
    }
    if !frequency.is_intraday() {
        return vec![range];
    }

    let mut windows = Vec::new();
    let mut current = range.start;
    loop {
        match first_of_next_month(current) {
            Some(next) if next <= range.end => {
                // next is a month start, so the day before always exists
                let month_end = next.pred_opt().unwrap_or(range.end);
                windows.push(Window::new(current, month_end));
                current = next;
            }
            _ => {
                windows.push(Window::new(current, range.end));
                break;
            }
        }
    }
    windows
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    date.with_day(1)?.checked_add_months(Months::new(1))
}
