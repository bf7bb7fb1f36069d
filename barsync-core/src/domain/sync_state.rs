//! Sync checkpoints, date ranges and download jobs.

use super::{Frequency, Instrument};
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Sub-range of a job's span sized for one provider call.
pub type Window = DateRange;

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// A range whose start lies after its end covers nothing.
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Number of calendar days covered (0 when empty).
    pub fn days(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            (self.end - self.start).num_days() + 1
        }
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Hour at which the exchange session closes. An intraday bar stamped at or
/// after it completes the trading day.
pub const SESSION_CLOSE_HOUR: u32 = 15;

/// Last successfully synced timestamp for one (instrument, frequency) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub code: String,
    pub frequency: Frequency,
    /// Newest bar timestamp in the stored table.
    pub last_synced: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl SyncState {
    /// First date an incremental run still has to request.
    ///
    /// Daily pairs resume the day after the checkpoint. Intraday pairs resume on
    /// the checkpoint's own date until a bar from the session close is stored,
    /// and the merge absorbs the bars fetched twice. `None` past the calendar end.
    pub fn resume_date(&self) -> Option<NaiveDate> {
        let date = self.last_synced.date();
        if self.frequency.is_intraday() && self.last_synced.hour() < SESSION_CLOSE_HOUR {
            Some(date)
        } else {
            date.succ_opt()
        }
    }
}

/// Unit of work handed from the planner to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadJob {
    pub instrument: Instrument,
    pub frequency: Frequency,
    pub range: DateRange,
    /// Attempts allowed per provider call.
    pub retry_budget: u32,
}

impl DownloadJob {
    /// `code@frequency`, used in logs and failure reports.
    pub fn label(&self) -> String {
        format!("{}@{}", self.instrument.code, self.frequency)
    }
}
