//! BarRow — one stored market observation.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One observation for one instrument at one timestamp.
///
/// Daily rows carry midnight as their time of day and populate the
/// daily-only fields (previous close, change, adjustment factor and the
/// back-adjusted prices). Intraday rows leave them `None`.
///
/// Primary key: `(code, time)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarRow {
    pub code: String,
    pub time: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub amount: f64,
    pub pre_close: Option<f64>,
    pub change: Option<f64>,
    pub pct_chg: Option<f64>,
    pub adj_factor: Option<f64>,
    pub adj_open: Option<f64>,
    pub adj_high: Option<f64>,
    pub adj_low: Option<f64>,
    pub adj_close: Option<f64>,
}

impl BarRow {
    /// Bare OHLCV row with every optional field unset.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        code: impl Into<String>,
        time: NaiveDateTime,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        amount: f64,
    ) -> Self {
        Self {
            code: code.into(),
            time,
            open,
            high,
            low,
            close,
            volume,
            amount,
            pre_close: None,
            change: None,
            pct_chg: None,
            adj_factor: None,
            adj_open: None,
            adj_high: None,
            adj_low: None,
            adj_close: None,
        }
    }

    /// Trading date of the row.
    pub fn date(&self) -> NaiveDate {
        self.time.date()
    }
}

/// Midnight timestamp for a trading date.
pub fn day_start(date: NaiveDate) -> NaiveDateTime {
    date.and_time(chrono::NaiveTime::MIN)
}

/// Deduplicate by primary key and sort newest first.
///
/// When two rows share a key, the one appearing later in `rows` wins, so callers
/// put older data first and fresher data last.
pub fn dedup_sorted_desc(rows: Vec<BarRow>) -> Vec<BarRow> {
    let mut by_key: HashMap<(String, NaiveDateTime), BarRow> = HashMap::with_capacity(rows.len());
    for row in rows {
        by_key.insert((row.code.clone(), row.time), row);
    }
    let mut out: Vec<BarRow> = by_key.into_values().collect();
    out.sort_by(|a, b| a.code.cmp(&b.code).then(b.time.cmp(&a.time)));
    out
}
