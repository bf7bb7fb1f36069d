//! Back-adjustment of daily prices against a fixed anchor factor.
//!
//! `adjusted(t) = raw(t) * factor(t) / anchor`
//!
//! The anchor is the newest factor of the first batch ever written for a
//! table. It is recorded in the table's metadata sidecar and reused for every
//! later batch, so values already in the archive never need rewriting and a
//! re-fetch of the same rows reproduces the same adjusted values bit for bit.

use crate::domain::BarRow;

/// Adjusted rows plus the anchor they were computed against.
#[derive(Debug, Clone, PartialEq)]
pub struct Adjusted {
    /// Rows sorted newest first.
    pub rows: Vec<BarRow>,
    /// `None` when neither the archive nor the batch carries any factor.
    pub anchor: Option<f64>,
}

/// Recover the anchor from stored rows when the sidecar does not carry it.
///
/// Uses the newest row holding a factor together with its raw and adjusted close.
pub fn recover_anchor(existing: &[BarRow]) -> Option<f64> {
    existing
        .iter()
        .filter(|r| r.close != 0.0)
        .filter_map(|r| match (r.adj_factor, r.adj_close) {
            (Some(f), Some(adj)) if adj != 0.0 => Some((r.time, f * r.close / adj)),
            _ => None,
        })
        .max_by_key(|(time, _)| *time)
        .map(|(_, anchor)| anchor)
}

/// Fill back-adjusted OHLC fields for `rows`.
///
/// * `existing`: rows already stored for the same table; seeds carry-forward
///   of missing factors and is used to recover the anchor.
/// * `stored_anchor`: anchor recorded in the table metadata, if any.
///
/// Missing factors take the most recent earlier factor (the stored tail
/// included); rows before the first known factor take the earliest known one.
/// With no factor history at all, adjusted prices equal raw prices.
pub fn adjust(rows: Vec<BarRow>, existing: &[BarRow], stored_anchor: Option<f64>) -> Adjusted {
    let mut rows = rows;
    rows.sort_by(|a, b| a.time.cmp(&b.time));

    let Some(earliest) = rows.first().map(|r| r.time) else {
        return Adjusted {
            rows,
            anchor: stored_anchor.or_else(|| recover_anchor(existing)),
        };
    };

    let seed = existing
        .iter()
        .filter(|r| r.time < earliest)
        .filter_map(|r| r.adj_factor.map(|f| (r.time, f)))
        .max_by_key(|(time, _)| *time)
        .map(|(_, f)| f);

    // Forward fill, seeded by the stored tail.
    let mut current = seed;
    for row in rows.iter_mut() {
        match row.adj_factor {
            Some(f) => current = Some(f),
            None => row.adj_factor = current,
        }
    }
    // Back fill any leading gap from the earliest factor in the batch.
    if let Some(first_known) = rows.iter().find_map(|r| r.adj_factor) {
        for row in rows.iter_mut().take_while(|r| r.adj_factor.is_none()) {
            row.adj_factor = Some(first_known);
        }
    }

    let anchor = stored_anchor
        .or_else(|| recover_anchor(existing))
        .or_else(|| rows.last().and_then(|r| r.adj_factor));

    for row in rows.iter_mut() {
        let scale = match (row.adj_factor, anchor) {
            (Some(f), Some(a)) if a != 0.0 => f / a,
            _ => 1.0,
        };
        row.adj_open = Some(row.open * scale);
        row.adj_high = Some(row.high * scale);
        row.adj_low = Some(row.low * scale);
        row.adj_close = Some(row.close * scale);
    }

    rows.reverse();
    Adjusted { rows, anchor }
}
