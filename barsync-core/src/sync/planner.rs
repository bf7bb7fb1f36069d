//! Sync planner: decide what date range each (instrument, frequency) still needs.
//!
//! Pure: reads nothing, writes nothing. The caller supplies the sync state.

use crate::config::UpdateMode;
use crate::domain::{DateRange, DownloadJob, Frequency, Instrument, SyncState};
use std::collections::HashSet;

/// Why a pair needs no job this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Listing date falls after the requested end.
    NotYetListed,
    /// Already synced through the requested end.
    UpToDate,
}

/// Planner verdict for one pair.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanDecision {
    Job(DownloadJob),
    Skip {
        code: String,
        frequency: Frequency,
        reason: SkipReason,
    },
}

/// Plan one (instrument, frequency) pair.
///
/// - `Full` requests `configured` as is
/// - `Incremental` and `Custom` resume at [`SyncState::resume_date`], or
///   request `configured` when no state exists
///
/// A start before the listing date is clamped to it.
pub fn plan(
    instrument: &Instrument,
    frequency: Frequency,
    mode: UpdateMode,
    configured: DateRange,
    state: Option<&SyncState>,
    retry_budget: u32,
) -> PlanDecision {
    let skip = |reason| PlanDecision::Skip {
        code: instrument.code.clone(),
        frequency,
        reason,
    };

    if instrument.listed_after(configured.end) {
        return skip(SkipReason::NotYetListed);
    }

    let mut start = match (mode, state) {
        (UpdateMode::Full, _) | (_, None) => configured.start,
        (UpdateMode::Incremental | UpdateMode::Custom, Some(s)) => match s.resume_date() {
            Some(next) => next,
            None => return skip(SkipReason::UpToDate),
        },
    };
    if let Some(listed) = instrument.list_date {
        start = start.max(listed);
    }

    let range = DateRange::new(start, configured.end);
    if range.is_empty() {
        return skip(SkipReason::UpToDate);
    }
    PlanDecision::Job(DownloadJob {
        instrument: instrument.clone(),
        frequency,
        range,
        retry_budget,
    })
}

/// Keep the first job per (code, frequency).
pub fn dedup_jobs(jobs: Vec<DownloadJob>) -> Vec<DownloadJob> {
    let mut seen = HashSet::new();
    jobs.into_iter()
        .filter(|j| seen.insert((j.instrument.code.clone(), j.frequency)))
        .collect()
}
