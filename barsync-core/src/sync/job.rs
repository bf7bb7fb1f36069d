//! One job, end to end: split → fetch → adjust → merge-write → checkpoint.

use super::planner::SkipReason;
use crate::data::{
    adjust, fetch_all, split, BarProvider, FetchFailure, RateLimiter, StoreError, SyncStateStore, TableStore,
    WriteFailure,
};
use crate::domain::{DownloadJob, Frequency};
use chrono::NaiveDateTime;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Why a job failed. Each variant leaves the stored table and sync state as they were.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Fetch(#[from] FetchFailure),

    #[error(transparent)]
    Write(#[from] WriteFailure),

    #[error("failed to read stored table: {0}")]
    Read(#[source] StoreError),

    #[error("table written but sync state not saved: {0}")]
    State(#[source] StoreError),
}

#[derive(Debug)]
pub enum JobStatus {
    Succeeded {
        rows_written: usize,
        /// `None` when the provider had no rows for the range.
        last_synced: Option<NaiveDateTime>,
    },
    Skipped(SkipReason),
    Failed(JobError),
}

/// Per-pair result collected into the run report.
#[derive(Debug)]
pub struct JobOutcome {
    pub code: String,
    pub frequency: Frequency,
    pub status: JobStatus,
    pub elapsed: Duration,
}

impl JobOutcome {
    pub fn skipped(code: String, frequency: Frequency, reason: SkipReason) -> Self {
        Self {
            code,
            frequency,
            status: JobStatus::Skipped(reason),
            elapsed: Duration::ZERO,
        }
    }

    pub fn label(&self) -> String {
        format!("{}@{}", self.code, self.frequency)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, JobStatus::Failed(_))
    }
}

/// Shared collaborators a worker needs.
pub struct JobContext<'a> {
    pub provider: &'a dyn BarProvider,
    pub limiter: &'a RateLimiter,
    pub store: &'a TableStore,
    pub states: &'a SyncStateStore,
}

/// Execute one job and report its outcome. Never panics on provider or storage errors.
pub fn run_job(job: &DownloadJob, ctx: &JobContext<'_>) -> JobOutcome {
    let started = Instant::now();
    let status = match execute(job, ctx) {
        Ok((rows_written, last_synced)) => JobStatus::Succeeded {
            rows_written,
            last_synced,
        },
        Err(e) => {
            tracing::error!(job = %job.label(), range = %job.range, error = %e, "job failed");
            JobStatus::Failed(e)
        }
    };
    JobOutcome {
        code: job.instrument.code.clone(),
        frequency: job.frequency,
        status,
        elapsed: started.elapsed(),
    }
}

fn execute(job: &DownloadJob, ctx: &JobContext<'_>) -> Result<(usize, Option<NaiveDateTime>), JobError> {
    let inst = &job.instrument;
    let windows = split(job.range, job.frequency);
    tracing::debug!(job = %job.label(), range = %job.range, windows = windows.len(), "job started");

    let rows = fetch_all(ctx.provider, ctx.limiter, inst, job.frequency, &windows, job.retry_budget)?;
    if rows.is_empty() {
        tracing::info!(job = %job.label(), range = %job.range, "no rows returned");
        return Ok((0, None));
    }

    let summary = if job.frequency.is_intraday() {
        ctx.store
            .merge_write(inst.asset_class, job.frequency, &inst.code, rows, None)?
    } else {
        let existing = ctx
            .store
            .read(inst.asset_class, job.frequency, &inst.code)
            .map_err(JobError::Read)?;
        let stored_anchor = ctx
            .store
            .read_meta(inst.asset_class, job.frequency, &inst.code)
            .and_then(|m| m.anchor_factor);
        let adjusted = adjust(rows, &existing, stored_anchor);
        ctx.store.merge_write_onto(
            inst.asset_class,
            job.frequency,
            &inst.code,
            existing,
            adjusted.rows,
            adjusted.anchor,
        )?
    };

    let last_synced = summary.max_time;
    if let Some(time) = last_synced {
        ctx.states
            .save(&inst.code, job.frequency, time)
            .map_err(JobError::State)?;
    }

    tracing::info!(
        job = %job.label(),
        rows = summary.rows_written,
        total = summary.total_rows,
        last_synced = ?last_synced,
        "job complete"
    );
    Ok((summary.rows_written, last_synced))
}
