//! Run orchestration: select instruments, plan, fan out, collect a report.

use super::job::{run_job, JobContext, JobOutcome, JobStatus};
use super::planner::{dedup_jobs, plan, PlanDecision};
use crate::config::SyncConfig;
use crate::data::{BarProvider, Catalog, RateLimiter, StoreError, SyncStateStore, TableStore, MAJOR_INDICES};
use crate::domain::{AssetClass, DownloadJob, Instrument};
use chrono::NaiveDate;
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Conditions that abort a run before any job starts.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("data root is not writable: {0}")]
    StorageUnavailable(#[source] StoreError),

    #[error("failed to build worker pool: {0}")]
    Pool(String),
}

/// Which instruments a run covers.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub asset_classes: Vec<AssetClass>,
    /// Explicit codes; when non-empty, catalog filters are bypassed.
    pub codes: Vec<String>,
    /// Use the headline index list for the index class.
    pub major_indices: bool,
    /// Cap per asset class, applied after catalog filters.
    pub limit: Option<usize>,
    /// Only pairs without a stored table.
    pub missing_only: bool,
}

impl Default for Selection {
    fn default() -> Self {
        Self {
            asset_classes: AssetClass::ALL.to_vec(),
            codes: Vec::new(),
            major_indices: false,
            limit: None,
            missing_only: false,
        }
    }
}

/// Callback for per-job progress reporting.
pub trait SyncProgress: Send + Sync {
    /// A worker picked up job `index` of `total`.
    fn on_job_start(&self, job: &DownloadJob, index: usize, total: usize);

    /// A job finished; `done` counts completions so far.
    fn on_job_complete(&self, outcome: &JobOutcome, done: usize, total: usize);

    /// Called once, after all jobs have finished.
    fn on_run_complete(&self, report: &SyncReport);
}

/// Progress reporter that writes through `tracing`.
pub struct LogProgress;

impl SyncProgress for LogProgress {
    fn on_job_start(&self, job: &DownloadJob, index: usize, total: usize) {
        tracing::debug!(job = %job.label(), index = index + 1, total, range = %job.range, "starting");
    }

    fn on_job_complete(&self, outcome: &JobOutcome, done: usize, total: usize) {
        match &outcome.status {
            JobStatus::Succeeded { rows_written, .. } => {
                tracing::info!(job = %outcome.label(), done, total, rows = rows_written, "ok")
            }
            JobStatus::Failed(e) => tracing::warn!(job = %outcome.label(), done, total, error = %e, "failed"),
            JobStatus::Skipped(_) => {}
        }
    }

    fn on_run_complete(&self, report: &SyncReport) {
        report.log_summary();
    }
}

/// Progress reporter that does nothing.
pub struct NoProgress;

impl SyncProgress for NoProgress {
    fn on_job_start(&self, _: &DownloadJob, _: usize, _: usize) {}
    fn on_job_complete(&self, _: &JobOutcome, _: usize, _: usize) {}
    fn on_run_complete(&self, _: &SyncReport) {}
}

/// Outcome of a whole run.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rows_written: usize,
    pub elapsed: Duration,
    pub outcomes: Vec<JobOutcome>,
    /// Requested codes the catalog does not know.
    pub unknown_codes: Vec<String>,
}

impl SyncReport {
    fn from_outcomes(outcomes: Vec<JobOutcome>, unknown_codes: Vec<String>, elapsed: Duration) -> Self {
        let mut report = SyncReport {
            elapsed,
            unknown_codes,
            ..Default::default()
        };
        for o in &outcomes {
            match &o.status {
                JobStatus::Succeeded { rows_written, .. } => {
                    report.succeeded += 1;
                    report.rows_written += rows_written;
                }
                JobStatus::Skipped(_) => report.skipped += 1,
                JobStatus::Failed(_) => report.failed += 1,
            }
        }
        report.outcomes = outcomes;
        report
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    /// Failed pairs with their causes.
    pub fn failures(&self) -> impl Iterator<Item = &JobOutcome> {
        self.outcomes.iter().filter(|o| o.is_failure())
    }

    pub fn log_summary(&self) {
        tracing::info!(
            total = self.total(),
            succeeded = self.succeeded,
            skipped = self.skipped,
            failed = self.failed,
            rows = self.rows_written,
            elapsed_secs = self.elapsed.as_secs_f64(),
            "sync finished"
        );
        for o in self.failures() {
            if let JobStatus::Failed(e) = &o.status {
                tracing::error!(job = %o.label(), error = %e, "failed job");
            }
        }
        if !self.unknown_codes.is_empty() {
            tracing::warn!(codes = ?self.unknown_codes, "codes not found in catalog");
        }
    }
}

/// Resolve the instruments for one asset class.
fn select_instruments(
    config: &SyncConfig,
    catalog: &Catalog,
    selection: &Selection,
    class: AssetClass,
    today: NaiveDate,
    unknown: &mut Vec<String>,
) -> Vec<Instrument> {
    let mut instruments: Vec<Instrument> = if !selection.codes.is_empty() {
        selection
            .codes
            .iter()
            .filter_map(|code| match catalog.find(code) {
                Some(inst) if inst.asset_class == class => Some(inst.clone()),
                Some(_) => None,
                None => {
                    if !unknown.contains(code) {
                        unknown.push(code.clone());
                    }
                    None
                }
            })
            .collect()
    } else if selection.major_indices && class == AssetClass::Index {
        MAJOR_INDICES
            .iter()
            .map(|code| {
                catalog
                    .find(code)
                    .cloned()
                    .unwrap_or_else(|| Instrument::new(*code, AssetClass::Index, None))
            })
            .collect()
    } else {
        catalog.list_instruments(class, &config.filter_for(class, today))
    };
    if let Some(n) = selection.limit {
        instruments.truncate(n);
    }
    instruments
}

/// Run one sync pass.
///
/// Checks that the data root is writable, plans every selected pair, then runs
/// the jobs on a pool of `config.threads` workers. Individual job failures are
/// collected in the report; only storage or pool setup problems abort the run.
pub fn run_sync(
    config: &SyncConfig,
    provider: &dyn BarProvider,
    limiter: &RateLimiter,
    catalog: &Catalog,
    selection: &Selection,
    progress: &dyn SyncProgress,
) -> Result<SyncReport, SyncError> {
    let started = Instant::now();
    let today = chrono::Local::now().date_naive();
    let store = TableStore::new(&config.data_root);
    let states = SyncStateStore::new(&config.data_root);
    store.ensure_writable().map_err(SyncError::StorageUnavailable)?;

    let mode = config.mode();
    let mut outcomes = Vec::new();
    let mut jobs = Vec::new();
    let mut unknown = Vec::new();

    for class in &selection.asset_classes {
        let class = *class;
        if !config.is_enabled(class) {
            tracing::info!(asset_class = %class, "asset class disabled, skipping");
            continue;
        }
        let instruments = select_instruments(config, catalog, selection, class, today, &mut unknown);
        let configured = config.configured_range(class, today);
        let frequencies = config.frequencies_for(class);
        tracing::info!(
            asset_class = %class,
            instruments = instruments.len(),
            frequencies = ?frequencies,
            range = %configured,
            %mode,
            "planning"
        );

        for inst in &instruments {
            for &frequency in &frequencies {
                if selection.missing_only && store.exists(class, frequency, &inst.code) {
                    continue;
                }
                let state = states.load(&inst.code, frequency);
                match plan(inst, frequency, mode, configured, state.as_ref(), config.pacing.retry) {
                    PlanDecision::Job(job) => jobs.push(job),
                    PlanDecision::Skip { code, frequency, reason } => {
                        tracing::debug!(code = %code, %frequency, ?reason, "skipped");
                        outcomes.push(JobOutcome::skipped(code, frequency, reason));
                    }
                }
            }
        }
    }

    let jobs = dedup_jobs(jobs);
    let total = jobs.len();
    tracing::info!(
        jobs = total,
        skipped = outcomes.len(),
        threads = config.threads,
        pacing_ms = limiter.min_interval().as_millis() as u64,
        "dispatching"
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.threads.max(1))
        .build()
        .map_err(|e| SyncError::Pool(e.to_string()))?;

    let ctx = JobContext {
        provider,
        limiter,
        store: &store,
        states: &states,
    };
    let done = AtomicUsize::new(0);
    let finished: Vec<JobOutcome> = pool.install(|| {
        jobs.par_iter()
            .enumerate()
            .map(|(i, job)| {
                progress.on_job_start(job, i, total);
                let outcome = run_job(job, &ctx);
                let n = done.fetch_add(1, Ordering::SeqCst) + 1;
                progress.on_job_complete(&outcome, n, total);
                outcome
            })
            .collect()
    });
    outcomes.extend(finished);

    let report = SyncReport::from_outcomes(outcomes, unknown, started.elapsed());
    progress.on_run_complete(&report);
    Ok(report)
}
