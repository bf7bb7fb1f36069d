//! Planning and execution of sync runs.

pub mod job;
pub mod planner;
pub mod runner;

pub use job::{run_job, JobContext, JobError, JobOutcome, JobStatus};
pub use planner::{dedup_jobs, plan, PlanDecision, SkipReason};
pub use runner::{run_sync, LogProgress, NoProgress, Selection, SyncError, SyncProgress, SyncReport};
