//! Barsync Core — incremental market-bar sync engine.
//!
//! This crate contains everything except the command line:
//! - Domain types (instruments, frequencies, bar rows, sync checkpoints, jobs)
//! - Configuration loaded from TOML
//! - Provider traits, the Tushare client, pacing and retries
//! - Window splitting, batched fetching and anchored back-adjustment
//! - Merge-on-write table store and per-pair sync state
//! - Planner and worker-pool runner producing a run report

pub mod config;
pub mod data;
pub mod domain;
pub mod status;
pub mod sync;

pub use config::{ConfigError, SyncConfig, UpdateMode};
pub use sync::{run_sync, Selection, SyncError, SyncReport};
