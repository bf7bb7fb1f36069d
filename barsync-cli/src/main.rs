//! Barsync CLI — reference refresh, bar sync and archive status commands.
//!
//! Commands:
//! - `init-config`: write a template config file
//! - `update-ref`: download instrument reference lists
//! - `sync`: incremental (or full) bar sync into the local archive
//! - `status`: per-table sync status and missing instruments

use anyhow::{bail, Context, Result};
use barsync_core::config::{DateSetting, SyncConfig, UpdateMode};
use barsync_core::data::catalog::parse_compact_date;
use barsync_core::data::{refresh_reference, Catalog, RateLimiter, SyncStateStore, TableStore, TushareClient};
use barsync_core::domain::{AssetClass, Frequency};
use barsync_core::status::status;
use barsync_core::sync::{run_sync, JobStatus, LogProgress, Selection};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "barsync", about = "Incremental market bar sync")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, short, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a template config file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Download instrument reference lists (equities, funds, indices).
    UpdateRef,
    /// Sync bars for the selected instruments.
    Sync {
        /// Update mode: full, incremental or custom. Overrides the config.
        #[arg(long)]
        mode: Option<UpdateMode>,

        /// Start date (YYYYMMDD or YYYY-MM-DD). Forces full mode.
        #[arg(long)]
        start: Option<String>,

        /// End date (YYYYMMDD or YYYY-MM-DD). Forces full mode.
        #[arg(long)]
        end: Option<String>,

        /// Worker threads.
        #[arg(long)]
        threads: Option<usize>,

        /// Frequencies (daily, minute_1, minute_5, ...). Repeatable.
        #[arg(long = "freq")]
        frequencies: Vec<Frequency>,

        /// Asset classes (equity, fund, index). Repeatable; defaults to all.
        #[arg(long = "asset")]
        assets: Vec<AssetClass>,

        /// Explicit instrument codes (e.g. 600000.SH). Repeatable.
        #[arg(long = "code")]
        codes: Vec<String>,

        /// Sync the headline index list.
        #[arg(long, default_value_t = false)]
        major_indices: bool,

        /// Maximum instruments per asset class.
        #[arg(long)]
        limit: Option<usize>,

        /// Only instruments without a stored table.
        #[arg(long, default_value_t = false)]
        missing_only: bool,
    },
    /// Report sync status of the archive.
    Status {
        /// Asset classes. Repeatable; defaults to all.
        #[arg(long = "asset")]
        assets: Vec<AssetClass>,

        /// Frequencies. Repeatable; defaults to the configured ones.
        #[arg(long = "freq")]
        frequencies: Vec<Frequency>,

        /// List the codes that have no table.
        #[arg(long, default_value_t = false)]
        show_missing: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::InitConfig { force } => {
            init_logging("info");
            run_init_config(&cli.config, force)
        }
        Commands::UpdateRef => {
            let config = load_config(&cli.config)?;
            run_update_ref(&config)
        }
        Commands::Sync {
            mode,
            start,
            end,
            threads,
            frequencies,
            assets,
            codes,
            major_indices,
            limit,
            missing_only,
        } => {
            let mut config = load_config(&cli.config)?;
            if let Some(mode) = mode {
                config.date_ranges.update_mode = mode;
            }
            if let Some(start) = start {
                config.date_ranges.default_start_date = DateSetting::Fixed(parse_date(&start)?);
                config.date_ranges.update_mode = UpdateMode::Full;
            }
            if let Some(end) = end {
                config.date_ranges.default_end_date = DateSetting::Fixed(parse_date(&end)?);
                config.date_ranges.update_mode = UpdateMode::Full;
            }
            if let Some(threads) = threads {
                config.threads = threads;
            }
            if !frequencies.is_empty() {
                config.frequencies = frequencies;
            }
            let selection = Selection {
                asset_classes: if assets.is_empty() { AssetClass::ALL.to_vec() } else { assets },
                codes,
                major_indices,
                limit,
                missing_only,
            };
            run_sync_cmd(&config, &selection)
        }
        Commands::Status {
            assets,
            frequencies,
            show_missing,
        } => {
            let config = load_config(&cli.config)?;
            let assets = if assets.is_empty() { AssetClass::ALL.to_vec() } else { assets };
            let frequencies = if frequencies.is_empty() { config.frequencies.clone() } else { frequencies };
            run_status(&config, &assets, &frequencies, show_missing)
        }
    }
}

/// `RUST_LOG` wins; otherwise the config's level.
fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn load_config(path: &Path) -> Result<SyncConfig> {
    if !path.exists() {
        bail!(
            "config file {} not found; run `barsync init-config` first",
            path.display()
        );
    }
    let config = SyncConfig::from_file(path)?;
    init_logging(&config.log_level);
    tracing::debug!(path = %path.display(), data_root = %config.data_root.display(), "config loaded");
    Ok(config)
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    match parse_compact_date(s).with_context(|| format!("invalid date '{s}'"))? {
        Some(d) => Ok(d),
        None => bail!("empty date"),
    }
}

fn run_init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    std::fs::write(path, SyncConfig::template().to_toml()?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("Wrote template config to {}", path.display());
    println!("Set provider.token before running `barsync update-ref`.");
    Ok(())
}

fn build_client(config: &SyncConfig, limiter: &Arc<RateLimiter>) -> Result<TushareClient> {
    let client = TushareClient::new(
        config.provider.token.clone(),
        config.provider.url.clone(),
        config.provider_timeout(),
    )?;
    Ok(client.with_pacer(Arc::clone(limiter)))
}

fn run_update_ref(config: &SyncConfig) -> Result<()> {
    config.validate()?;
    let limiter = Arc::new(RateLimiter::new(config.pacing_interval()));
    let client = build_client(config, &limiter)?;

    let report = refresh_reference(&client, &limiter, config.pacing.retry, &config.data_root)?;
    for (class, count) in &report.updated {
        println!("  OK: {class} ({count} instruments)");
    }
    for (class, failure) in &report.failed {
        println!("  FAIL: {class}: {failure}");
    }
    if !report.failed.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

fn run_sync_cmd(config: &SyncConfig, selection: &Selection) -> Result<()> {
    config.validate()?;
    let limiter = Arc::new(RateLimiter::new(config.pacing_interval()));
    let client = build_client(config, &limiter)?;

    let catalog = Catalog::load(&config.data_root)?;
    if catalog.is_empty() && selection.codes.is_empty() && !selection.major_indices {
        bail!("no reference lists under {}; run `barsync update-ref` first", config.data_root.display());
    }

    let report = run_sync(config, &client, &limiter, &catalog, selection, &LogProgress)?;

    println!(
        "Synced {} pair(s): {} ok, {} skipped, {} failed, {} rows written in {:.1}s",
        report.total(),
        report.succeeded,
        report.skipped,
        report.failed,
        report.rows_written,
        report.elapsed.as_secs_f64()
    );
    if !report.all_succeeded() {
        for outcome in report.failures() {
            if let JobStatus::Failed(e) = &outcome.status {
                eprintln!("Error for {}: {e}", outcome.label());
            }
        }
        std::process::exit(1);
    }
    Ok(())
}

fn run_status(config: &SyncConfig, assets: &[AssetClass], frequencies: &[Frequency], show_missing: bool) -> Result<()> {
    let store = TableStore::new(&config.data_root);
    let states = SyncStateStore::new(&config.data_root);
    let catalog = Catalog::load(&config.data_root)?;

    for &class in assets {
        for &frequency in frequencies {
            let report = status(&store, &states, &catalog, class, frequency)?;
            let newest = report.tables.iter().filter_map(|t| t.last_synced).max();
            let oldest = report.tables.iter().filter_map(|t| t.last_synced).min();
            println!(
                "{class:<6} {frequency:<10} catalog {:>6}  stored {:>6}  missing {:>6}  coverage {:>5.1}%  synced {} .. {}",
                report.catalog_total,
                report.stored(),
                report.missing.len(),
                report.coverage_pct(),
                oldest.map_or_else(|| "-".to_string(), |d| d.to_string()),
                newest.map_or_else(|| "-".to_string(), |d| d.to_string()),
            );
            if show_missing && !report.missing.is_empty() {
                println!("  missing: {}", report.missing.join(", "));
            }
        }
    }
    Ok(())
}
