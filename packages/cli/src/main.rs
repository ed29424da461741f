#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! `nyc311`: load NYC 311 extracts into `DuckDB`, sync windows to `MongoDB`
//! and check the two agree.
//!
//! Every subcommand assembles a [`config::PipelineConfig`] first, so missing
//! settings fail before any store is opened.

mod config;
mod progress;
mod workload;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use nyc311_database::primary;
use nyc311_document_store::mongo::{MongoConfig, MongoDocumentStore};
use nyc311_document_store::{DocumentStore, StoreError};
use nyc311_ingest::sync::{SyncEngine, SyncReport};
use nyc311_ingest::{IngestOptions, IngestOutcome, ingest_file, window};
use nyc311_request_models::SyncWindow;
use nyc311_source::progress::ProgressCallback as _;
use nyc311_validate::poll::{PollOptions, poll};
use nyc311_validate::{ConsistencyReport, check, check_strict, gauges};

use crate::config::PipelineConfig;
use crate::progress::IndicatifProgress;

#[derive(Parser)]
#[command(name = "nyc311", about = "NYC 311 load, sync and consistency tool")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Primary `DuckDB` file (overrides `NYC311_DB_PATH`)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

/// Window selection shared by several subcommands.
#[derive(Args, Clone, Copy, Default)]
struct WindowArgs {
    /// Calendar year to operate on
    #[arg(long, conflicts_with_all = ["start", "end"])]
    year: Option<i32>,
    /// Inclusive window start (YYYY-MM-DD)
    #[arg(long, requires = "end")]
    start: Option<NaiveDate>,
    /// Exclusive window end (YYYY-MM-DD)
    #[arg(long, requires = "start")]
    end: Option<NaiveDate>,
}

impl WindowArgs {
    fn resolve(self) -> Result<Option<SyncWindow>, Box<dyn std::error::Error>> {
        if let Some(year) = self.year {
            return SyncWindow::calendar_year(year)
                .map(Some)
                .ok_or_else(|| format!("Year {year} is out of range").into());
        }
        match (self.start, self.end) {
            (Some(start), Some(end)) => Ok(Some(SyncWindow::new(start, end)?)),
            _ => Ok(None),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Load an extract into the primary store
    Ingest {
        /// Extract to load (overrides `NYC311_CSV`)
        path: Option<PathBuf>,
        /// Reload even if the ingestion ledger already has this file
        #[arg(long)]
        force: bool,
        /// Rows per chunk (overrides `BATCH_SIZE`)
        #[arg(long)]
        chunk_size: Option<usize>,
        #[command(flatten)]
        window: WindowArgs,
    },
    /// Sync one window from the primary store to the secondary store
    Sync {
        #[command(flatten)]
        window: WindowArgs,
        /// Derive the window from this file name instead of the configured extract
        #[arg(long)]
        file: Option<String>,
        /// Maximum primary rows to sync (overrides `MONGO_SYNC_LIMIT`)
        #[arg(long)]
        limit: Option<u64>,
        /// Documents per write batch (overrides `SYNC_BATCH_SIZE`)
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Compare primary and secondary counts once; exits non-zero on a hard failure
    Validate {
        /// Without a window the whole stores are compared
        #[command(flatten)]
        window: WindowArgs,
        /// Tolerated mismatch (overrides `MISMATCH_THRESHOLD`)
        #[arg(long)]
        threshold: Option<u64>,
    },
    /// Re-run the consistency check on an interval and export Prometheus gauges
    Poll {
        #[command(flatten)]
        window: WindowArgs,
        /// Seconds between checks (overrides `POLL_INTERVAL_SECS`)
        #[arg(long)]
        interval: Option<u64>,
        /// Stop after this many checks
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        iterations: Option<u64>,
        /// Metrics listen address (overrides `METRICS_LISTEN`)
        #[arg(long)]
        listen: Option<std::net::SocketAddr>,
        /// Tolerated mismatch (overrides `MISMATCH_THRESHOLD`)
        #[arg(long)]
        threshold: Option<u64>,
    },
    /// Ingest an extract, sync its window, then validate that window
    Pipeline {
        /// Extract to load (overrides `NYC311_CSV`)
        path: Option<PathBuf>,
        /// Reload even if the ingestion ledger already has this file
        #[arg(long)]
        force: bool,
        /// Maximum primary rows to sync
        #[arg(long)]
        limit: Option<u64>,
        #[command(flatten)]
        window: WindowArgs,
    },
    /// Show the ingestion ledger (and optionally the sync ledger)
    Ledger {
        /// Also list sync ledger entries from the secondary store
        #[arg(long)]
        sync: bool,
        #[command(flatten)]
        window: WindowArgs,
    },
    /// Run concurrent read/update traffic against both stores
    Workload {
        /// Worker threads
        #[arg(long, default_value = "6")]
        workers: usize,
        /// Operations per worker
        #[arg(long, default_value = "50")]
        rounds: usize,
    },
}

fn connect_secondary(mongo: &MongoConfig) -> Result<MongoDocumentStore, StoreError> {
    MongoDocumentStore::connect(mongo)
}

/// The window for a sync: explicit flags, else the year in the file name,
/// else the current year.
fn sync_window(
    args: WindowArgs,
    file: Option<&str>,
    config: &PipelineConfig,
) -> Result<SyncWindow, Box<dyn std::error::Error>> {
    if let Some(window) = args.resolve()? {
        return Ok(window);
    }
    let identifier = file.map_or_else(
        || {
            config
                .extract_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        },
        str::to_string,
    );
    Ok(window::resolve_or_fallback(
        &identifier,
        None,
        window::current_year_window(),
    ))
}

fn print_sync_report(report: &SyncReport) {
    println!(
        "{}: {} documents in {} batches ({} deleted first), {:.1}s [{}]",
        report.window,
        report.documents,
        report.batches,
        report.deleted,
        report.elapsed.as_secs_f64(),
        report.status,
    );
}

fn print_consistency(report: &ConsistencyReport) {
    let scope = report
        .window
        .map_or_else(|| "all".to_string(), |w| w.to_string());
    println!(
        "{scope}: primary={} secondary={} mismatch={} -> {:?}",
        report.primary, report.secondary, report.mismatch, report.health
    );
}

#[allow(clippy::too_many_lines)]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = progress::init_logger();
    let cli = Cli::parse();

    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.primary_db_path = db;
    }

    match cli.command {
        Commands::Ingest {
            path,
            force,
            chunk_size,
            window,
        } => {
            if let Some(chunk_size) = chunk_size {
                config.chunk_size = chunk_size;
            }
            config.validate()?;
            let path = path.unwrap_or_else(|| config.extract_path.clone());
            let options = IngestOptions {
                chunk_size: config.chunk_size,
                force,
                window: window.resolve()?,
            };

            let conn = primary::open(&config.primary_db_path)?;
            let bar = IndicatifProgress::load_spinner(&multi, "Loading extract");
            match ingest_file(&conn, &path, &options, &bar)? {
                IngestOutcome::Skipped { filename } => {
                    println!("{filename} already loaded; use --force to reload");
                }
                IngestOutcome::Loaded(summary) => {
                    println!(
                        "{}: {} rows loaded into {} ({} raw, {} dropped), {:.1}s",
                        summary.filename,
                        summary.rows_loaded,
                        summary.window,
                        summary.stats.original,
                        summary.stats.dropped(),
                        summary.elapsed.as_secs_f64(),
                    );
                }
            }
        }
        Commands::Sync {
            window,
            file,
            limit,
            batch_size,
        } => {
            if let Some(batch_size) = batch_size {
                config.sync_batch_size = batch_size;
            }
            if limit.is_some() {
                config.sync_limit = limit;
            }
            config.validate()?;
            let mongo = config.mongo_config()?;
            let window = sync_window(window, file.as_deref(), &config)?;

            let conn = primary::open(&config.primary_db_path)?;
            let store = connect_secondary(&mongo)?;
            let bar = IndicatifProgress::sync_bar(&multi, "Syncing");
            let report = SyncEngine::new(&conn, &store, config.sync_options())
                .sync_window(&window, &bar)?;
            print_sync_report(&report);
        }
        Commands::Validate { window, threshold } => {
            if let Some(threshold) = threshold {
                config.mismatch_threshold = threshold;
            }
            let mongo = config.mongo_config()?;
            let window = window.resolve()?;

            let conn = primary::open(&config.primary_db_path)?;
            let store = connect_secondary(&mongo)?;
            let report = check_strict(&conn, &store, window.as_ref(), &config.policy())?;
            print_consistency(&report);
        }
        Commands::Poll {
            window,
            interval,
            iterations,
            listen,
            threshold,
        } => {
            if let Some(interval) = interval {
                config.poll_interval_secs = interval;
            }
            if let Some(listen) = listen {
                config.metrics_listen = listen;
            }
            if let Some(threshold) = threshold {
                config.mismatch_threshold = threshold;
            }
            config.validate()?;
            let mongo = config.mongo_config()?;
            let window = window.resolve()?;

            let conn = primary::open(&config.primary_db_path)?;
            let store = connect_secondary(&mongo)?;
            gauges::install_exporter(config.metrics_listen)?;

            let policy = config.policy();
            let options = PollOptions {
                interval: config.poll_interval(),
                iterations,
            };
            let stop = AtomicBool::new(false);
            let summary = poll(&options, &stop, || {
                check(&conn, &store, window.as_ref(), &policy)
            });
            println!(
                "{} checks, {} failed, {} hard failures",
                summary.checks, summary.failures, summary.hard_failures
            );
        }
        Commands::Pipeline {
            path,
            force,
            limit,
            window,
        } => {
            if limit.is_some() {
                config.sync_limit = limit;
            }
            config.validate()?;
            let mongo = config.mongo_config()?;
            let path = path.unwrap_or_else(|| config.extract_path.clone());
            let explicit = window.resolve()?;

            let steps = IndicatifProgress::steps_bar(&multi, "Pipeline", 3);
            let conn = primary::open(&config.primary_db_path)?;
            let store = connect_secondary(&mongo)?;

            steps.note("Ingest");
            let bar = IndicatifProgress::load_spinner(&multi, "Loading extract");
            let options = IngestOptions {
                chunk_size: config.chunk_size,
                force,
                window: explicit,
            };
            let window = match ingest_file(&conn, &path, &options, &bar)? {
                IngestOutcome::Loaded(summary) => summary.window,
                IngestOutcome::Skipped { filename } => {
                    log::info!("{filename} already loaded; syncing its window anyway");
                    window::resolve_or_fallback(&filename, explicit, window::current_year_window())
                }
            };
            steps.advance(1);

            steps.note(&format!("Sync {window}"));
            let bar = IndicatifProgress::sync_bar(&multi, "Syncing");
            let report = SyncEngine::new(&conn, &store, config.sync_options())
                .sync_window(&window, &bar)?;
            print_sync_report(&report);
            steps.advance(1);

            steps.note("Validate");
            let consistency = check_strict(&conn, &store, Some(&window), &config.policy())?;
            print_consistency(&consistency);
            steps.advance(1);
            steps.end(Some("Pipeline complete"));
        }
        Commands::Ledger { sync, window } => {
            let mongo = if sync {
                Some(config.mongo_config()?)
            } else {
                None
            };
            let window = window.resolve()?;

            let conn = primary::open(&config.primary_db_path)?;
            let entries = primary::ledger_entries(&conn)?;
            println!(
                "{:<40} {:>10} {:>10} {:>12}  LOADED AT",
                "FILE", "ROWS", "SECS", "ROWS/S"
            );
            println!("{}", "-".repeat(96));
            for entry in &entries {
                println!(
                    "{:<40} {:>10} {:>10.1} {:>12.0}  {}",
                    entry.filename,
                    entry.rows_loaded,
                    entry.duration_secs,
                    entry.rows_per_sec,
                    entry.loaded_at
                );
            }

            if let Some(mongo) = mongo {
                let store = connect_secondary(&mongo)?;
                println!();
                println!(
                    "{:<26} {:<8} {:>10} {:>8}  STARTED AT",
                    "WINDOW", "STATUS", "DOCS", "SECS"
                );
                println!("{}", "-".repeat(96));
                for entry in store.sync_history(window.as_ref())? {
                    println!(
                        "{:<26} {:<8} {:>10} {:>8.1}  {}{}",
                        entry.window.to_string(),
                        entry.status.to_string(),
                        entry.documents,
                        entry.duration_secs.unwrap_or_default(),
                        entry.started_at.format("%Y-%m-%d %H:%M:%S"),
                        entry.error.map(|e| format!("  ({e})")).unwrap_or_default(),
                    );
                }
            }
        }
        Commands::Workload { workers, rounds } => {
            let mongo = config.mongo_config()?;
            let conn = primary::open(&config.primary_db_path)?;
            let stores = || -> Result<Box<dyn DocumentStore>, StoreError> {
                Ok(Box::new(connect_secondary(&mongo)?))
            };
            let report = workload::run(
                &conn,
                &stores,
                workload::WorkloadOptions { workers, rounds },
            )?;
            println!(
                "{} primary updates, {} primary reads, {} secondary reads in {:.2}s",
                report.primary_updates,
                report.primary_reads,
                report.secondary_reads,
                report.elapsed.as_secs_f64()
            );
        }
    }

    // Let the last progress redraw land before exit.
    std::thread::sleep(Duration::from_millis(50));
    Ok(())
}
