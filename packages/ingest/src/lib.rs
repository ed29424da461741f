#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Loading NYC 311 extracts into the primary store and syncing them to the
//! secondary store.
//!
//! [`ingest_file`] streams one extract through the normalizer into `DuckDB`,
//! guarded by the ingestion ledger. [`window`] derives the window a file
//! covers and [`sync::SyncEngine`] pushes a window to the document store.

pub mod sync;
pub mod window;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use duckdb::Connection;
use nyc311_database::{DbError, primary};
use nyc311_request_models::{CleanStats, IngestionLedgerEntry, SyncWindow};
use nyc311_source::SourceError;
use nyc311_source::extract::ExtractReader;
use nyc311_source::normalize::clean_batch;
use nyc311_source::progress::ProgressCallback;

/// Default rows per extract chunk (and per primary transaction).
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

/// Errors that abort an ingest run.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The path has no usable file name to key the ledger by.
    #[error("Extract path {path:?} has no file name")]
    InvalidPath { path: PathBuf },

    /// The extract could not be opened.
    #[error("Failed to open extract {path:?}: {source}")]
    Open { path: PathBuf, source: SourceError },

    /// A chunk could not be read; earlier chunks stay loaded but unledgered.
    #[error("Failed to read chunk {chunk_index}: {source}")]
    Read {
        chunk_index: usize,
        source: SourceError,
    },

    /// A chunk's transaction was rolled back; the run stopped there.
    #[error("Failed to load chunk {chunk_index}: {source}")]
    Load { chunk_index: usize, source: DbError },

    /// Ledger or window-clear failure.
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Options for [`ingest_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOptions {
    /// Rows per chunk. Zero is treated as one.
    pub chunk_size: usize,
    /// Reload even if the ledger says the file was already loaded.
    pub force: bool,
    /// Explicit window; otherwise derived from the file name.
    pub window: Option<SyncWindow>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            force: false,
            window: None,
        }
    }
}

/// Totals for a completed load.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestSummary {
    pub filename: String,
    /// The window cleared before loading.
    pub window: SyncWindow,
    /// Rows deleted by the window clear.
    pub cleared: u64,
    pub stats: CleanStats,
    pub rows_loaded: u64,
    pub chunks: usize,
    pub elapsed: Duration,
    pub ledger: IngestionLedgerEntry,
}

/// What [`ingest_file`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// The ledger already had the file; nothing was read or written.
    Skipped { filename: String },
    Loaded(Box<IngestSummary>),
}

/// Loads one extract into the primary store.
///
/// The ledger is keyed by the file name (not the full path). Unless
/// `options.force` is set, a file already in the ledger is skipped
/// outright. Otherwise the file's window is cleared, every chunk is cleaned
/// and upserted in its own transaction, and the ledger entry is written
/// last. A failure stops the run before the ledger write, so a rerun
/// reloads the file from scratch.
///
/// # Errors
///
/// Returns [`IngestError`] if the extract cannot be read or any chunk fails
/// to load.
pub fn ingest_file(
    conn: &Connection,
    path: &Path,
    options: &IngestOptions,
    progress: &Arc<dyn ProgressCallback>,
) -> Result<IngestOutcome, IngestError> {
    let start = Instant::now();
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| IngestError::InvalidPath {
            path: path.to_path_buf(),
        })?;

    if options.force {
        log::info!("{filename}: reloading (--force)");
    } else if primary::already_loaded(conn, &filename)? {
        log::info!("{filename}: already loaded, skipping");
        return Ok(IngestOutcome::Skipped { filename });
    }

    let window =
        window::resolve_or_fallback(&filename, options.window, window::current_year_window());
    let cleared = primary::clear_window(conn, &window)?;
    log::info!("{filename}: cleared {cleared} existing rows in {window}");

    let reader = ExtractReader::open(path, options.chunk_size).map_err(|source| {
        IngestError::Open {
            path: path.to_path_buf(),
            source,
        }
    })?;

    progress.begin(&format!("Loading {filename}"), None);

    let mut stats = CleanStats::default();
    let mut rows_loaded = 0u64;
    let mut chunks = 0usize;

    for (chunk_index, chunk) in reader.enumerate() {
        let chunk = chunk.map_err(|source| IngestError::Read {
            chunk_index,
            source,
        })?;

        let (cleaned, chunk_stats) = clean_batch(&chunk);
        let written = primary::load_batch(conn, &cleaned, chunk_index).map_err(|source| {
            IngestError::Load {
                chunk_index,
                source,
            }
        })?;

        stats.merge(&chunk_stats);
        rows_loaded += written;
        chunks += 1;

        log::info!(
            "{filename}: chunk {chunk_index} cleaned {}/{} rows, upserted {written} (dropped {} missing, {} duplicate, {} out of bounds)",
            chunk_stats.cleaned,
            chunk_stats.original,
            chunk_stats.missing_required,
            chunk_stats.duplicates,
            chunk_stats.out_of_bounds,
        );
        progress.advance(written);
    }

    let elapsed = start.elapsed();
    let ledger = primary::record_ledger(conn, &filename, rows_loaded, elapsed)?;

    log::info!(
        "{filename}: loaded {rows_loaded} rows from {} raw in {chunks} chunks, {:.1}s ({:.0} rows/s)",
        stats.original,
        elapsed.as_secs_f64(),
        ledger.rows_per_sec,
    );
    progress.end(Some(&format!("Loaded {rows_loaded} rows from {filename}")));

    Ok(IngestOutcome::Loaded(Box::new(IngestSummary {
        filename,
        window,
        cleared,
        stats,
        rows_loaded,
        chunks,
        elapsed,
        ledger,
    })))
}
