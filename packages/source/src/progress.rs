//! Progress reporting for chunked loads and batched syncs.
//!
//! A load or sync is one *stage*: it begins (with a unit total when known),
//! advances as rows or documents are applied, and ends. The CLI renders
//! stages as `indicatif` bars; library callers pass [`null_progress`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Receives stage events from the loader and the sync engine.
pub trait ProgressCallback: Send + Sync {
    /// A stage named `label` starts. `total` is the number of rows or
    /// documents when known up front (syncs), `None` for streamed loads.
    fn begin(&self, label: &str, total: Option<u64>);

    /// Replaces the stage label without touching the counts.
    fn note(&self, label: &str);

    /// `applied` more rows or documents were written.
    fn advance(&self, applied: u64);

    /// The stage is over. `summary` is kept on screen; `None` removes the
    /// indicator (aborted or empty stages).
    fn end(&self, summary: Option<&str>);
}

struct NullProgress;

impl ProgressCallback for NullProgress {
    fn begin(&self, _label: &str, _total: Option<u64>) {}
    fn note(&self, _label: &str) {}
    fn advance(&self, _applied: u64) {}
    fn end(&self, _summary: Option<&str>) {}
}

/// A reporter that ignores every event.
#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}

/// Keeps running totals of the events it sees, for callers that want the
/// numbers without a display.
#[derive(Debug, Default)]
pub struct ProgressTally {
    total: AtomicU64,
    applied: AtomicU64,
    stages: AtomicU64,
    ended: AtomicU64,
}

impl ProgressTally {
    /// Total announced by the latest stage (0 when unknown).
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Units applied across all stages.
    #[must_use]
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Stages begun and stages ended.
    #[must_use]
    pub fn stages(&self) -> (u64, u64) {
        (
            self.stages.load(Ordering::Relaxed),
            self.ended.load(Ordering::Relaxed),
        )
    }
}

impl ProgressCallback for ProgressTally {
    fn begin(&self, _label: &str, total: Option<u64>) {
        self.stages.fetch_add(1, Ordering::Relaxed);
        self.total.store(total.unwrap_or(0), Ordering::Relaxed);
    }

    fn note(&self, _label: &str) {}

    fn advance(&self, applied: u64) {
        self.applied.fetch_add(applied, Ordering::Relaxed);
    }

    fn end(&self, _summary: Option<&str>) {
        self.ended.fetch_add(1, Ordering::Relaxed);
    }
}
