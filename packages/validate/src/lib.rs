#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Count-based consistency checks between the primary and secondary stores.
//!
//! A check compares row/document counts for a window (or everything) and
//! classifies the difference. One-shot callers use [`check_strict`], which
//! turns hard failures into errors; [`poll::poll`] keeps checking on an
//! interval and reports through [`gauges`].

pub mod gauges;
pub mod poll;

use chrono::{DateTime, Utc};
use duckdb::Connection;
use nyc311_database::{DbError, primary};
use nyc311_document_store::{DocumentStore, StoreError};
use nyc311_request_models::SyncWindow;

/// Default mismatch tolerated before a check is a hard failure.
pub const DEFAULT_MISMATCH_THRESHOLD: u64 = 1_000;

/// Errors from a consistency check.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Primary store error: {0}")]
    Primary(#[from] DbError),

    #[error("Secondary store error: {0}")]
    Secondary(#[from] StoreError),

    /// Exactly one side is empty.
    #[error("One store is empty: primary={primary}, secondary={secondary}")]
    Empty { primary: u64, secondary: u64 },

    #[error(
        "Count mismatch {mismatch} exceeds threshold {threshold}: primary={primary}, secondary={secondary}"
    )]
    MismatchExceeded {
        primary: u64,
        secondary: u64,
        mismatch: u64,
        threshold: u64,
    },
}

/// How large a count difference is tolerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsistencyPolicy {
    pub mismatch_threshold: u64,
}

impl Default for ConsistencyPolicy {
    fn default() -> Self {
        Self {
            mismatch_threshold: DEFAULT_MISMATCH_THRESHOLD,
        }
    }
}

/// Classification of a pair of counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncHealth {
    /// Counts are equal (including both empty).
    InSync,
    /// Counts differ by at most the threshold.
    Drift,
    /// Counts differ by more than the threshold.
    MismatchExceeded,
    /// One side has rows and the other has none.
    Empty,
}

impl SyncHealth {
    #[must_use]
    pub const fn is_in_sync(self) -> bool {
        matches!(self, Self::InSync)
    }

    /// Whether a one-shot check must fail.
    #[must_use]
    pub const fn is_hard_failure(self) -> bool {
        matches!(self, Self::MismatchExceeded | Self::Empty)
    }
}

/// Result of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// `None` for a whole-store check.
    pub window: Option<SyncWindow>,
    pub primary: u64,
    pub secondary: u64,
    pub mismatch: u64,
    pub health: SyncHealth,
    pub checked_at: DateTime<Utc>,
}

impl ConsistencyReport {
    /// Converts a hard failure into the matching [`ValidationError`].
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Empty`] or
    /// [`ValidationError::MismatchExceeded`] for hard failures.
    pub fn into_result(self, policy: &ConsistencyPolicy) -> Result<Self, ValidationError> {
        match self.health {
            SyncHealth::Empty => Err(ValidationError::Empty {
                primary: self.primary,
                secondary: self.secondary,
            }),
            SyncHealth::MismatchExceeded => Err(ValidationError::MismatchExceeded {
                primary: self.primary,
                secondary: self.secondary,
                mismatch: self.mismatch,
                threshold: policy.mismatch_threshold,
            }),
            SyncHealth::InSync | SyncHealth::Drift => Ok(self),
        }
    }
}

/// Classifies a pair of counts under `policy`.
#[must_use]
pub const fn classify(primary: u64, secondary: u64, policy: &ConsistencyPolicy) -> SyncHealth {
    let mismatch = primary.abs_diff(secondary);
    if mismatch == 0 {
        SyncHealth::InSync
    } else if primary == 0 || secondary == 0 {
        SyncHealth::Empty
    } else if mismatch > policy.mismatch_threshold {
        SyncHealth::MismatchExceeded
    } else {
        SyncHealth::Drift
    }
}

/// Counts both stores for `window` (or everything) and classifies the result.
///
/// Hard failures are reported in the returned health, not as errors.
///
/// # Errors
///
/// Returns [`ValidationError`] if either count fails.
pub fn check(
    conn: &Connection,
    store: &dyn DocumentStore,
    window: Option<&SyncWindow>,
    policy: &ConsistencyPolicy,
) -> Result<ConsistencyReport, ValidationError> {
    let primary = primary::count_requests(conn, window)?;
    let secondary = store.count_documents(window)?;
    let mismatch = primary.abs_diff(secondary);
    let health = classify(primary, secondary, policy);

    let scope = window.map_or_else(|| "all rows".to_string(), ToString::to_string);
    log::info!(
        "Consistency ({scope}): primary={primary} secondary={secondary} mismatch={mismatch} {health:?}"
    );

    Ok(ConsistencyReport {
        window: window.copied(),
        primary,
        secondary,
        mismatch,
        health,
        checked_at: Utc::now(),
    })
}

/// [`check`], failing on [`SyncHealth::is_hard_failure`].
///
/// # Errors
///
/// Returns [`ValidationError`] if a count fails or the check is a hard
/// failure.
pub fn check_strict(
    conn: &Connection,
    store: &dyn DocumentStore,
    window: Option<&SyncWindow>,
    policy: &ConsistencyPolicy,
) -> Result<ConsistencyReport, ValidationError> {
    check(conn, store, window, policy)?.into_result(policy)
}
