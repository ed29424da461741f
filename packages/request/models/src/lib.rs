#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Canonical types shared by every stage of the NYC 311 pipeline.
//!
//! The primary store holds [`ServiceRequest`] rows keyed by `unique_key`.
//! Loads and syncs are scoped by a half-open [`SyncWindow`], and both stores
//! keep an audit ledger ([`IngestionLedgerEntry`], [`SyncLedgerEntry`]).

use chrono::{DateTime, Datelike as _, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// One of the five NYC boroughs.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum Borough {
    Manhattan,
    Brooklyn,
    Queens,
    Bronx,
    #[serde(rename = "STATEN ISLAND")]
    #[strum(to_string = "STATEN ISLAND", serialize = "STATEN_ISLAND")]
    StatenIsland,
}

/// A civic service request normalized to the canonical schema.
///
/// `created_date` is mandatory: rows without one never make it past the
/// normalizer. Timestamps are naive wall-clock values as published in the
/// extract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    /// Stable external identifier. Never reused across extracts.
    pub unique_key: i64,
    pub created_date: NaiveDateTime,
    /// `None` while the request is still open.
    pub closed_date: Option<NaiveDateTime>,
    pub agency: Option<String>,
    pub complaint_type: Option<String>,
    /// Free-text detail for the complaint type.
    pub descriptor: Option<String>,
    pub borough: Option<Borough>,
    /// Latitude in decimal degrees (WGS84).
    pub latitude: Option<f64>,
    /// Longitude in decimal degrees (WGS84).
    pub longitude: Option<f64>,
}

/// Error returned when a window's start is not strictly before its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidWindowError {
    /// Requested inclusive start.
    pub start: NaiveDate,
    /// Requested exclusive end.
    pub end: NaiveDate,
}

impl std::fmt::Display for InvalidWindowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid window [{}, {}): start must be before end",
            self.start, self.end
        )
    }
}

impl std::error::Error for InvalidWindowError {}

/// A half-open date interval `[start, end)` scoping a load or sync.
///
/// `start` is inclusive and `end` is exclusive, so consecutive windows never
/// double-count a boundary instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SyncWindow {
    start: NaiveDate,
    end: NaiveDate,
}

impl SyncWindow {
    /// Creates a window from explicit bounds.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidWindowError`] unless `start < end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, InvalidWindowError> {
        if start < end {
            Ok(Self { start, end })
        } else {
            Err(InvalidWindowError { start, end })
        }
    }

    /// The calendar-year window `[year-01-01, (year+1)-01-01)`.
    ///
    /// Returns `None` for years chrono cannot represent.
    #[must_use]
    pub fn calendar_year(year: i32) -> Option<Self> {
        let start = NaiveDate::from_ymd_opt(year, 1, 1)?;
        let end = NaiveDate::from_ymd_opt(year.checked_add(1)?, 1, 1)?;
        Some(Self { start, end })
    }

    /// The calendar-year window containing `date`.
    #[must_use]
    pub fn containing_year(date: NaiveDate) -> Option<Self> {
        Self::calendar_year(date.year())
    }

    #[must_use]
    pub const fn start(&self) -> NaiveDate {
        self.start
    }

    #[must_use]
    pub const fn end(&self) -> NaiveDate {
        self.end
    }

    /// Midnight at the start date (inclusive bound).
    #[must_use]
    pub fn start_bound(&self) -> NaiveDateTime {
        self.start.and_time(NaiveTime::MIN)
    }

    /// Midnight at the end date (exclusive bound).
    #[must_use]
    pub fn end_bound(&self) -> NaiveDateTime {
        self.end.and_time(NaiveTime::MIN)
    }

    /// Whether `ts` falls inside `[start, end)`.
    #[must_use]
    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        ts >= self.start_bound() && ts < self.end_bound()
    }
}

impl std::fmt::Display for SyncWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Per-batch cleaning statistics.
///
/// Purely observational: nothing in the pipeline branches on these values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanStats {
    /// Rows in the raw batch.
    pub original: u64,
    /// Rows that survived every rule.
    pub cleaned: u64,
    /// Rows dropped for a missing `unique_key` or `created_date`.
    pub missing_required: u64,
    /// Earlier occurrences of a `unique_key` superseded by a later one.
    pub duplicates: u64,
    /// Rows whose coordinates fell outside the city bounding box.
    pub out_of_bounds: u64,
}

impl CleanStats {
    /// Total rows dropped by any rule.
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.missing_required + self.duplicates + self.out_of_bounds
    }

    /// Accumulates another batch's statistics into this one.
    pub const fn merge(&mut self, other: &Self) {
        self.original += other.original;
        self.cleaned += other.cleaned;
        self.missing_required += other.missing_required;
        self.duplicates += other.duplicates;
        self.out_of_bounds += other.out_of_bounds;
    }
}

/// A row in the primary store's ingestion ledger.
///
/// Presence of an entry for a filename means that file was fully applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionLedgerEntry {
    /// Source file name (not the full path).
    pub filename: String,
    pub rows_loaded: u64,
    pub duration_secs: f64,
    pub rows_per_sec: f64,
    pub loaded_at: NaiveDateTime,
}

/// Lifecycle state of a secondary-store sync run.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SyncStatus {
    /// The run has started and not yet closed its entry.
    Running,
    /// Every document in the window was upserted.
    Success,
    /// The primary store had no rows in the window.
    NoData,
    /// The run aborted; the entry carries the error message.
    Failed,
}

/// One entry of the append-only sync ledger.
///
/// Several entries may exist for the same window; the one with the latest
/// `started_at` is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLedgerEntry {
    /// Store-assigned identifier.
    pub id: String,
    pub window: SyncWindow,
    pub status: SyncStatus,
    /// Documents upserted by the run.
    pub documents: u64,
    pub duration_secs: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Picks the authoritative entry (latest `started_at`) from a ledger slice.
#[must_use]
pub fn latest_entry(entries: &[SyncLedgerEntry]) -> Option<&SyncLedgerEntry> {
    entries.iter().max_by_key(|e| e.started_at)
}
