#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Secondary document store for NYC 311 service requests.
//!
//! The secondary store is derived from the primary: it holds one document per
//! service request (keyed by `unique_key`) and an append-only sync ledger.
//! [`DocumentStore`] is the seam the sync engine and validator work against;
//! [`mongo::MongoDocumentStore`] is the production backend and
//! [`memory::MemoryDocumentStore`] backs tests.

pub mod memory;
pub mod mongo;

use std::time::Duration;

use chrono::{DateTime, Utc};
use nyc311_request_models::{ServiceRequest, SyncLedgerEntry, SyncStatus, SyncWindow, latest_entry};
use serde::{Deserialize, Serialize};

/// Errors that can occur during secondary-store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// `MongoDB` driver error.
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// A stored document could not be converted.
    #[error("Document conversion error: {message}")]
    Conversion {
        /// Description of what went wrong.
        message: String,
    },

    /// Some documents of a batch failed after every document was attempted.
    #[error("Batch write applied {applied} document(s), {failed} failed: {first_error}")]
    BatchWrite {
        /// Documents written successfully.
        applied: u64,
        /// Documents that failed.
        failed: u64,
        /// Message of the first failure.
        first_error: String,
    },

    /// A sync ledger id that the store does not know.
    #[error("Unknown sync ledger entry: {id}")]
    UnknownLedgerEntry {
        /// The id that was looked up.
        id: String,
    },
}

/// A service request as stored in the secondary store.
///
/// `id` doubles as the document key and always equals `unique_key`.
/// Timestamps are the primary's wall-clock values interpreted as UTC and
/// coordinates are plain `f64`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDocument {
    #[serde(rename = "_id")]
    pub id: i64,
    pub unique_key: i64,
    pub created_date: DateTime<Utc>,
    pub closed_date: Option<DateTime<Utc>>,
    pub agency: Option<String>,
    pub complaint_type: Option<String>,
    pub descriptor: Option<String>,
    pub borough: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl From<&ServiceRequest> for ServiceDocument {
    fn from(request: &ServiceRequest) -> Self {
        Self {
            id: request.unique_key,
            unique_key: request.unique_key,
            created_date: request.created_date.and_utc(),
            closed_date: request.closed_date.map(|d| d.and_utc()),
            agency: request.agency.clone(),
            complaint_type: request.complaint_type.clone(),
            descriptor: request.descriptor.clone(),
            borough: request.borough.map(|b| b.to_string()),
            latitude: request.latitude,
            longitude: request.longitude,
        }
    }
}

/// Window bounds as UTC instants, matching how documents store timestamps.
#[must_use]
pub fn window_bounds(window: &SyncWindow) -> (DateTime<Utc>, DateTime<Utc>) {
    (window.start_bound().and_utc(), window.end_bound().and_utc())
}

/// Final state written when a sync ledger entry is closed.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncClose {
    pub status: SyncStatus,
    pub documents: u64,
    pub duration: Duration,
    pub error: Option<String>,
}

/// Operations the sync engine and validator need from a secondary store.
///
/// Every destructive operation is scoped to a window or to document keys.
pub trait DocumentStore: Send + Sync {
    /// Deletes every document whose `created_date` falls in `window`.
    ///
    /// Returns the number of documents deleted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the delete fails.
    fn delete_window(&self, window: &SyncWindow) -> Result<u64, StoreError>;

    /// Replaces each document by key, inserting it when absent.
    ///
    /// Every document is attempted even if earlier ones fail. Returns the
    /// number applied.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BatchWrite`] if any document failed.
    fn upsert_batch(&self, documents: &[ServiceDocument]) -> Result<u64, StoreError>;

    /// Counts documents in `window`, or all documents when `None`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the count fails.
    fn count_documents(&self, window: Option<&SyncWindow>) -> Result<u64, StoreError>;

    /// Returns `(borough, count)` pairs over the whole collection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the aggregation fails.
    fn borough_counts(&self) -> Result<Vec<(Option<String>, u64)>, StoreError>;

    /// Appends a `running` ledger entry for `window` and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the insert fails.
    fn open_sync_entry(&self, window: &SyncWindow) -> Result<String, StoreError>;

    /// Moves the entry `id` to its final state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownLedgerEntry`] if no entry has that id.
    fn close_sync_entry(&self, id: &str, close: &SyncClose) -> Result<(), StoreError>;

    /// Ledger entries for `window` (or all windows), oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query or a conversion fails.
    fn sync_history(&self, window: Option<&SyncWindow>) -> Result<Vec<SyncLedgerEntry>, StoreError>;

    /// The authoritative (most recently started) entry for `window`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the history cannot be read.
    fn latest_sync_entry(&self, window: &SyncWindow) -> Result<Option<SyncLedgerEntry>, StoreError> {
        let history = self.sync_history(Some(window))?;
        Ok(latest_entry(&history).cloned())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use nyc311_request_models::Borough;

    use super::*;

    #[test]
    fn document_mirrors_request() {
        let created = NaiveDate::from_ymd_opt(2023, 5, 1)
            .unwrap()
            .and_hms_opt(8, 15, 0)
            .unwrap();
        let request = ServiceRequest {
            unique_key: 1,
            created_date: created,
            closed_date: None,
            agency: Some("DSNY".to_string()),
            complaint_type: None,
            descriptor: None,
            borough: Some(Borough::StatenIsland),
            latitude: Some(40.58),
            longitude: None,
        };

        let doc = ServiceDocument::from(&request);
        assert_eq!(doc.id, 1);
        assert_eq!(doc.unique_key, 1);
        assert_eq!(doc.created_date.naive_utc(), created);
        assert_eq!(doc.borough.as_deref(), Some("STATEN ISLAND"));
        assert!((doc.latitude.unwrap() - 40.58).abs() < f64::EPSILON);
    }

    #[test]
    fn window_bounds_are_midnight_utc() {
        let (start, end) = window_bounds(&SyncWindow::calendar_year(2023).unwrap());
        assert_eq!(start.to_rfc3339(), "2023-01-01T00:00:00+00:00");
        assert_eq!(end.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }
}
