//! Reconciles the secondary store with the primary for one window.
//!
//! A run opens a `running` ledger entry, deletes the window's documents,
//! reads the window from the primary and upserts it in fixed-size batches.
//! Every run closes its entry: `success`, `no_data`, or `failed` with the
//! error, so an aborted run is visible in the ledger.

use std::sync::Arc;
use std::time::{Duration, Instant};

use duckdb::Connection;
use nyc311_database::{DbError, primary};
use nyc311_document_store::{DocumentStore, ServiceDocument, StoreError, SyncClose};
use nyc311_request_models::{SyncStatus, SyncWindow};
use nyc311_source::progress::ProgressCallback;

/// Default documents per secondary write batch.
pub const DEFAULT_SYNC_BATCH_SIZE: usize = 5_000;

/// Errors that abort a sync run.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The ledger entry could not be opened; nothing was touched.
    #[error("Could not open sync ledger entry for {window}: {source}")]
    Open {
        window: SyncWindow,
        source: StoreError,
    },

    /// Deleting the window's documents failed.
    #[error("Clearing {window} in the secondary store failed: {source}")]
    Clear {
        window: SyncWindow,
        source: StoreError,
    },

    /// Reading the window from the primary store failed.
    #[error("Reading {window} from the primary store failed: {source}")]
    Read { window: SyncWindow, source: DbError },

    /// A batch had failed document writes; later batches were not attempted.
    #[error("Batch {batch_index} of {window} failed: {source}")]
    BatchWrite {
        window: SyncWindow,
        /// Zero-based batch index within the run.
        batch_index: usize,
        source: StoreError,
    },

    /// The run finished but its ledger entry could not be closed.
    #[error("Could not close sync ledger entry {id} for {window}: {source}")]
    Close {
        window: SyncWindow,
        id: String,
        source: StoreError,
    },
}

/// Tunables for a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Documents per secondary write batch. Zero is treated as one.
    pub batch_size: usize,
    /// Maximum primary rows to read for the window.
    pub limit: Option<u64>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_SYNC_BATCH_SIZE,
            limit: None,
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub window: SyncWindow,
    /// Id of the run's sync ledger entry.
    pub ledger_id: String,
    /// Either `Success` or `NoData`.
    pub status: SyncStatus,
    /// Documents removed from the window before reloading.
    pub deleted: u64,
    /// Documents upserted.
    pub documents: u64,
    pub batches: usize,
    pub elapsed: Duration,
}

/// Syncs windows from a primary connection into a secondary store.
///
/// Borrows both stores; the caller owns and closes them.
pub struct SyncEngine<'a> {
    conn: &'a Connection,
    store: &'a dyn DocumentStore,
    options: SyncOptions,
}

struct Applied {
    deleted: u64,
    documents: u64,
    batches: usize,
}

impl<'a> SyncEngine<'a> {
    #[must_use]
    pub const fn new(conn: &'a Connection, store: &'a dyn DocumentStore, options: SyncOptions) -> Self {
        Self {
            conn,
            store,
            options,
        }
    }

    /// Runs the full sync protocol for `window`.
    ///
    /// Safe to repeat: a rerun deletes and reloads the same window.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] if any step fails. When the ledger entry was
    /// opened it is closed as `failed` before returning.
    pub fn sync_window(
        &self,
        window: &SyncWindow,
        progress: &Arc<dyn ProgressCallback>,
    ) -> Result<SyncReport, SyncError> {
        let start = Instant::now();
        log::info!("Syncing window {window} to the secondary store");

        let ledger_id = self
            .store
            .open_sync_entry(window)
            .map_err(|source| SyncError::Open {
                window: *window,
                source,
            })?;

        let applied = match self.apply(window, progress) {
            Ok(applied) => applied,
            Err(e) => {
                let close = SyncClose {
                    status: SyncStatus::Failed,
                    documents: 0,
                    duration: start.elapsed(),
                    error: Some(e.to_string()),
                };
                if let Err(close_err) = self.store.close_sync_entry(&ledger_id, &close) {
                    log::error!("Failed to mark sync entry {ledger_id} as failed: {close_err}");
                }
                progress.end(None);
                return Err(e);
            }
        };

        let status = if applied.documents == 0 {
            SyncStatus::NoData
        } else {
            SyncStatus::Success
        };
        let elapsed = start.elapsed();

        self.store
            .close_sync_entry(
                &ledger_id,
                &SyncClose {
                    status,
                    documents: applied.documents,
                    duration: elapsed,
                    error: None,
                },
            )
            .map_err(|source| SyncError::Close {
                window: *window,
                id: ledger_id.clone(),
                source,
            })?;

        if status == SyncStatus::NoData {
            log::info!("No primary rows in {window}; recorded no_data");
            progress.end(None);
        } else {
            #[allow(clippy::cast_precision_loss)]
            let rate = applied.documents as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
            log::info!(
                "Sync of {window} complete: {} documents in {} batches, {:.1}s ({rate:.0} docs/s)",
                applied.documents,
                applied.batches,
                elapsed.as_secs_f64(),
            );
            progress.end(Some(&format!("Synced {} documents", applied.documents)));
        }

        Ok(SyncReport {
            window: *window,
            ledger_id,
            status,
            deleted: applied.deleted,
            documents: applied.documents,
            batches: applied.batches,
            elapsed,
        })
    }

    fn apply(
        &self,
        window: &SyncWindow,
        progress: &Arc<dyn ProgressCallback>,
    ) -> Result<Applied, SyncError> {
        let deleted = self
            .store
            .delete_window(window)
            .map_err(|source| SyncError::Clear {
                window: *window,
                source,
            })?;
        log::info!("Deleted {deleted} secondary documents in {window}");

        let rows = primary::read_window(self.conn, window, self.options.limit).map_err(|source| {
            SyncError::Read {
                window: *window,
                source,
            }
        })?;

        if rows.is_empty() {
            return Ok(Applied {
                deleted,
                documents: 0,
                batches: 0,
            });
        }

        progress.begin(&format!("Syncing {window}"), Some(rows.len() as u64));

        let mut documents = 0u64;
        let mut batches = 0usize;

        for (batch_index, chunk) in rows.chunks(self.options.batch_size.max(1)).enumerate() {
            let batch: Vec<ServiceDocument> = chunk.iter().map(ServiceDocument::from).collect();
            let applied = self
                .store
                .upsert_batch(&batch)
                .map_err(|source| SyncError::BatchWrite {
                    window: *window,
                    batch_index,
                    source,
                })?;

            documents += applied;
            batches += 1;
            progress.advance(applied);
            log::debug!("{window}: batch {batch_index} upserted {applied}");
        }

        Ok(Applied {
            deleted,
            documents,
            batches,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveDateTime, TimeZone as _, Utc};
    use nyc311_document_store::memory::MemoryDocumentStore;
    use nyc311_request_models::{Borough, ServiceRequest};
    use nyc311_source::progress::{ProgressTally, null_progress};

    use super::*;

    fn ts(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn request(key: i64, created: NaiveDateTime) -> ServiceRequest {
        ServiceRequest {
            unique_key: key,
            created_date: created,
            closed_date: None,
            agency: Some("DOT".to_string()),
            complaint_type: Some("Street Condition".to_string()),
            descriptor: Some("Pothole".to_string()),
            borough: Some(Borough::Queens),
            latitude: Some(40.7128),
            longitude: Some(-74.006),
        }
    }

    fn document(key: i64, year: i32) -> ServiceDocument {
        ServiceDocument {
            id: key,
            unique_key: key,
            created_date: Utc.with_ymd_and_hms(year, 8, 1, 0, 0, 0).unwrap(),
            closed_date: None,
            agency: None,
            complaint_type: None,
            descriptor: None,
            borough: None,
            latitude: None,
            longitude: None,
        }
    }

    fn y2023() -> SyncWindow {
        SyncWindow::calendar_year(2023).unwrap()
    }

    fn primary_with(rows: &[ServiceRequest]) -> Connection {
        let conn = primary::open_in_memory().unwrap();
        primary::load_batch(&conn, rows, 0).unwrap();
        conn
    }

    #[test]
    fn round_trip_and_rerun() {
        let conn = primary_with(&[request(1, ts(2023, 5, 1))]);
        let store = MemoryDocumentStore::new();
        let engine = SyncEngine::new(&conn, &store, SyncOptions::default());

        let report = engine.sync_window(&y2023(), &null_progress()).unwrap();
        assert_eq!(report.status, SyncStatus::Success);
        assert_eq!(report.documents, 1);

        let docs = store.documents();
        assert_eq!(docs.len(), 1);
        let doc = &docs[0];
        assert_eq!(doc.id, 1);
        assert_eq!(doc.created_date.naive_utc(), ts(2023, 5, 1));
        assert_eq!(doc.borough.as_deref(), Some("QUEENS"));
        assert!((doc.latitude.unwrap() - 40.7128).abs() < 1e-9);

        let rerun = engine.sync_window(&y2023(), &null_progress()).unwrap();
        assert_eq!(rerun.deleted, 1);
        assert_eq!(store.count_documents(Some(&y2023())).unwrap(), 1);

        let history = store.sync_history(Some(&y2023())).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|e| e.status == SyncStatus::Success));
    }

    #[test]
    fn other_windows_are_untouched() {
        let conn = primary_with(&[request(10, ts(2023, 2, 1)), request(11, ts(2024, 2, 1))]);
        let store = MemoryDocumentStore::new();
        let mut outside_before = document(1, 2022);
        outside_before.agency = Some("HPD".to_string());
        let outside_after = document(2, 2024);
        store.seed([outside_before.clone(), outside_after.clone(), document(3, 2023)]);

        SyncEngine::new(&conn, &store, SyncOptions::default())
            .sync_window(&y2023(), &null_progress())
            .unwrap();

        let docs = store.documents();
        let ids: Vec<i64> = docs.iter().map(|d| d.id).collect();
        // Stale in-window document 3 is gone; primary row 11 is outside the window.
        assert_eq!(ids, vec![1, 2, 10]);
        assert_eq!(docs[0], outside_before);
        assert_eq!(docs[1], outside_after);
    }

    #[test]
    fn empty_window_records_no_data() {
        let conn = primary_with(&[request(1, ts(2022, 5, 1))]);
        let store = MemoryDocumentStore::new();

        let report = SyncEngine::new(&conn, &store, SyncOptions::default())
            .sync_window(&y2023(), &null_progress())
            .unwrap();
        assert_eq!(report.status, SyncStatus::NoData);
        assert_eq!(report.documents, 0);

        let entry = store.latest_sync_entry(&y2023()).unwrap().unwrap();
        assert_eq!(entry.status, SyncStatus::NoData);
        assert!(entry.error.is_none());
    }

    #[test]
    fn failed_batch_aborts_and_is_recorded() {
        let rows: Vec<ServiceRequest> = (1..=5).map(|k| request(k, ts(2023, 3, 1))).collect();
        let conn = primary_with(&rows);
        let store = MemoryDocumentStore::new();
        store.fail_writes_for([3]);

        let options = SyncOptions {
            batch_size: 2,
            limit: None,
        };
        let err = SyncEngine::new(&conn, &store, options)
            .sync_window(&y2023(), &null_progress())
            .unwrap_err();

        assert!(matches!(
            err,
            SyncError::BatchWrite {
                batch_index: 1,
                source: StoreError::BatchWrite {
                    applied: 1,
                    failed: 1,
                    ..
                },
                ..
            }
        ));

        // Batch 1 was fully attempted; batch 2 never ran.
        let ids: Vec<i64> = store.documents().iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![1, 2, 4]);

        let entry = store.latest_sync_entry(&y2023()).unwrap().unwrap();
        assert_eq!(entry.status, SyncStatus::Failed);
        assert!(entry.error.unwrap().contains("Batch 1"));
    }

    #[test]
    fn limit_caps_rows_read() {
        let rows: Vec<ServiceRequest> = (1..=5).map(|k| request(k, ts(2023, 3, 1))).collect();
        let conn = primary_with(&rows);
        let store = MemoryDocumentStore::new();

        let options = SyncOptions {
            batch_size: 10,
            limit: Some(2),
        };
        let report = SyncEngine::new(&conn, &store, options)
            .sync_window(&y2023(), &null_progress())
            .unwrap();
        assert_eq!(report.documents, 2);
        assert_eq!(report.batches, 1);
        assert_eq!(store.count_documents(None).unwrap(), 2);
    }

    #[test]
    fn batches_are_fixed_size() {
        let rows: Vec<ServiceRequest> = (1..=5).map(|k| request(k, ts(2023, 3, 1))).collect();
        let conn = primary_with(&rows);
        let store = MemoryDocumentStore::new();

        let options = SyncOptions {
            batch_size: 2,
            limit: None,
        };
        let tally = Arc::new(ProgressTally::default());
        let progress: Arc<dyn ProgressCallback> = tally.clone();
        let report = SyncEngine::new(&conn, &store, options)
            .sync_window(&y2023(), &progress)
            .unwrap();
        assert_eq!(report.batches, 3);
        assert_eq!(report.documents, 5);
        assert_eq!((tally.total(), tally.applied()), (5, 5));
        assert_eq!(tally.stages(), (1, 1));
    }
}
