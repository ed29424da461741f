//! In-process [`DocumentStore`] used by tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use nyc311_request_models::{SyncLedgerEntry, SyncStatus, SyncWindow};

use crate::{DocumentStore, ServiceDocument, StoreError, SyncClose, window_bounds};

#[derive(Default)]
struct Inner {
    documents: BTreeMap<i64, ServiceDocument>,
    ledger: Vec<SyncLedgerEntry>,
    failing_keys: BTreeSet<i64>,
}

/// A [`DocumentStore`] kept entirely in memory.
///
/// Writes for keys registered with [`Self::fail_writes_for`] are rejected
/// the way a server-side write error would be, so batch-failure paths can be
/// exercised without a server.
#[derive(Default)]
pub struct MemoryDocumentStore {
    inner: Mutex<Inner>,
}

impl MemoryDocumentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every later upsert of these keys fail.
    pub fn fail_writes_for(&self, keys: impl IntoIterator<Item = i64>) {
        self.lock().failing_keys.extend(keys);
    }

    /// Inserts documents directly, bypassing failure injection.
    pub fn seed(&self, documents: impl IntoIterator<Item = ServiceDocument>) {
        let mut inner = self.lock();
        for doc in documents {
            inner.documents.insert(doc.id, doc);
        }
    }

    /// A snapshot of every stored document, ordered by key.
    #[must_use]
    pub fn documents(&self) -> Vec<ServiceDocument> {
        self.lock().documents.values().cloned().collect()
    }
}

fn in_window(doc: &ServiceDocument, window: &SyncWindow) -> bool {
    let (start, end) = window_bounds(window);
    doc.created_date >= start && doc.created_date < end
}

impl DocumentStore for MemoryDocumentStore {
    fn delete_window(&self, window: &SyncWindow) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let before = inner.documents.len();
        inner.documents.retain(|_, doc| !in_window(doc, window));
        Ok((before - inner.documents.len()) as u64)
    }

    fn upsert_batch(&self, documents: &[ServiceDocument]) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let mut applied = 0u64;
        let mut failed = 0u64;
        let mut first_error = None;

        for doc in documents {
            if inner.failing_keys.contains(&doc.id) {
                failed += 1;
                first_error.get_or_insert_with(|| format!("write rejected for _id {}", doc.id));
                continue;
            }
            inner.documents.insert(doc.id, doc.clone());
            applied += 1;
        }

        match first_error {
            Some(first_error) => Err(StoreError::BatchWrite {
                applied,
                failed,
                first_error,
            }),
            None => Ok(applied),
        }
    }

    fn count_documents(&self, window: Option<&SyncWindow>) -> Result<u64, StoreError> {
        let inner = self.lock();
        let count = match window {
            Some(window) => inner
                .documents
                .values()
                .filter(|doc| in_window(doc, window))
                .count(),
            None => inner.documents.len(),
        };
        Ok(count as u64)
    }

    fn borough_counts(&self) -> Result<Vec<(Option<String>, u64)>, StoreError> {
        let mut counts: BTreeMap<Option<String>, u64> = BTreeMap::new();
        for doc in self.lock().documents.values() {
            *counts.entry(doc.borough.clone()).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }

    fn open_sync_entry(&self, window: &SyncWindow) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.lock().ledger.push(SyncLedgerEntry {
            id: id.clone(),
            window: *window,
            status: SyncStatus::Running,
            documents: 0,
            duration_secs: None,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        });
        Ok(id)
    }

    fn close_sync_entry(&self, id: &str, close: &SyncClose) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let entry = inner
            .ledger
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| StoreError::UnknownLedgerEntry { id: id.to_string() })?;

        entry.status = close.status;
        entry.documents = close.documents;
        entry.duration_secs = Some(close.duration.as_secs_f64());
        entry.finished_at = Some(Utc::now());
        entry.error.clone_from(&close.error);
        Ok(())
    }

    fn sync_history(&self, window: Option<&SyncWindow>) -> Result<Vec<SyncLedgerEntry>, StoreError> {
        Ok(self
            .lock()
            .ledger
            .iter()
            .filter(|e| window.is_none_or(|w| e.window == *w))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{NaiveDate, TimeZone as _};

    use super::*;

    fn doc(id: i64, year: i32) -> ServiceDocument {
        ServiceDocument {
            id,
            unique_key: id,
            created_date: Utc.with_ymd_and_hms(year, 6, 1, 12, 0, 0).unwrap(),
            closed_date: None,
            agency: None,
            complaint_type: None,
            descriptor: None,
            borough: Some("BRONX".to_string()),
            latitude: None,
            longitude: None,
        }
    }

    #[test]
    fn delete_window_only_touches_window() {
        let store = MemoryDocumentStore::new();
        store.seed([doc(1, 2022), doc(2, 2023), doc(3, 2024)]);

        let w = SyncWindow::calendar_year(2023).unwrap();
        assert_eq!(store.delete_window(&w).unwrap(), 1);
        let ids: Vec<i64> = store.documents().iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn upsert_replaces_by_key() {
        let store = MemoryDocumentStore::new();
        store.upsert_batch(&[doc(1, 2023)]).unwrap();

        let mut replacement = doc(1, 2023);
        replacement.borough = None;
        assert_eq!(store.upsert_batch(&[replacement.clone()]).unwrap(), 1);
        assert_eq!(store.documents(), vec![replacement]);
    }

    #[test]
    fn failing_document_does_not_drop_the_rest() {
        let store = MemoryDocumentStore::new();
        store.fail_writes_for([2]);

        let err = store
            .upsert_batch(&[doc(1, 2023), doc(2, 2023), doc(3, 2023)])
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::BatchWrite {
                applied: 2,
                failed: 1,
                ..
            }
        ));
        assert_eq!(store.count_documents(None).unwrap(), 2);
    }

    #[test]
    fn counts_by_window() {
        let store = MemoryDocumentStore::new();
        store.seed([doc(1, 2023), doc(2, 2023), doc(3, 2024)]);
        let w = SyncWindow::calendar_year(2023).unwrap();
        assert_eq!(store.count_documents(Some(&w)).unwrap(), 2);
        assert_eq!(store.count_documents(None).unwrap(), 3);
        assert_eq!(
            store.borough_counts().unwrap(),
            vec![(Some("BRONX".to_string()), 3)]
        );
    }

    #[test]
    fn ledger_entries_open_and_close() {
        let store = MemoryDocumentStore::new();
        let w2023 = SyncWindow::calendar_year(2023).unwrap();
        let w2024 = SyncWindow::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
        )
        .unwrap();

        let id = store.open_sync_entry(&w2023).unwrap();
        store.open_sync_entry(&w2024).unwrap();
        assert_eq!(
            store.latest_sync_entry(&w2023).unwrap().unwrap().status,
            SyncStatus::Running
        );

        store
            .close_sync_entry(
                &id,
                &SyncClose {
                    status: SyncStatus::Success,
                    documents: 42,
                    duration: Duration::from_millis(1500),
                    error: None,
                },
            )
            .unwrap();

        let entry = store.latest_sync_entry(&w2023).unwrap().unwrap();
        assert_eq!(entry.status, SyncStatus::Success);
        assert_eq!(entry.documents, 42);
        assert!(entry.finished_at.is_some());
        assert_eq!(store.sync_history(None).unwrap().len(), 2);
    }

    #[test]
    fn closing_unknown_entry_fails() {
        let store = MemoryDocumentStore::new();
        let close = SyncClose {
            status: SyncStatus::Failed,
            documents: 0,
            duration: Duration::ZERO,
            error: Some("boom".to_string()),
        };
        assert!(matches!(
            store.close_sync_entry("missing", &close),
            Err(StoreError::UnknownLedgerEntry { .. })
        ));
    }
}
