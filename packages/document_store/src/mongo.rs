//! `MongoDB` backend for the secondary store.
//!
//! Uses the driver's synchronous API, so callers must not hold it from
//! inside an async runtime.

use std::str::FromStr as _;

use chrono::{DateTime, NaiveDate, Utc};
use mongodb::bson::{self, Bson, Document, doc, oid::ObjectId};
use mongodb::options::FindOptions;
use mongodb::sync::{Client, Collection, Database};
use mongodb::IndexModel;
use nyc311_request_models::{SyncLedgerEntry, SyncStatus, SyncWindow};

use crate::{DocumentStore, ServiceDocument, StoreError, SyncClose, window_bounds};

/// Where the secondary store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
    pub collection: String,
    pub ledger_collection: String,
}

/// A [`DocumentStore`] backed by a `MongoDB` database.
pub struct MongoDocumentStore {
    db: Database,
    collection: String,
    documents: Collection<Document>,
    ledger: Collection<Document>,
}

impl MongoDocumentStore {
    /// Connects, pings the server and ensures the window indexes exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Mongo`] if the server is unreachable or index
    /// creation fails.
    pub fn connect(config: &MongoConfig) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(&config.uri)?;
        let db = client.database(&config.database);
        db.run_command(doc! { "ping": 1 }, None)?;

        let documents = db.collection::<Document>(&config.collection);
        let ledger = db.collection::<Document>(&config.ledger_collection);

        documents.create_index(
            IndexModel::builder()
                .keys(doc! { "created_date": 1 })
                .build(),
            None,
        )?;
        ledger.create_index(
            IndexModel::builder()
                .keys(doc! { "window_start": 1, "window_end": 1, "started_at": 1 })
                .build(),
            None,
        )?;

        log::info!(
            "Connected to secondary store {}.{}",
            config.database,
            config.collection
        );

        Ok(Self {
            db,
            collection: config.collection.clone(),
            documents,
            ledger,
        })
    }
}

fn bson_datetime(dt: DateTime<Utc>) -> bson::DateTime {
    bson::DateTime::from_millis(dt.timestamp_millis())
}

fn optional<T: Into<Bson>>(value: Option<T>) -> Bson {
    value.map_or(Bson::Null, Into::into)
}

fn window_filter(window: &SyncWindow) -> Document {
    let (start, end) = window_bounds(window);
    doc! {
        "created_date": {
            "$gte": bson_datetime(start),
            "$lt": bson_datetime(end),
        }
    }
}

fn ledger_window_fields(window: &SyncWindow) -> Document {
    let (start, end) = window_bounds(window);
    doc! {
        "window_start": bson_datetime(start),
        "window_end": bson_datetime(end),
    }
}

/// Converts a document to BSON with explicit datetimes and `f64` coordinates.
#[must_use]
pub fn to_bson(document: &ServiceDocument) -> Document {
    doc! {
        "_id": document.id,
        "unique_key": document.unique_key,
        "created_date": bson_datetime(document.created_date),
        "closed_date": optional(document.closed_date.map(bson_datetime)),
        "agency": optional(document.agency.clone()),
        "complaint_type": optional(document.complaint_type.clone()),
        "descriptor": optional(document.descriptor.clone()),
        "borough": optional(document.borough.clone()),
        "latitude": optional(document.latitude),
        "longitude": optional(document.longitude),
    }
}

/// Builds one unordered `update` command that upserts every document by
/// `_id`, so a failing document does not stop the rest of the batch.
#[must_use]
pub fn upsert_command(collection: &str, documents: &[ServiceDocument]) -> Document {
    let updates: Vec<Bson> = documents
        .iter()
        .map(|document| {
            Bson::Document(doc! {
                "q": { "_id": document.id },
                "u": to_bson(document),
                "upsert": true,
            })
        })
        .collect();

    doc! {
        "update": collection,
        "updates": updates,
        "ordered": false,
    }
}

/// Reads an `update` command reply for a batch of `submitted` documents.
///
/// `n` counts matched and upserted documents alike.
///
/// # Errors
///
/// Returns [`StoreError::BatchWrite`] when the reply carries write errors or
/// a write concern error.
pub fn upsert_outcome(reply: &Document, submitted: usize) -> Result<u64, StoreError> {
    let applied = read_count(reply, "n");
    let write_errors = reply.get_array("writeErrors").map_or(&[][..], Vec::as_slice);

    let first_error = write_errors
        .iter()
        .find_map(|e| e.as_document())
        .map(|e| {
            let index = e.get_i32("index").unwrap_or(-1);
            let message = e.get_str("errmsg").unwrap_or("unknown write error");
            format!("document {index}: {message}")
        })
        .or_else(|| {
            reply
                .get_document("writeConcernError")
                .ok()
                .map(|e| e.get_str("errmsg").unwrap_or("write concern error").to_string())
        });

    match first_error {
        Some(first_error) => {
            let failed = if write_errors.is_empty() {
                (submitted as u64).saturating_sub(applied)
            } else {
                write_errors.len() as u64
            };
            Err(StoreError::BatchWrite {
                applied,
                failed,
                first_error,
            })
        }
        None => Ok(applied),
    }
}

fn conversion(message: impl Into<String>) -> StoreError {
    StoreError::Conversion {
        message: message.into(),
    }
}

fn read_datetime(doc: &Document, key: &str) -> Result<DateTime<Utc>, StoreError> {
    let millis = doc
        .get_datetime(key)
        .map_err(|e| conversion(format!("{key}: {e}")))?
        .timestamp_millis();
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| conversion(format!("{key}: out-of-range datetime {millis}")))
}

fn read_optional_datetime(doc: &Document, key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
    match doc.get(key) {
        None | Some(Bson::Null) => Ok(None),
        Some(_) => read_datetime(doc, key).map(Some),
    }
}

fn read_date(doc: &Document, key: &str) -> Result<NaiveDate, StoreError> {
    read_datetime(doc, key).map(|dt| dt.date_naive())
}

fn read_count(doc: &Document, key: &str) -> u64 {
    match doc.get(key) {
        Some(Bson::Int64(n)) => u64::try_from(*n).unwrap_or(0),
        Some(Bson::Int32(n)) => u64::try_from(*n).unwrap_or(0),
        _ => 0,
    }
}

fn ledger_entry_from_bson(doc: &Document) -> Result<SyncLedgerEntry, StoreError> {
    let id = match doc.get("_id") {
        Some(Bson::ObjectId(oid)) => oid.to_hex(),
        Some(other) => other.to_string(),
        None => return Err(conversion("sync ledger entry without _id")),
    };

    let window = SyncWindow::new(
        read_date(doc, "window_start")?,
        read_date(doc, "window_end")?,
    )
    .map_err(|e| conversion(e.to_string()))?;

    let status_text = doc
        .get_str("status")
        .map_err(|e| conversion(format!("status: {e}")))?;
    let status = SyncStatus::from_str(status_text)
        .map_err(|_| conversion(format!("unknown sync status {status_text:?}")))?;

    Ok(SyncLedgerEntry {
        id,
        window,
        status,
        documents: read_count(doc, "documents"),
        duration_secs: doc.get_f64("duration_secs").ok(),
        started_at: read_datetime(doc, "started_at")?,
        finished_at: read_optional_datetime(doc, "finished_at")?,
        error: doc.get_str("error").ok().map(str::to_string),
    })
}

impl DocumentStore for MongoDocumentStore {
    fn delete_window(&self, window: &SyncWindow) -> Result<u64, StoreError> {
        let result = self.documents.delete_many(window_filter(window), None)?;
        Ok(result.deleted_count)
    }

    fn upsert_batch(&self, documents: &[ServiceDocument]) -> Result<u64, StoreError> {
        if documents.is_empty() {
            return Ok(0);
        }
        let reply = self
            .db
            .run_command(upsert_command(&self.collection, documents), None)?;
        let outcome = upsert_outcome(&reply, documents.len());
        if let Err(StoreError::BatchWrite { failed, .. }) = &outcome {
            log::debug!("Bulk upsert of {} documents: {failed} failed", documents.len());
        }
        outcome
    }

    fn count_documents(&self, window: Option<&SyncWindow>) -> Result<u64, StoreError> {
        Ok(self
            .documents
            .count_documents(window.map(window_filter), None)?)
    }

    fn borough_counts(&self) -> Result<Vec<(Option<String>, u64)>, StoreError> {
        let pipeline = [
            doc! { "$group": { "_id": "$borough", "count": { "$sum": 1 } } },
            doc! { "$sort": { "_id": 1 } },
        ];

        let mut counts = Vec::new();
        for row in self.documents.aggregate(pipeline, None)? {
            let row = row?;
            let borough = row.get_str("_id").ok().map(str::to_string);
            counts.push((borough, read_count(&row, "count")));
        }
        Ok(counts)
    }

    fn open_sync_entry(&self, window: &SyncWindow) -> Result<String, StoreError> {
        let mut entry = ledger_window_fields(window);
        entry.insert("status", SyncStatus::Running.as_ref());
        entry.insert("documents", 0_i64);
        entry.insert("started_at", bson_datetime(Utc::now()));

        let result = self.ledger.insert_one(entry, None)?;
        result
            .inserted_id
            .as_object_id()
            .map(|oid| oid.to_hex())
            .ok_or_else(|| conversion("sync ledger insert returned a non-ObjectId _id"))
    }

    fn close_sync_entry(&self, id: &str, close: &SyncClose) -> Result<(), StoreError> {
        let oid = ObjectId::parse_str(id)
            .map_err(|_| StoreError::UnknownLedgerEntry { id: id.to_string() })?;

        let update = doc! {
            "$set": {
                "status": close.status.as_ref(),
                "documents": i64::try_from(close.documents).unwrap_or(i64::MAX),
                "duration_secs": close.duration.as_secs_f64(),
                "finished_at": bson_datetime(Utc::now()),
                "error": optional(close.error.clone()),
            }
        };

        let result = self.ledger.update_one(doc! { "_id": oid }, update, None)?;
        if result.matched_count == 0 {
            return Err(StoreError::UnknownLedgerEntry { id: id.to_string() });
        }
        Ok(())
    }

    fn sync_history(&self, window: Option<&SyncWindow>) -> Result<Vec<SyncLedgerEntry>, StoreError> {
        let filter = window.map(ledger_window_fields);
        let options = FindOptions::builder().sort(doc! { "started_at": 1 }).build();

        let mut entries = Vec::new();
        for doc in self.ledger.find(filter, options)? {
            entries.push(ledger_entry_from_bson(&doc?)?);
        }
        Ok(entries)
    }
}
