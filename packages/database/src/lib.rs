#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Primary store for NYC 311 service requests.
//!
//! The store of record is a `DuckDB` file holding the `service_requests`
//! table and the `ingestion_ledger` table. All operations are synchronous and
//! take a borrowed [`duckdb::Connection`]; callers own the connection.

pub mod paths;
pub mod primary;

/// Errors that can occur during primary-store operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// `DuckDB` error.
    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    /// I/O error (e.g., creating the data directory).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Data conversion error.
    #[error("Data conversion error: {message}")]
    Conversion {
        /// Description of what went wrong.
        message: String,
    },

    /// A batch upsert failed and its transaction was rolled back.
    #[error("Batch {batch_index} ({rows} rows) rolled back: {source}")]
    BatchWrite {
        /// Zero-based index of the batch within the run.
        batch_index: usize,
        /// Rows in the rolled-back batch.
        rows: usize,
        /// Underlying `DuckDB` error.
        source: duckdb::Error,
    },
}
