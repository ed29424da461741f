#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Reading and cleaning of NYC 311 service-request extracts.
//!
//! [`extract::ExtractReader`] streams a CSV extract in fixed-size chunks of
//! loosely-typed rows, and [`normalize::clean_batch`] turns each chunk into
//! canonical [`nyc311_request_models::ServiceRequest`] values plus
//! [`nyc311_request_models::CleanStats`].

pub mod extract;
pub mod normalize;
pub mod parsing;
pub mod progress;

/// A loosely-typed row as read from an extract: column name to JSON value.
///
/// CSV extracts produce string values only, but rows handed in from other
/// producers may carry native numbers or nulls.
pub type RawRow = serde_json::Value;

/// Errors that can occur while reading an extract.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// I/O error opening or reading the extract.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV decoding failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The extract has no header row.
    #[error("Extract {label} has no header row")]
    MissingHeader {
        /// Path or label of the extract.
        label: String,
    },
}
