//! The record normalizer.
//!
//! [`clean_batch`] is a pure function over one chunk of raw rows. Rules run
//! in this order:
//!
//! 1. Column names are trimmed, lower-cased, and spaces become underscores;
//!    columns outside the canonical schema are dropped.
//! 2. `created_date`/`closed_date` are parsed; failures become null.
//! 3. `latitude`/`longitude` are coerced to numbers; failures and values
//!    outside the valid coordinate ranges become null.
//! 4. Rows missing `unique_key` or `created_date` are dropped.
//! 5. Duplicate `unique_key`s keep the **last** occurrence.
//! 6. A null borough is inferred from the ZIP prefix when possible.
//! 7. Rows with both coordinates outside the city bounding box are dropped.
//!
//! Dropped rows are counted in [`CleanStats`] and never abort the batch.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::str::FromStr as _;

use chrono::NaiveDateTime;
use nyc311_request_models::{Borough, CleanStats, ServiceRequest};

use crate::RawRow;
use crate::parsing::{date_value, key_value, number_value, text_value};

/// Columns recognized after name normalization. Everything else is dropped.
pub const CANONICAL_COLUMNS: &[&str] = &[
    "unique_key",
    "created_date",
    "closed_date",
    "agency",
    "complaint_type",
    "descriptor",
    "borough",
    "incident_zip",
    "latitude",
    "longitude",
];

/// Three-digit ZIP prefixes that identify a borough.
pub const ZIP_PREFIX_BOROUGHS: &[(&str, Borough)] = &[
    ("100", Borough::Manhattan),
    ("101", Borough::Manhattan),
    ("102", Borough::Manhattan),
    ("103", Borough::StatenIsland),
    ("104", Borough::Bronx),
    ("111", Borough::Queens),
    ("112", Borough::Brooklyn),
    ("113", Borough::Queens),
    ("114", Borough::Queens),
    ("116", Borough::Queens),
];

/// Latitude bounds of the city geofence (inclusive).
pub const LATITUDE_RANGE: RangeInclusive<f64> = 40.5..=40.9;

/// Longitude bounds of the city geofence (inclusive).
pub const LONGITUDE_RANGE: RangeInclusive<f64> = -74.3..=-73.7;

/// Valid latitudes on Earth. Anything else is treated as unparseable.
pub const VALID_LATITUDES: RangeInclusive<f64> = -90.0..=90.0;

/// Valid longitudes on Earth. Anything else is treated as unparseable.
pub const VALID_LONGITUDES: RangeInclusive<f64> = -180.0..=180.0;

/// Normalizes a raw column header: `" Created Date "` -> `"created_date"`.
#[must_use]
pub fn normalize_column_name(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}

/// Looks up the borough for a ZIP code by its three-digit prefix.
///
/// Unmapped or malformed ZIPs yield `None`.
#[must_use]
pub fn infer_borough(zip: &str) -> Option<Borough> {
    let prefix = zip.trim().get(..3)?;
    if !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    ZIP_PREFIX_BOROUGHS
        .iter()
        .find(|(p, _)| *p == prefix)
        .map(|(_, borough)| *borough)
}

/// Whether a coordinate pair passes the geofence.
///
/// Only pairs with both values present are checked.
#[must_use]
pub fn within_geofence(latitude: Option<f64>, longitude: Option<f64>) -> bool {
    match (latitude, longitude) {
        (Some(lat), Some(lng)) => LATITUDE_RANGE.contains(&lat) && LONGITUDE_RANGE.contains(&lng),
        _ => true,
    }
}

/// Deduplicates `items` by `key`, keeping the last occurrence of each key.
///
/// Survivors keep their relative input order. Returns the survivors and the
/// number of superseded items.
pub fn keep_last_by_key<T, K: Ord>(items: Vec<T>, key: impl Fn(&T) -> K) -> (Vec<T>, u64) {
    let mut last_seen: BTreeMap<K, usize> = BTreeMap::new();
    for (i, item) in items.iter().enumerate() {
        last_seen.insert(key(item), i);
    }

    let before = items.len();
    let kept: Vec<T> = items
        .into_iter()
        .enumerate()
        .filter(|(i, item)| last_seen.get(&key(item)) == Some(i))
        .map(|(_, item)| item)
        .collect();

    let removed = (before - kept.len()) as u64;
    (kept, removed)
}

/// A row mapped onto the canonical columns, before any filtering.
#[derive(Debug, Default)]
struct CanonicalRow {
    unique_key: Option<i64>,
    created_date: Option<NaiveDateTime>,
    closed_date: Option<NaiveDateTime>,
    agency: Option<String>,
    complaint_type: Option<String>,
    descriptor: Option<String>,
    borough: Option<Borough>,
    incident_zip: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

fn canonicalize(row: &RawRow) -> CanonicalRow {
    let mut out = CanonicalRow::default();
    let Some(object) = row.as_object() else {
        return out;
    };

    for (column, value) in object {
        match normalize_column_name(column).as_str() {
            "unique_key" => out.unique_key = key_value(value),
            "created_date" => out.created_date = date_value(value),
            "closed_date" => out.closed_date = date_value(value),
            "agency" => out.agency = text_value(value),
            "complaint_type" => out.complaint_type = text_value(value),
            "descriptor" => out.descriptor = text_value(value),
            "borough" => {
                out.borough = text_value(value).and_then(|s| Borough::from_str(&s).ok());
            }
            "incident_zip" => out.incident_zip = text_value(value),
            "latitude" => {
                out.latitude = number_value(value).filter(|v| VALID_LATITUDES.contains(v));
            }
            "longitude" => {
                out.longitude = number_value(value).filter(|v| VALID_LONGITUDES.contains(v));
            }
            _ => {}
        }
    }

    out
}

/// Cleans one raw batch into canonical service requests.
///
/// Never fails: problem rows are dropped and counted.
#[must_use]
pub fn clean_batch(rows: &[RawRow]) -> (Vec<ServiceRequest>, CleanStats) {
    let mut stats = CleanStats {
        original: rows.len() as u64,
        ..CleanStats::default()
    };

    let with_required: Vec<(i64, NaiveDateTime, CanonicalRow)> = rows
        .iter()
        .map(canonicalize)
        .filter_map(|row| Some((row.unique_key?, row.created_date?, row)))
        .collect();
    stats.missing_required = stats.original - with_required.len() as u64;

    let (deduped, duplicates) = keep_last_by_key(with_required, |(key, _, _)| *key);
    stats.duplicates = duplicates;

    let mut cleaned = Vec::with_capacity(deduped.len());
    for (unique_key, created_date, row) in deduped {
        let borough = row
            .borough
            .or_else(|| row.incident_zip.as_deref().and_then(infer_borough));

        if !within_geofence(row.latitude, row.longitude) {
            stats.out_of_bounds += 1;
            continue;
        }

        cleaned.push(ServiceRequest {
            unique_key,
            created_date,
            closed_date: row.closed_date,
            agency: row.agency,
            complaint_type: row.complaint_type,
            descriptor: row.descriptor,
            borough,
            latitude: row.latitude,
            longitude: row.longitude,
        });
    }

    stats.cleaned = cleaned.len() as u64;

    log::debug!(
        "Cleaned batch: {} valid rows, {} skipped ({} missing required, {} duplicates, {} out of bounds)",
        stats.cleaned,
        stats.dropped(),
        stats.missing_required,
        stats.duplicates,
        stats.out_of_bounds,
    );

    (cleaned, stats)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn row(key: &str, created: &str) -> RawRow {
        json!({
            "Unique Key": key,
            "Created Date": created,
            "Closed Date": "",
            "Agency": "NYPD",
            "Complaint Type": "Noise - Residential",
            "Descriptor": "Loud Music/Party",
            "Borough": "MANHATTAN",
            "Incident Zip": "10001",
            "Latitude": "40.7128",
            "Longitude": "-74.0060",
        })
    }

    #[test]
    fn normalizes_column_names() {
        assert_eq!(normalize_column_name(" Created Date "), "created_date");
        assert_eq!(normalize_column_name("Unique Key"), "unique_key");
        assert_eq!(normalize_column_name("latitude"), "latitude");
    }

    #[test]
    fn maps_columns_and_drops_unknown_ones() {
        let rows = vec![json!({
            "UNIQUE KEY": "1",
            "created_date": "01/02/2023 08:15:00 AM",
            "Park Facility Name": "Central Park",
        })];
        let (cleaned, stats) = clean_batch(&rows);
        assert_eq!(stats.cleaned, 1);
        let req = &cleaned[0];
        assert_eq!(req.unique_key, 1);
        assert_eq!(req.created_date.to_string(), "2023-01-02 08:15:00");
        assert!(req.agency.is_none());
        assert!(req.latitude.is_none());
    }

    #[test]
    fn unparseable_closed_date_is_null_not_an_error() {
        let mut r = row("7", "01/02/2023 08:15:00 AM");
        r["Closed Date"] = json!("sometime later");
        let (cleaned, _) = clean_batch(&[r]);
        assert_eq!(cleaned.len(), 1);
        assert!(cleaned[0].closed_date.is_none());
    }

    #[test]
    fn drops_rows_missing_created_date() {
        let mut r = row("5", "");
        r["Created Date"] = serde_json::Value::Null;
        let valid = row("6", "2023-03-01T10:00:00.000");
        let (cleaned, stats) = clean_batch(&[r, valid]);
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned[0].unique_key, 6);
        assert_eq!(stats.missing_required, 1);
    }

    #[test]
    fn drops_rows_with_unparseable_created_date_or_missing_key() {
        let bad_date = row("5", "yesterday");
        let mut no_key = row("", "2023-03-01");
        no_key["Unique Key"] = json!("");
        let (cleaned, stats) = clean_batch(&[bad_date, no_key]);
        assert!(cleaned.is_empty());
        assert_eq!(stats.missing_required, 2);
    }

    #[test]
    fn duplicate_keys_keep_last_occurrence() {
        let mut first = row("42", "2023-01-01 00:00:00");
        first["Agency"] = json!("DOT");
        let other = row("43", "2023-01-01 00:00:00");
        let mut last = row("42", "2023-06-01 00:00:00");
        last["Agency"] = json!("DSNY");

        let (cleaned, stats) = clean_batch(&[first, other, last]);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(cleaned.len(), 2);
        assert_eq!(cleaned[0].unique_key, 43);
        assert_eq!(cleaned[1].unique_key, 42);
        assert_eq!(cleaned[1].agency.as_deref(), Some("DSNY"));
        assert_eq!(cleaned[1].created_date.to_string(), "2023-06-01 00:00:00");
    }

    #[test]
    fn infers_borough_from_zip_prefix() {
        let mut brooklyn = row("1", "2023-01-01");
        brooklyn["Borough"] = json!("");
        brooklyn["Incident Zip"] = json!("11201");
        let mut unmapped = row("2", "2023-01-01");
        unmapped["Borough"] = json!("Unspecified");
        unmapped["Incident Zip"] = json!("99950");

        let (cleaned, _) = clean_batch(&[brooklyn, unmapped]);
        assert_eq!(cleaned[0].borough, Some(Borough::Brooklyn));
        assert_eq!(cleaned[1].borough, None);
    }

    #[test]
    fn explicit_borough_wins_over_zip() {
        let mut r = row("1", "2023-01-01");
        r["Borough"] = json!("queens");
        r["Incident Zip"] = json!("11201");
        let (cleaned, _) = clean_batch(&[r]);
        assert_eq!(cleaned[0].borough, Some(Borough::Queens));
    }

    #[test]
    fn zip_lookup_table() {
        assert_eq!(infer_borough("112"), Some(Borough::Brooklyn));
        assert_eq!(infer_borough("10301"), Some(Borough::StatenIsland));
        assert_eq!(infer_borough("11201.0"), Some(Borough::Brooklyn));
        assert_eq!(infer_borough("999"), None);
        assert_eq!(infer_borough("11"), None);
        assert_eq!(infer_borough("N/A"), None);
    }

    #[test]
    fn geofence_filters_only_complete_pairs() {
        let mut null_island = row("1", "2023-01-01");
        null_island["Latitude"] = json!("0.0");
        null_island["Longitude"] = json!("0.0");
        let city_hall = row("2", "2023-01-01");
        let mut no_coords = row("3", "2023-01-01");
        no_coords["Latitude"] = json!("");
        no_coords["Longitude"] = json!("");
        let mut half = row("4", "2023-01-01");
        half["Longitude"] = json!("");
        half["Latitude"] = json!("12.0");

        let (cleaned, stats) = clean_batch(&[null_island, city_hall, no_coords, half]);
        let keys: Vec<i64> = cleaned.iter().map(|r| r.unique_key).collect();
        assert_eq!(keys, vec![2, 3, 4]);
        assert_eq!(stats.out_of_bounds, 1);
    }

    #[test]
    fn impossible_coordinates_become_null() {
        let mut lone_latitude = row("1", "01/02/2023 12:00:00 AM");
        lone_latitude["Latitude"] = json!("4070.0");
        lone_latitude["Longitude"] = json!("");
        let mut lone_longitude = row("2", "01/02/2023 12:00:00 AM");
        lone_longitude["Latitude"] = json!("");
        lone_longitude["Longitude"] = json!("-740.06");
        let mut both = row("3", "01/02/2023 12:00:00 AM");
        both["Latitude"] = json!("-90.5");
        both["Longitude"] = json!("NaN");

        let (cleaned, stats) = clean_batch(&[lone_latitude, lone_longitude, both]);
        assert_eq!(cleaned.len(), 3);
        assert_eq!(stats.out_of_bounds, 0);
        for req in &cleaned {
            assert!(req.latitude.is_none(), "key {}", req.unique_key);
            assert!(req.longitude.is_none(), "key {}", req.unique_key);
        }
    }

    #[test]
    fn geofence_bounds() {
        assert!(within_geofence(Some(40.7128), Some(-74.0060)));
        assert!(!within_geofence(Some(0.0), Some(0.0)));
        assert!(!within_geofence(Some(41.2), Some(-74.0)));
        assert!(within_geofence(None, None));
        assert!(within_geofence(Some(0.0), None));
    }

    #[test]
    fn non_object_rows_count_as_missing_required() {
        let (cleaned, stats) = clean_batch(&[json!(["not", "a", "row"]), json!(null)]);
        assert!(cleaned.is_empty());
        assert_eq!(stats.original, 2);
        assert_eq!(stats.missing_required, 2);
    }

    #[test]
    fn stats_add_up() {
        let mut out = row("9", "2023-01-01");
        out["Latitude"] = json!("45.0");
        let rows = vec![
            row("1", "2023-01-01"),
            row("1", "2023-01-02"),
            row("", "2023-01-01"),
            out,
        ];
        let (cleaned, stats) = clean_batch(&rows);
        assert_eq!(stats.original, 4);
        assert_eq!(stats.cleaned, cleaned.len() as u64);
        assert_eq!(stats.cleaned + stats.dropped(), stats.original);
    }

    #[test]
    fn keep_last_by_key_preserves_order() {
        let (kept, removed) = keep_last_by_key(vec![(1, 'a'), (2, 'b'), (1, 'c')], |(k, _)| *k);
        assert_eq!(kept, vec![(2, 'b'), (1, 'c')]);
        assert_eq!(removed, 1);
    }
}
