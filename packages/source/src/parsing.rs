//! Shared parsing utilities for extract cells.
//!
//! Every function here is total: a value that cannot be interpreted becomes
//! `None` rather than an error.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;

/// Timestamp format of the NYC Open Data CSV export
/// (e.g. `01/15/2023 02:30:00 PM`).
pub const EXTRACT_DATE_FORMAT: &str = "%m/%d/%Y %I:%M:%S %p";

/// ISO forms produced by the API export and locally generated samples.
const ISO_DATE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

/// Parses an extract timestamp.
///
/// Tries [`EXTRACT_DATE_FORMAT`] first, then the ISO variants, then a bare
/// `YYYY-MM-DD` date (midnight).
#[must_use]
pub fn parse_extract_date(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, EXTRACT_DATE_FORMAT) {
        return Some(dt);
    }
    for format in ISO_DATE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN))
}

/// Parses a date cell. Only string cells can hold dates.
#[must_use]
pub fn date_value(value: &Value) -> Option<NaiveDateTime> {
    value.as_str().and_then(parse_extract_date)
}

/// Coerces a cell to a finite `f64`.
#[must_use]
pub fn number_value(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Coerces a cell to a positive integer key.
///
/// Accepts integral floats (`"123.0"`), which spreadsheet round-trips
/// commonly produce.
#[must_use]
pub fn key_value(value: &Value) -> Option<i64> {
    let key = match value {
        Value::Number(n) => n.as_i64().or_else(|| integral(n.as_f64()?))?,
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| integral(s.parse::<f64>().ok()?))?
        }
        _ => return None,
    };
    (key > 0).then_some(key)
}

#[allow(clippy::cast_possible_truncation)]
fn integral(f: f64) -> Option<i64> {
    // i64::MAX is not exactly representable; stay strictly below 2^63.
    (f.is_finite() && f.fract() == 0.0 && f.abs() < 9.2e18).then_some(f as i64)
}

/// Coerces a cell to trimmed, non-empty text.
#[must_use]
pub fn text_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
