//! `DuckDB` storage for service requests and the ingestion ledger.
//!
//! The `service_requests` table is keyed by `unique_key`; the
//! `ingestion_ledger` table is keyed by source file name. Writes are
//! window- or key-scoped, so runs over disjoint windows never touch each
//! other's rows.

use std::path::Path;
use std::str::FromStr as _;
use std::time::Duration;

use chrono::{NaiveDateTime, Timelike as _};
use duckdb::Connection;
use nyc311_request_models::{Borough, IngestionLedgerEntry, ServiceRequest, SyncWindow};
use nyc311_source::normalize::keep_last_by_key;

use crate::DbError;

/// Timestamp format used when binding timestamps as text, at the
/// microsecond precision of a `DuckDB` `TIMESTAMP`.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

const UPSERT_SQL: &str = "INSERT INTO service_requests (
        unique_key, created_date, closed_date, agency, complaint_type,
        descriptor, borough, latitude, longitude
    ) VALUES (?, CAST(? AS TIMESTAMP), CAST(? AS TIMESTAMP), ?, ?, ?, ?, ?, ?)
    ON CONFLICT (unique_key) DO UPDATE SET
        created_date = EXCLUDED.created_date,
        closed_date = EXCLUDED.closed_date,
        agency = EXCLUDED.agency,
        complaint_type = EXCLUDED.complaint_type,
        descriptor = EXCLUDED.descriptor,
        borough = EXCLUDED.borough,
        latitude = EXCLUDED.latitude,
        longitude = EXCLUDED.longitude";

const SELECT_COLUMNS: &str = "unique_key, created_date::TEXT, closed_date::TEXT, agency,
    complaint_type, descriptor, borough,
    CAST(latitude AS DOUBLE), CAST(longitude AS DOUBLE)";

const WINDOW_CLAUSE: &str =
    "created_date >= CAST(? AS TIMESTAMP) AND created_date < CAST(? AS TIMESTAMP)";

/// Opens (or creates) the primary store and ensures the schema exists.
///
/// # Errors
///
/// Returns [`DbError`] if the connection or schema creation fails.
pub fn open(path: &Path) -> Result<Connection, DbError> {
    if let Some(parent) = path.parent() {
        crate::paths::ensure_dir(parent)?;
    }

    let conn = Connection::open(path)?;
    create_schema(&conn)?;
    Ok(conn)
}

/// Opens a private in-memory store with the schema applied.
///
/// # Errors
///
/// Returns [`DbError`] if the connection or schema creation fails.
pub fn open_in_memory() -> Result<Connection, DbError> {
    let conn = Connection::open_in_memory()?;
    create_schema(&conn)?;
    Ok(conn)
}

fn create_schema(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS service_requests (
            unique_key BIGINT NOT NULL PRIMARY KEY,
            created_date TIMESTAMP NOT NULL,
            closed_date TIMESTAMP,
            agency TEXT,
            complaint_type TEXT,
            descriptor TEXT,
            borough TEXT,
            latitude DECIMAL(9, 6),
            longitude DECIMAL(9, 6)
        );

        CREATE TABLE IF NOT EXISTS ingestion_ledger (
            filename TEXT NOT NULL PRIMARY KEY,
            rows_loaded BIGINT NOT NULL,
            duration_secs DOUBLE NOT NULL,
            rows_per_sec DOUBLE NOT NULL,
            loaded_at TIMESTAMP NOT NULL
        );",
    )?;

    Ok(())
}

fn format_ts(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn window_params(window: &SyncWindow) -> [String; 2] {
    [
        format_ts(window.start_bound()),
        format_ts(window.end_bound()),
    ]
}

/// Runs `f` inside `BEGIN`/`COMMIT`, rolling back if it (or the commit)
/// fails.
fn in_transaction<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> Result<T, duckdb::Error>,
) -> Result<T, duckdb::Error> {
    conn.execute_batch("BEGIN TRANSACTION")?;

    let result = f(conn).and_then(|value| conn.execute_batch("COMMIT").map(|()| value));

    if result.is_err()
        && let Err(e) = conn.execute_batch("ROLLBACK")
    {
        log::error!("ROLLBACK failed after a failed transaction: {e}");
    }

    result
}

/// Returns whether the ingestion ledger has an entry for `filename`.
///
/// A `true` result means the file was fully applied and the caller must skip
/// the load entirely.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn already_loaded(conn: &Connection, filename: &str) -> Result<bool, DbError> {
    let mut stmt = conn.prepare("SELECT COUNT(*) FROM ingestion_ledger WHERE filename = ?")?;
    let count: i64 = stmt.query_row([filename], |row| row.get(0))?;
    Ok(count > 0)
}

/// Deletes every service request whose `created_date` falls in `window`.
///
/// Returns the number of rows deleted.
///
/// # Errors
///
/// Returns [`DbError`] if the delete fails.
pub fn clear_window(conn: &Connection, window: &SyncWindow) -> Result<u64, DbError> {
    let [start, end] = window_params(window);
    let deleted = conn.execute(
        &format!("DELETE FROM service_requests WHERE {WINDOW_CLAUSE}"),
        duckdb::params![start, end],
    )?;
    Ok(u64::try_from(deleted).unwrap_or(0))
}

/// Upserts a cleaned batch by `unique_key` inside one transaction.
///
/// Absent keys are inserted and present keys have every non-key field
/// overwritten. If any row fails the whole batch is rolled back and
/// [`DbError::BatchWrite`] is returned; no row of the batch is kept.
///
/// Returns the number of rows written.
///
/// # Errors
///
/// Returns [`DbError::BatchWrite`] if the batch could not be applied.
pub fn load_batch(
    conn: &Connection,
    batch: &[ServiceRequest],
    batch_index: usize,
) -> Result<u64, DbError> {
    if batch.is_empty() {
        return Ok(0);
    }

    // One statement per key keeps the upsert deterministic: last occurrence wins.
    let (rows, superseded) = keep_last_by_key(batch.iter().collect(), |r| r.unique_key);
    if superseded > 0 {
        log::debug!("Batch {batch_index}: {superseded} superseded duplicate key(s)");
    }

    let written = in_transaction(conn, |conn| {
        let mut stmt = conn.prepare(UPSERT_SQL)?;
        let mut total = 0usize;

        for request in &rows {
            total += stmt.execute(duckdb::params![
                request.unique_key,
                format_ts(request.created_date),
                request.closed_date.map(format_ts),
                request.agency.as_deref(),
                request.complaint_type.as_deref(),
                request.descriptor.as_deref(),
                request.borough.as_ref().map(AsRef::<str>::as_ref),
                request.latitude,
                request.longitude,
            ])?;
        }

        Ok(total)
    })
    .map_err(|source| DbError::BatchWrite {
        batch_index,
        rows: batch.len(),
        source,
    })?;

    Ok(u64::try_from(written).unwrap_or(0))
}

/// Records (or overwrites) the ledger entry for a fully loaded file.
///
/// An upsert, so a rerun after an earlier partial failure replaces any stale
/// entry.
///
/// # Errors
///
/// Returns [`DbError`] if the upsert fails.
pub fn record_ledger(
    conn: &Connection,
    filename: &str,
    rows_loaded: u64,
    duration: Duration,
) -> Result<IngestionLedgerEntry, DbError> {
    let duration_secs = duration.as_secs_f64();
    #[allow(clippy::cast_precision_loss)]
    let rows_per_sec = if duration_secs > 0.0 {
        rows_loaded as f64 / duration_secs
    } else {
        0.0
    };
    let now = chrono::Utc::now().naive_utc();
    let loaded_at = now.with_nanosecond(0).unwrap_or(now);

    conn.execute(
        "INSERT INTO ingestion_ledger (filename, rows_loaded, duration_secs, rows_per_sec, loaded_at)
         VALUES (?, ?, ?, ?, CAST(? AS TIMESTAMP))
         ON CONFLICT (filename) DO UPDATE SET
            rows_loaded = EXCLUDED.rows_loaded,
            duration_secs = EXCLUDED.duration_secs,
            rows_per_sec = EXCLUDED.rows_per_sec,
            loaded_at = EXCLUDED.loaded_at",
        duckdb::params![
            filename,
            i64::try_from(rows_loaded).unwrap_or(i64::MAX),
            duration_secs,
            rows_per_sec,
            format_ts(loaded_at),
        ],
    )?;

    Ok(IngestionLedgerEntry {
        filename: filename.to_string(),
        rows_loaded,
        duration_secs,
        rows_per_sec,
        loaded_at,
    })
}

/// Returns every ingestion ledger entry, oldest first.
///
/// # Errors
///
/// Returns [`DbError`] if the query or a timestamp conversion fails.
pub fn ledger_entries(conn: &Connection) -> Result<Vec<IngestionLedgerEntry>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT filename, rows_loaded, duration_secs, rows_per_sec, loaded_at::TEXT
         FROM ingestion_ledger ORDER BY loaded_at, filename",
    )?;

    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, f64>(2)?,
            row.get::<_, f64>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (filename, rows_loaded, duration_secs, rows_per_sec, loaded_at) = row?;
        entries.push(IngestionLedgerEntry {
            filename,
            rows_loaded: u64::try_from(rows_loaded).unwrap_or(0),
            duration_secs,
            rows_per_sec,
            loaded_at: require_timestamp(&loaded_at, "loaded_at")?,
        });
    }

    Ok(entries)
}

/// Reads the service requests in `window`, ordered by `unique_key`.
///
/// Coordinates come back as `f64` regardless of the stored decimal type.
/// `limit` caps the number of rows returned.
///
/// # Errors
///
/// Returns [`DbError`] if the query or a row conversion fails.
pub fn read_window(
    conn: &Connection,
    window: &SyncWindow,
    limit: Option<u64>,
) -> Result<Vec<ServiceRequest>, DbError> {
    let limit_clause = limit.map(|n| format!(" LIMIT {n}")).unwrap_or_default();
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM service_requests WHERE {WINDOW_CLAUSE}
         ORDER BY unique_key{limit_clause}"
    );

    let [start, end] = window_params(window);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(duckdb::params![start, end], |row| {
        Ok(StoredRow {
            unique_key: row.get(0)?,
            created_date: row.get(1)?,
            closed_date: row.get(2)?,
            agency: row.get(3)?,
            complaint_type: row.get(4)?,
            descriptor: row.get(5)?,
            borough: row.get(6)?,
            latitude: row.get(7)?,
            longitude: row.get(8)?,
        })
    })?;

    let mut requests = Vec::new();
    for row in rows {
        requests.push(row?.into_request()?);
    }

    Ok(requests)
}

/// Counts service requests in `window`, or in the whole table when `None`.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn count_requests(conn: &Connection, window: Option<&SyncWindow>) -> Result<u64, DbError> {
    let count: i64 = match window {
        Some(window) => {
            let [start, end] = window_params(window);
            let mut stmt = conn.prepare(&format!(
                "SELECT COUNT(*) FROM service_requests WHERE {WINDOW_CLAUSE}"
            ))?;
            stmt.query_row(duckdb::params![start, end], |row| row.get(0))?
        }
        None => {
            let mut stmt = conn.prepare("SELECT COUNT(*) FROM service_requests")?;
            stmt.query_row([], |row| row.get(0))?
        }
    };
    Ok(u64::try_from(count).unwrap_or(0))
}

/// Returns `(borough, count)` pairs over the whole table.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn borough_counts(conn: &Connection) -> Result<Vec<(Option<String>, u64)>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT borough, COUNT(*) FROM service_requests GROUP BY borough ORDER BY borough",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, Option<String>>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut counts = Vec::new();
    for row in rows {
        let (borough, count) = row?;
        counts.push((borough, u64::try_from(count).unwrap_or(0)));
    }
    Ok(counts)
}

/// Rewrites up to ten rows of `borough` with their own value.
///
/// A field-preserving update used to exercise write traffic alongside a
/// load or sync; it never changes key membership or window contents.
///
/// # Errors
///
/// Returns [`DbError`] if the update fails.
pub fn touch_borough(conn: &Connection, borough: Borough) -> Result<u64, DbError> {
    let updated = conn.execute(
        "UPDATE service_requests SET borough = borough
         WHERE unique_key IN (
            SELECT unique_key FROM service_requests WHERE borough = ? LIMIT 10
         )",
        [borough.as_ref()],
    )?;
    Ok(u64::try_from(updated).unwrap_or(0))
}

/// A `service_requests` row as read back, before timestamp parsing.
struct StoredRow {
    unique_key: i64,
    created_date: String,
    closed_date: Option<String>,
    agency: Option<String>,
    complaint_type: Option<String>,
    descriptor: Option<String>,
    borough: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

impl StoredRow {
    fn into_request(self) -> Result<ServiceRequest, DbError> {
        let created_date = require_timestamp(&self.created_date, "created_date")?;
        let closed_date = self.closed_date.as_deref().and_then(parse_timestamp);
        let borough = self.borough.as_deref().and_then(|b| Borough::from_str(b).ok());

        Ok(ServiceRequest {
            unique_key: self.unique_key,
            created_date,
            closed_date,
            agency: self.agency,
            complaint_type: self.complaint_type,
            descriptor: self.descriptor,
            borough,
            latitude: self.latitude,
            longitude: self.longitude,
        })
    }
}

fn require_timestamp(s: &str, column: &str) -> Result<NaiveDateTime, DbError> {
    parse_timestamp(s).ok_or_else(|| DbError::Conversion {
        message: format!("unparseable {column} timestamp {s:?}"),
    })
}

/// Parses `DuckDB`'s `TIMESTAMP::TEXT` output, with or without fractional
/// seconds.
fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    if let Ok(ts) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(ts);
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(ts);
    }

    log::warn!("Failed to parse timestamp: {s:?}");
    None
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn ts(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap()
    }

    fn request(key: i64, created: NaiveDateTime) -> ServiceRequest {
        ServiceRequest {
            unique_key: key,
            created_date: created,
            closed_date: None,
            agency: Some("NYPD".to_string()),
            complaint_type: Some("Noise - Residential".to_string()),
            descriptor: Some("Loud Music/Party".to_string()),
            borough: Some(Borough::Queens),
            latitude: Some(40.7128),
            longitude: Some(-74.006),
        }
    }

    fn y2023() -> SyncWindow {
        SyncWindow::calendar_year(2023).unwrap()
    }

    #[test]
    fn upserts_and_reads_back() {
        let conn = open_in_memory().unwrap();
        let mut closed = request(1, ts(2023, 5, 1));
        closed.closed_date = Some(ts(2023, 5, 3));
        closed.borough = Some(Borough::StatenIsland);

        assert_eq!(load_batch(&conn, &[closed.clone()], 0).unwrap(), 1);

        let rows = read_window(&conn, &y2023(), None).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.unique_key, 1);
        assert_eq!(row.created_date, closed.created_date);
        assert_eq!(row.closed_date, closed.closed_date);
        assert_eq!(row.borough, Some(Borough::StatenIsland));
        assert!((row.latitude.unwrap() - 40.7128).abs() < 1e-9);
        assert!((row.longitude.unwrap() + 74.006).abs() < 1e-9);
    }

    #[test]
    fn upsert_overwrites_non_key_fields() {
        let conn = open_in_memory().unwrap();
        load_batch(&conn, &[request(7, ts(2023, 1, 2))], 0).unwrap();

        let mut updated = request(7, ts(2023, 2, 2));
        updated.agency = None;
        updated.borough = Some(Borough::Bronx);
        updated.latitude = None;
        load_batch(&conn, &[updated], 1).unwrap();

        assert_eq!(count_requests(&conn, None).unwrap(), 1);
        let row = &read_window(&conn, &y2023(), None).unwrap()[0];
        assert_eq!(row.created_date, ts(2023, 2, 2));
        assert!(row.agency.is_none());
        assert_eq!(row.borough, Some(Borough::Bronx));
        assert!(row.latitude.is_none());
    }

    #[test]
    fn duplicate_keys_in_one_batch_keep_last() {
        let conn = open_in_memory().unwrap();
        let first = request(3, ts(2023, 1, 1));
        let mut last = request(3, ts(2023, 1, 1));
        last.descriptor = Some("Banging/Pounding".to_string());
        load_batch(&conn, &[first, last], 0).unwrap();

        let rows = read_window(&conn, &y2023(), None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].descriptor.as_deref(), Some("Banging/Pounding"));
    }

    #[test]
    fn failed_batch_rolls_back_entirely() {
        let conn = open_in_memory().unwrap();
        let good = request(10, ts(2023, 3, 1));
        let mut bad = request(11, ts(2023, 3, 1));
        // Does not fit DECIMAL(9, 6).
        bad.latitude = Some(123_456.0);

        let err = load_batch(&conn, &[good, bad], 4).unwrap_err();
        assert!(matches!(
            err,
            DbError::BatchWrite {
                batch_index: 4,
                rows: 2,
                ..
            }
        ));
        assert_eq!(count_requests(&conn, None).unwrap(), 0);

        // The connection is usable again after the rollback.
        load_batch(&conn, &[request(12, ts(2023, 3, 1))], 5).unwrap();
        assert_eq!(count_requests(&conn, None).unwrap(), 1);
    }

    #[test]
    fn clear_window_is_window_scoped() {
        let conn = open_in_memory().unwrap();
        load_batch(
            &conn,
            &[
                request(1, ts(2022, 12, 31)),
                request(2, NaiveDate::from_ymd_opt(2023, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()),
                request(3, ts(2023, 12, 31)),
                request(4, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()),
            ],
            0,
        )
        .unwrap();

        assert_eq!(count_requests(&conn, Some(&y2023())).unwrap(), 2);
        assert_eq!(clear_window(&conn, &y2023()).unwrap(), 2);

        let mut remaining: Vec<i64> = [2022, 2024]
            .into_iter()
            .flat_map(|y| {
                read_window(&conn, &SyncWindow::calendar_year(y).unwrap(), None).unwrap()
            })
            .map(|r| r.unique_key)
            .collect();
        remaining.sort_unstable();
        assert_eq!(remaining, vec![1, 4]);
    }

    #[test]
    fn read_window_respects_limit() {
        let conn = open_in_memory().unwrap();
        let batch: Vec<ServiceRequest> = (1..=5).map(|k| request(k, ts(2023, 6, 1))).collect();
        load_batch(&conn, &batch, 0).unwrap();

        let rows = read_window(&conn, &y2023(), Some(3)).unwrap();
        let keys: Vec<i64> = rows.iter().map(|r| r.unique_key).collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[test]
    fn ledger_gate_and_upsert() {
        let conn = open_in_memory().unwrap();
        assert!(!already_loaded(&conn, "nyc_311_2023.csv").unwrap());

        record_ledger(&conn, "nyc_311_2023.csv", 10, Duration::from_secs(2)).unwrap();
        assert!(already_loaded(&conn, "nyc_311_2023.csv").unwrap());
        assert!(!already_loaded(&conn, "nyc_311_2024.csv").unwrap());

        let entry = record_ledger(&conn, "nyc_311_2023.csv", 40, Duration::from_secs(4)).unwrap();
        assert!((entry.rows_per_sec - 10.0).abs() < f64::EPSILON);

        let entries = ledger_entries(&conn).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].rows_loaded, 40);
        assert!((entries[0].duration_secs - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_duration_has_zero_throughput() {
        let conn = open_in_memory().unwrap();
        let entry = record_ledger(&conn, "f.csv", 10, Duration::ZERO).unwrap();
        assert!(entry.rows_per_sec.abs() < f64::EPSILON);
    }

    #[test]
    fn field_preserving_update_keeps_counts() {
        let conn = open_in_memory().unwrap();
        let batch: Vec<ServiceRequest> = (1..=3).map(|k| request(k, ts(2023, 6, 1))).collect();
        load_batch(&conn, &batch, 0).unwrap();

        assert_eq!(touch_borough(&conn, Borough::Queens).unwrap(), 3);
        assert_eq!(touch_borough(&conn, Borough::Bronx).unwrap(), 0);
        assert_eq!(
            borough_counts(&conn).unwrap(),
            vec![(Some("QUEENS".to_string()), 3)]
        );
    }

    #[test]
    fn fractional_seconds_survive_a_round_trip() {
        let conn = open_in_memory().unwrap();
        let created = NaiveDate::from_ymd_opt(2023, 3, 1)
            .unwrap()
            .and_hms_milli_opt(14, 30, 0, 500)
            .unwrap();
        let mut req = request(21, created);
        req.closed_date = NaiveDate::from_ymd_opt(2023, 3, 2)
            .unwrap()
            .and_hms_micro_opt(8, 0, 0, 123_456);
        load_batch(&conn, &[req.clone()], 0).unwrap();

        let rows = read_window(&conn, &y2023(), None).unwrap();
        assert_eq!(rows[0].created_date, created);
        assert_eq!(rows[0].closed_date, req.closed_date);
    }

    #[test]
    fn parses_duckdb_timestamp_text() {
        assert_eq!(
            parse_timestamp("2023-01-15 10:30:00").unwrap().to_string(),
            "2023-01-15 10:30:00"
        );
        assert!(parse_timestamp("2023-01-15 10:30:00.123").is_some());
        assert!(parse_timestamp("garbage").is_none());
    }
}
