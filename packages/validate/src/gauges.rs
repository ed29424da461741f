//! Prometheus gauges for poll mode.
//!
//! Recording goes through the `metrics` facade, so it is a no-op until
//! [`install_exporter`] registers the Prometheus recorder.

use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::ConsistencyReport;

pub const PRIMARY_COUNT: &str = "nyc311_primary_count";
pub const SECONDARY_COUNT: &str = "nyc311_secondary_count";
pub const COUNT_MISMATCH: &str = "nyc311_count_mismatch";
pub const IN_SYNC: &str = "nyc311_in_sync";
pub const HARD_FAILURE: &str = "nyc311_hard_failure";
pub const LAST_CHECK_TIMESTAMP: &str = "nyc311_last_check_timestamp_seconds";
pub const CHECK_FAILURES: &str = "nyc311_check_failures_total";

/// Serves `/metrics` on `listen` and installs the global recorder.
///
/// # Errors
///
/// Returns [`BuildError`] if the listener cannot be bound or a recorder is
/// already installed.
pub fn install_exporter(listen: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(listen).install()?;
    describe();
    log::info!("Serving Prometheus metrics on http://{listen}/metrics");
    Ok(())
}

fn describe() {
    describe_gauge!(PRIMARY_COUNT, "Rows in the primary store for the checked scope");
    describe_gauge!(SECONDARY_COUNT, "Documents in the secondary store for the checked scope");
    describe_gauge!(COUNT_MISMATCH, "Absolute difference between the two counts");
    describe_gauge!(IN_SYNC, "1 when both counts are equal");
    describe_gauge!(HARD_FAILURE, "1 when the last check was a hard failure");
    describe_gauge!(LAST_CHECK_TIMESTAMP, "Unix time of the last completed check");
    describe_counter!(CHECK_FAILURES, "Checks that could not complete");
}

#[allow(clippy::cast_precision_loss)]
fn as_gauge(value: u64) -> f64 {
    value as f64
}

/// Publishes a completed check.
pub fn record_report(report: &ConsistencyReport) {
    gauge!(PRIMARY_COUNT, as_gauge(report.primary));
    gauge!(SECONDARY_COUNT, as_gauge(report.secondary));
    gauge!(COUNT_MISMATCH, as_gauge(report.mismatch));
    gauge!(IN_SYNC, if report.health.is_in_sync() { 1.0 } else { 0.0 });
    gauge!(
        HARD_FAILURE,
        if report.health.is_hard_failure() { 1.0 } else { 0.0 }
    );
    #[allow(clippy::cast_precision_loss)]
    let checked_at = report.checked_at.timestamp() as f64;
    gauge!(LAST_CHECK_TIMESTAMP, checked_at);
}

/// Counts a check that errored before producing a report.
pub fn record_failure() {
    counter!(CHECK_FAILURES, 1);
}
