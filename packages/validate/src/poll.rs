//! Continuous consistency checking.
//!
//! The poller never stops on a bad check: errors and unhealthy results are
//! logged and published, then the next check runs after the interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::{ConsistencyReport, ValidationError, gauges};

/// Longest single sleep between stop-flag checks.
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// Poll loop settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub interval: Duration,
    /// Stop after this many checks; `None` runs until stopped.
    pub iterations: Option<u64>,
}

/// What a poll loop observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Checks attempted.
    pub checks: u64,
    /// Checks that errored.
    pub failures: u64,
    /// Completed checks classified as a hard failure.
    pub hard_failures: u64,
    pub last: Option<ConsistencyReport>,
}

fn sleep_unless_stopped(interval: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + interval;
    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(STOP_CHECK_INTERVAL));
    }
}

/// Runs `check` every `options.interval` until `stop` is set or the
/// iteration limit is reached.
pub fn poll<F>(options: &PollOptions, stop: &AtomicBool, mut check: F) -> PollSummary
where
    F: FnMut() -> Result<ConsistencyReport, ValidationError>,
{
    let mut summary = PollSummary::default();
    let exhausted = |checks: u64| options.iterations.is_some_and(|n| checks >= n);

    while !stop.load(Ordering::Relaxed) && !exhausted(summary.checks) {
        summary.checks += 1;

        match check() {
            Ok(report) => {
                gauges::record_report(&report);
                if report.health.is_hard_failure() {
                    summary.hard_failures += 1;
                    log::warn!(
                        "Hard consistency failure: {:?} (primary={}, secondary={})",
                        report.health,
                        report.primary,
                        report.secondary,
                    );
                } else if !report.health.is_in_sync() {
                    log::warn!("Stores drifted by {} documents", report.mismatch);
                }
                summary.last = Some(report);
            }
            Err(e) => {
                summary.failures += 1;
                gauges::record_failure();
                log::error!("Consistency check failed: {e}");
            }
        }

        if exhausted(summary.checks) {
            break;
        }
        sleep_unless_stopped(options.interval, stop);
    }

    log::info!(
        "Poller stopped after {} checks ({} failed)",
        summary.checks,
        summary.failures
    );
    summary
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use nyc311_database::DbError;

    use super::*;
    use crate::SyncHealth;

    fn report(primary: u64, secondary: u64, health: SyncHealth) -> ConsistencyReport {
        ConsistencyReport {
            window: None,
            primary,
            secondary,
            mismatch: primary.abs_diff(secondary),
            health,
            checked_at: Utc::now(),
        }
    }

    fn quick(iterations: u64) -> PollOptions {
        PollOptions {
            interval: Duration::ZERO,
            iterations: Some(iterations),
        }
    }

    #[test]
    fn keeps_running_across_failed_checks() {
        let stop = AtomicBool::new(false);
        let mut calls = 0;
        let summary = poll(&quick(4), &stop, || {
            calls += 1;
            match calls {
                1 | 3 => Err(ValidationError::Primary(DbError::Conversion {
                    message: "boom".to_string(),
                })),
                2 => Ok(report(100, 0, SyncHealth::Empty)),
                _ => Ok(report(10_000, 9_500, SyncHealth::Drift)),
            }
        });

        assert_eq!(summary.checks, 4);
        assert_eq!(summary.failures, 2);
        assert_eq!(summary.hard_failures, 1);
        assert_eq!(summary.last.unwrap().health, SyncHealth::Drift);
    }

    #[test]
    fn stop_flag_ends_the_loop() {
        let stop = AtomicBool::new(false);
        let options = PollOptions {
            interval: Duration::from_secs(3600),
            iterations: None,
        };
        let summary = poll(&options, &stop, || {
            stop.store(true, Ordering::Relaxed);
            Ok(report(1, 1, SyncHealth::InSync))
        });
        assert_eq!(summary.checks, 1);
    }

    #[test]
    fn preset_stop_runs_nothing() {
        let stop = AtomicBool::new(true);
        let summary = poll(&quick(3), &stop, || Ok(report(1, 1, SyncHealth::InSync)));
        assert_eq!(summary.checks, 0);
        assert!(summary.last.is_none());
    }

    #[test]
    fn zero_iterations_runs_no_checks() {
        let stop = AtomicBool::new(false);
        let mut calls = 0;
        let summary = poll(&quick(0), &stop, || {
            calls += 1;
            Ok(report(1, 1, SyncHealth::InSync))
        });
        assert_eq!(calls, 0);
        assert_eq!(summary.checks, 0);
        assert!(summary.last.is_none());
    }
}
