//! Concurrent read/update traffic against both stores.
//!
//! Exercises the stores the way unrelated clients would while a load or sync
//! runs: field-preserving primary updates, primary aggregations and secondary
//! aggregations. None of it changes key membership or window contents. Every
//! worker owns its own connection and all workers are joined before the run
//! reports.

use std::time::{Duration, Instant};

use duckdb::Connection;
use nyc311_database::{DbError, primary};
use nyc311_document_store::{DocumentStore, StoreError};
use nyc311_request_models::Borough;

const BOROUGHS: [Borough; 5] = [
    Borough::Manhattan,
    Borough::Brooklyn,
    Borough::Queens,
    Borough::Bronx,
    Borough::StatenIsland,
];

#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    #[error("Primary store error: {0}")]
    Primary(#[from] DbError),

    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("Secondary store error: {0}")]
    Secondary(#[from] StoreError),

    #[error("Worker {worker} panicked")]
    WorkerPanicked { worker: usize },
}

/// Opens a fresh secondary-store handle for one worker.
pub type StoreFactory<'a> = dyn Fn() -> Result<Box<dyn DocumentStore>, StoreError> + Sync + 'a;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadOptions {
    pub workers: usize,
    /// Operations per worker.
    pub rounds: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkloadReport {
    pub primary_updates: u64,
    pub primary_reads: u64,
    pub secondary_reads: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy)]
enum Role {
    PrimaryUpdate { ordinal: usize, updaters: usize },
    PrimaryRead,
    SecondaryRead,
}

impl Role {
    /// Workers rotate through the three roles.
    const fn for_worker(worker: usize, workers: usize) -> Self {
        match worker % 3 {
            0 => Self::PrimaryUpdate {
                ordinal: worker / 3,
                updaters: workers.div_ceil(3),
            },
            1 => Self::PrimaryRead,
            _ => Self::SecondaryRead,
        }
    }
}

fn run_worker(
    role: Role,
    worker: usize,
    conn: &Connection,
    stores: &StoreFactory<'_>,
    rounds: usize,
) -> Result<WorkloadReport, WorkloadError> {
    let mut tally = WorkloadReport::default();

    match role {
        Role::PrimaryUpdate { ordinal, updaters } => {
            // Updaters own disjoint boroughs so their writes never touch the same rows.
            let owned: Vec<Borough> = BOROUGHS
                .iter()
                .enumerate()
                .filter(|(i, _)| i % updaters == ordinal)
                .map(|(_, b)| *b)
                .collect();
            for borough in owned.iter().cycle().take(rounds) {
                primary::touch_borough(conn, *borough)?;
                tally.primary_updates += 1;
            }
        }
        Role::PrimaryRead => {
            for _ in 0..rounds {
                primary::borough_counts(conn)?;
                tally.primary_reads += 1;
            }
        }
        Role::SecondaryRead => {
            let store = stores()?;
            for _ in 0..rounds {
                store.borough_counts()?;
                tally.secondary_reads += 1;
            }
        }
    }

    log::debug!("Worker {worker} ({role:?}) finished {rounds} operations");
    Ok(tally)
}

/// Runs `options.workers` workers to completion.
///
/// Primary workers get their own connection via [`Connection::try_clone`];
/// secondary workers open their own store through `stores`.
///
/// # Errors
///
/// Returns the first worker error, or [`WorkloadError::WorkerPanicked`].
pub fn run(
    conn: &Connection,
    stores: &StoreFactory<'_>,
    options: WorkloadOptions,
) -> Result<WorkloadReport, WorkloadError> {
    let start = Instant::now();
    let connections = (0..options.workers)
        .map(|_| conn.try_clone())
        .collect::<Result<Vec<_>, _>>()?;

    let results: Vec<Result<WorkloadReport, WorkloadError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = connections
            .into_iter()
            .enumerate()
            .map(|(worker, worker_conn)| {
                scope.spawn(move || {
                    run_worker(
                        Role::for_worker(worker, options.workers),
                        worker,
                        &worker_conn,
                        stores,
                        options.rounds,
                    )
                })
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(worker, handle)| {
                handle
                    .join()
                    .unwrap_or(Err(WorkloadError::WorkerPanicked { worker }))
            })
            .collect()
    });

    let mut report = WorkloadReport::default();
    for result in results {
        let tally = result?;
        report.primary_updates += tally.primary_updates;
        report.primary_reads += tally.primary_reads;
        report.secondary_reads += tally.secondary_reads;
    }
    report.elapsed = start.elapsed();

    log::info!(
        "Workload done in {:.2}s: {} primary updates, {} primary reads, {} secondary reads",
        report.elapsed.as_secs_f64(),
        report.primary_updates,
        report.primary_reads,
        report.secondary_reads,
    );
    Ok(report)
}
