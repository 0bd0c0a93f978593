// backuptool/src/backup/pool.rs
//! Fixed-size pool of executors draining a queue of backup units.
//!
//! Exactly `concurrency` executors pull from one shared queue, so a free
//! executor always picks up the next unclaimed unit and no more than
//! `concurrency` units are ever in flight. Each unit runs once, on one
//! executor, inside its own task so a panicking handler is reported as a
//! failure instead of taking the executor down with it. Reports are appended
//! to a shared list and handed back once every executor has drained.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backup::units::BackupUnit;
use crate::errors::{AppError, Result};

/// Outcome of one unit as reported by the executor that ran it.
#[derive(Debug)]
pub struct UnitReport {
    pub unit: BackupUnit,
    pub result: Result<()>,
}

type Reports = Arc<Mutex<Vec<UnitReport>>>;

fn push_report(reports: &Reports, report: UnitReport) {
    reports
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(report);
}

/// Runs every unit through `handler` with at most `concurrency` in flight.
///
/// Returns one report per submitted unit, in completion order. Once `cancel`
/// fires, units not yet started are reported as cancelled without running and
/// in-flight handlers are aborted.
pub async fn run<F, Fut>(
    units: Vec<BackupUnit>,
    concurrency: NonZeroUsize,
    cancel: CancellationToken,
    handler: F,
) -> Vec<UnitReport>
where
    F: Fn(BackupUnit, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let total = units.len();
    let workers = concurrency.get();
    let (tx, rx) = mpsc::channel::<BackupUnit>(workers);
    let rx_shared = Arc::new(AsyncMutex::new(rx));
    let reports: Reports = Arc::new(Mutex::new(Vec::with_capacity(total)));
    let handler = Arc::new(handler);

    let mut set = JoinSet::new();

    // Feeds the queue in submission order; blocks while all executors are busy.
    set.spawn(async move {
        for unit in units {
            if tx.send(unit).await.is_err() {
                break;
            }
        }
    });

    for idx in 0..workers {
        let rx_shared = Arc::clone(&rx_shared);
        let reports = Arc::clone(&reports);
        let handler = Arc::clone(&handler);
        let cancel = cancel.clone();
        set.spawn(async move {
            loop {
                let next = {
                    let mut rx = rx_shared.lock().await;
                    rx.recv().await
                };
                let Some(unit) = next else { break };

                if cancel.is_cancelled() {
                    tracing::warn!(worker = idx, unit = %unit, "run cancelled, unit not started");
                    let result = Err(AppError::Cancelled(format!("{} was not started", unit)));
                    push_report(&reports, UnitReport { unit, result });
                    continue;
                }

                let result = execute(idx, &unit, handler.as_ref(), &cancel).await;
                push_report(&reports, UnitReport { unit, result });
            }
        });
    }

    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "pool executor terminated abnormally");
        }
    }

    let reports = std::mem::take(&mut *reports.lock().unwrap_or_else(|p| p.into_inner()));
    debug_assert_eq!(reports.len(), total);
    reports
}

async fn execute<F, Fut>(idx: usize, unit: &BackupUnit, handler: &F, cancel: &CancellationToken) -> Result<()>
where
    F: Fn(BackupUnit, CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tracing::info!(worker = idx, unit = %unit, target = %unit.target, "unit started");
    let started = Instant::now();

    let mut task = tokio::spawn(handler(unit.clone(), cancel.clone()));
    let result = tokio::select! {
        biased;
        joined = &mut task => match joined {
            Ok(result) => result,
            Err(e) => Err(AppError::UnitIo(format!("{} panicked: {}", unit, e))),
        },
        _ = cancel.cancelled() => {
            task.abort();
            // Wait for the aborted handler to drop its temporaries.
            let _ = task.await;
            Err(AppError::Cancelled(format!("{} aborted in flight", unit)))
        }
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(()) => tracing::info!(worker = idx, unit = %unit, elapsed_ms, "unit succeeded"),
        Err(e) => tracing::error!(
            worker = idx,
            unit = %unit,
            kind = %e.kind(),
            error = %e,
            elapsed_ms,
            "unit failed"
        ),
    }
    result
}
