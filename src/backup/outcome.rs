// backuptool/src/backup/outcome.rs
use chrono::{DateTime, Local};
use std::time::Duration;

use crate::backup::pool::UnitReport;
use crate::backup::units::BackupUnit;
use crate::errors::{AppError, FailureKind, Result};

#[derive(Debug)]
pub struct UnitFailure {
    pub unit: BackupUnit,
    pub kind: FailureKind,
    pub error: AppError,
}

/// Result of one run, built once every unit has reported.
#[derive(Debug)]
pub struct RunOutcome {
    pub run: String,
    pub attempted: usize,
    pub succeeded: usize,
    /// Sorted by unit sequence, not by completion order.
    pub failures: Vec<UnitFailure>,
    pub started_at: DateTime<Local>,
    pub elapsed: Duration,
}

impl RunOutcome {
    pub fn from_reports(
        run: impl Into<String>,
        reports: Vec<UnitReport>,
        started_at: DateTime<Local>,
        elapsed: Duration,
    ) -> Self {
        let attempted = reports.len();
        let mut failures: Vec<UnitFailure> = reports
            .into_iter()
            .filter_map(|report| match report.result {
                Ok(()) => None,
                Err(error) => Some(UnitFailure {
                    kind: error.kind(),
                    unit: report.unit,
                    error,
                }),
            })
            .collect();
        failures.sort_by_key(|f| f.unit.sequence);

        Self {
            run: run.into(),
            attempted,
            succeeded: attempted - failures.len(),
            failures,
            started_at,
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn first_failure(&self) -> Option<&UnitFailure> {
        self.failures.first()
    }

    /// `Ok` when no unit failed, otherwise the count plus the first failure.
    pub fn check(&self) -> Result<()> {
        match self.first_failure() {
            None => Ok(()),
            Some(first) => Err(AppError::PartialFailure {
                attempted: self.attempted,
                failed: self.failures.len(),
                first: format!("{} ({}): {}", first.unit, first.kind, first.error),
            }),
        }
    }

    pub fn log_summary(&self) {
        let elapsed_ms = self.elapsed.as_millis() as u64;
        let started_at = self.started_at.format("%Y-%m-%d %H:%M:%S").to_string();
        if self.is_success() {
            tracing::info!(
                run = %self.run,
                started_at = %started_at,
                attempted = self.attempted,
                succeeded = self.succeeded,
                elapsed_ms,
                "run complete"
            );
            return;
        }
        for failure in &self.failures {
            tracing::warn!(
                run = %self.run,
                unit = %failure.unit,
                kind = %failure.kind,
                error = %failure.error,
                "unit failure"
            );
        }
        tracing::error!(
            run = %self.run,
            started_at = %started_at,
            attempted = self.attempted,
            succeeded = self.succeeded,
            failed = self.failures.len(),
            elapsed_ms,
            "run finished with failures"
        );
    }
}
