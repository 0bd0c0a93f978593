// backuptool/src/backup/logic.rs
use anyhow::Context;
use chrono::Local;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::Builder as TempFileBuilder;
use tokio::fs::File;
use tokio_util::sync::CancellationToken;

use crate::backup::archive::write_tar_gz;
use crate::backup::db_dump::{DatabaseSource, MySqlSource};
use crate::backup::outcome::RunOutcome;
use crate::backup::pool;
use crate::backup::s3_upload::S3Sink;
use crate::backup::sink::{LocalDirSink, TransferSink, TransferTarget};
use crate::backup::units::{
    BackupUnit, Destination, RunRequest, RunTarget, SourceRef, UnitKind, enumerate,
};
use crate::config::{AppConfig, BackupConfig, DestinationConfig};
use crate::errors::{AppError, Result};

/// Owns the execution of runs against one set of shared clients.
///
/// The database source and the sink are built once per process and handed to
/// every worker; nothing here mutates them.
pub struct RunCoordinator {
    database: Option<Arc<dyn DatabaseSource>>,
    sink: Arc<dyn TransferSink>,
    tmp_root: PathBuf,
}

impl RunCoordinator {
    pub fn new(
        database: Option<Arc<dyn DatabaseSource>>,
        sink: Arc<dyn TransferSink>,
        tmp_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            database,
            sink,
            tmp_root: tmp_root.into(),
        }
    }

    /// Destination every run of this coordinator writes to.
    pub fn destination(&self) -> Destination {
        Destination {
            container: self.sink.container(),
            prefix: self.sink.key_prefix().map(str::to_string),
        }
    }

    /// Enumerates, dispatches and aggregates one run.
    ///
    /// Returns `Err` only when the unit set cannot be discovered; unit failures
    /// are collected into the outcome and never stop the remaining units.
    pub async fn execute(&self, request: RunRequest, cancel: &CancellationToken) -> Result<RunOutcome> {
        let run_name = request.target.name().to_string();
        let started_at = Local::now();
        let started = Instant::now();

        let units = enumerate(&request, self.database.as_deref()).await?;
        tracing::info!(
            run = %run_name,
            units = units.len(),
            concurrency = request.concurrency.get(),
            "dispatching units"
        );

        std::fs::create_dir_all(&self.tmp_root).map_err(|e| {
            AppError::Enumeration(format!(
                "Cannot create temporary directory {}: {}",
                self.tmp_root.display(),
                e
            ))
        })?;
        // Removed when the run ends, whatever its units left behind.
        let run_dir = TempFileBuilder::new()
            .prefix(&format!("run_{}_{}_", run_name, std::process::id()))
            .tempdir_in(&self.tmp_root)
            .map_err(|e| {
                AppError::Enumeration(format!(
                    "Cannot create run directory under {}: {}",
                    self.tmp_root.display(),
                    e
                ))
            })?;

        let executor = Arc::new(UnitExecutor {
            database: self.database.clone(),
            sink: Arc::clone(&self.sink),
            work_dir: run_dir.path().to_path_buf(),
        });

        let reports = pool::run(units, request.concurrency, cancel.clone(), move |unit, token| {
            let executor = Arc::clone(&executor);
            async move { executor.run_unit(unit, token).await }
        })
        .await;

        drop(run_dir);
        let outcome = RunOutcome::from_reports(run_name, reports, started_at, started.elapsed());
        outcome.log_summary();
        Ok(outcome)
    }
}

/// Routes a unit to dump-and-stage, archive-and-send or direct send.
struct UnitExecutor {
    database: Option<Arc<dyn DatabaseSource>>,
    sink: Arc<dyn TransferSink>,
    work_dir: PathBuf,
}

impl UnitExecutor {
    async fn run_unit(&self, unit: BackupUnit, cancel: CancellationToken) -> Result<()> {
        match (&unit.kind, &unit.source) {
            (UnitKind::SchemaDump | UnitKind::DataDump, SourceRef::Table { database, table }) => {
                self.dump_and_send(&unit, database, table, &cancel).await
            }
            (UnitKind::FileUpload, SourceRef::Path(path)) => {
                self.send_path(path, &unit.target).await
            }
            (UnitKind::DirectoryArchiveUpload, SourceRef::Path(root)) => {
                self.archive_and_send(&unit, root, &cancel).await
            }
            _ => Err(AppError::UnitIo(format!(
                "{} has a source that does not match its kind",
                unit
            ))),
        }
    }

    async fn dump_and_send(
        &self,
        unit: &BackupUnit,
        database: &str,
        table: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let source = self.database.as_ref().ok_or_else(|| {
            AppError::UnitIo(format!("No database connection for {}", unit))
        })?;

        let kind = if unit.kind == UnitKind::SchemaDump { "schema" } else { "data" };
        let unit_dir = TempFileBuilder::new()
            .prefix(&format!("tmp_{}_{}_{}_", table, kind, std::process::id()))
            .tempdir_in(&self.work_dir)?;
        let dump_path = unit_dir.path().join(file_name_of(&unit.target));

        match unit.kind {
            UnitKind::SchemaDump => source.dump_schema(database, table, &dump_path).await?,
            _ => source.dump_data(database, table, &dump_path).await?,
        }

        if cancel.is_cancelled() {
            return Err(AppError::Cancelled(format!("{} staged but not sent", unit)));
        }
        self.send_path(&dump_path, &unit.target).await
    }

    async fn archive_and_send(
        &self,
        unit: &BackupUnit,
        root: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let site = unit.target.key.rsplit('/').next().unwrap_or("archive");
        let staged = TempFileBuilder::new()
            .prefix(&format!("tmp_{}_{}_", site.trim_end_matches(".tar.gz"), std::process::id()))
            .suffix(".tar.gz")
            .tempfile_in(&self.work_dir)
            .map_err(|e| AppError::Structural(format!("Cannot create archive file: {}", e)))?;
        let writer = staged
            .as_file()
            .try_clone()
            .map_err(|e| AppError::Structural(format!("Cannot open archive file: {}", e)))?;

        let root = root.to_path_buf();
        let token = cancel.clone();
        let written = tokio::task::spawn_blocking(move || write_tar_gz(&root, BufWriter::new(writer), &token))
            .await
            .map_err(|e| AppError::Structural(format!("Archive task failed: {}", e)))??;

        if cancel.is_cancelled() {
            return Err(AppError::Cancelled(format!("{} archived but not sent", unit)));
        }

        // The store needs the length up front, so the bundle is complete and
        // reopened at offset zero before the upload starts.
        let reader = staged
            .reopen()
            .map_err(|e| AppError::UnitIo(format!("Cannot reopen archive: {}", e)))?;
        let size = reader.metadata()?.len();
        if size != written {
            return Err(AppError::Structural(format!(
                "Archive size mismatch: wrote {} bytes, file has {}",
                written, size
            )));
        }
        tracing::info!(unit = %unit, bytes = size, "archive staged");
        self.sink.send(File::from_std(reader), size, &unit.target).await
    }

    async fn send_path(&self, path: &Path, target: &TransferTarget) -> Result<()> {
        let file = File::open(path).await.map_err(|e| {
            AppError::UnitIo(format!("Failed to open {}: {}", path.display(), e))
        })?;
        let size = file
            .metadata()
            .await
            .map_err(|e| AppError::UnitIo(format!("Failed to stat {}: {}", path.display(), e)))?
            .len();
        self.sink.send(file, size, target).await
    }
}

fn file_name_of(target: &TransferTarget) -> &str {
    target.key.rsplit('/').next().unwrap_or(&target.key)
}

/// Runs every enabled target, one run after another, against shared clients.
pub async fn perform_backup_orchestration(
    app_config: &AppConfig,
    backup_config: &BackupConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let sink: Arc<dyn TransferSink> = match (&backup_config.destination, &app_config.spaces_config) {
        (DestinationConfig::Spaces, Some(spaces)) => {
            let sink = S3Sink::connect(spaces).await;
            if let Err(e) = sink.check_bucket().await {
                // PutObject may still be allowed when HeadBucket is not.
                tracing::warn!(error = %e, "bucket check failed, continuing");
            }
            tracing::info!(bucket = %spaces.bucket_name, endpoint = %spaces.endpoint_url, "sending backups to S3");
            Arc::new(sink)
        }
        (DestinationConfig::Spaces, None) => {
            anyhow::bail!("S3 destination selected but s3_storage is not configured")
        }
        (DestinationConfig::LocalDir(dir), _) => {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create local backup directory {}", dir.display()))?;
            tracing::info!(dir = %dir.display(), "sending backups to local directory");
            Arc::new(LocalDirSink::new(dir))
        }
    };

    let database: Option<Arc<dyn DatabaseSource>> = match &backup_config.database {
        Some(db_config) => match MySqlSource::connect(&db_config.url) {
            Ok(source) => Some(Arc::new(source)),
            Err(e) => {
                // Each database run then fails enumeration; web sites still run.
                tracing::error!(error = %e, "database source unavailable");
                None
            }
        },
        None => None,
    };

    let coordinator = RunCoordinator::new(database, sink, &backup_config.tmp_dir);
    let destination = coordinator.destination();

    let mut requests = Vec::new();
    match &backup_config.database {
        Some(db_config) => {
            for name in &db_config.databases {
                requests.push(RunRequest {
                    target: RunTarget::Database {
                        name: name.clone(),
                        tables: db_config.tables.clone(),
                    },
                    concurrency: backup_config.concurrency,
                    archive: false,
                    destination: destination.clone(),
                });
            }
        }
        None => tracing::info!("database backup disabled"),
    }
    match &backup_config.web_sites {
        Some(sites) => {
            for site in sites {
                requests.push(RunRequest {
                    target: RunTarget::Directory {
                        name: site.name.clone(),
                        root: site.path.clone(),
                    },
                    concurrency: backup_config.concurrency,
                    archive: backup_config.archive,
                    destination: destination.clone(),
                });
            }
        }
        None => tracing::info!("web site backup disabled"),
    }

    if requests.is_empty() {
        tracing::warn!("nothing to back up: no databases or web sites enabled");
        return Ok(());
    }

    let total_runs = requests.len();
    let mut failed_runs: Vec<(String, AppError)> = Vec::new();
    for request in requests {
        let name = request.target.name().to_string();
        let result = coordinator
            .execute(request, cancel)
            .await
            .and_then(|outcome| outcome.check());
        if let Err(e) = result {
            tracing::error!(run = %name, kind = %e.kind(), error = %e, "backup run failed");
            failed_runs.push((name, e));
        }
    }

    let failed_count = failed_runs.len();
    match failed_runs.into_iter().next() {
        None => Ok(()),
        Some((name, first)) => Err(anyhow::Error::new(first).context(format!(
            "Backup run {} failed ({} of {} runs did not complete cleanly)",
            name, failed_count, total_runs
        ))),
    }
}
