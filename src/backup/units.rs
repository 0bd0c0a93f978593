// backuptool/src/backup/units.rs
use std::collections::HashSet;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::backup::archive::archive_name;
use crate::backup::db_dump::{DatabaseSource, DumpKind};
use crate::backup::sink::TransferTarget;
use crate::errors::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    SchemaDump,
    DataDump,
    FileUpload,
    DirectoryArchiveUpload,
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnitKind::SchemaDump => "schema-dump",
            UnitKind::DataDump => "data-dump",
            UnitKind::FileUpload => "file-upload",
            UnitKind::DirectoryArchiveUpload => "directory-archive-upload",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceRef {
    Table { database: String, table: String },
    Path(PathBuf),
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRef::Table { database, table } => write!(f, "{}.{}", database, table),
            SourceRef::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// One independent piece of work. Immutable once enumerated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackupUnit {
    pub kind: UnitKind,
    pub source: SourceRef,
    pub target: TransferTarget,
    /// Position in enumeration order, unique within a run.
    pub sequence: usize,
}

impl fmt::Display for BackupUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} {}", self.sequence, self.kind, self.source)
    }
}

/// What a run backs up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunTarget {
    Database {
        name: String,
        /// Only these tables when set; all base tables otherwise.
        tables: Option<Vec<String>>,
    },
    Directory {
        name: String,
        root: PathBuf,
    },
}

impl RunTarget {
    pub fn name(&self) -> &str {
        match self {
            RunTarget::Database { name, .. } | RunTarget::Directory { name, .. } => name,
        }
    }
}

/// Destination of every transfer in a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub container: String,
    pub prefix: Option<String>,
}

impl Destination {
    fn target(&self, key: String) -> TransferTarget {
        let key = match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, key),
            None => key,
        };
        TransferTarget::new(self.container.clone(), key)
    }
}

/// Parameters of one backup invocation, owned by the coordinator for the run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub target: RunTarget,
    pub concurrency: NonZeroUsize,
    /// Directory targets only: one compressed bundle instead of per-file uploads.
    pub archive: bool,
    pub destination: Destination,
}

/// Expands a request into its ordered unit set.
///
/// Order is deterministic for a given source state: tables sorted by name with the
/// schema unit before the data unit, files in file-name walk order.
pub async fn enumerate(request: &RunRequest, database: Option<&dyn DatabaseSource>) -> Result<Vec<BackupUnit>> {
    let units = match &request.target {
        RunTarget::Database { name, tables } => {
            let source = database.ok_or_else(|| {
                AppError::Enumeration(format!("No database connection available for {}", name))
            })?;
            source.ping().await.map_err(|e| {
                AppError::Enumeration(format!("Cannot reach database server for {}: {}", name, e))
            })?;
            let live = source.list_tables(name).await.map_err(|e| match e {
                AppError::Enumeration(msg) => AppError::Enumeration(msg),
                other => AppError::Enumeration(format!("Failed to list tables of {}: {}", name, other)),
            })?;
            let selected = select_tables(name, live, tables.as_deref());
            table_units(name, &selected, &request.destination)
        }
        RunTarget::Directory { name, root } => {
            let meta = std::fs::metadata(root).map_err(|e| {
                AppError::Enumeration(format!("Cannot stat source directory {}: {}", root.display(), e))
            })?;
            if !meta.is_dir() {
                return Err(AppError::Enumeration(format!(
                    "Source path is not a directory: {}",
                    root.display()
                )));
            }
            if request.archive {
                vec![archive_unit(name, root, &request.destination)]
            } else {
                file_units(name, root, &request.destination)?
            }
        }
    };
    Ok(units)
}

fn select_tables(database: &str, mut live: Vec<String>, filter: Option<&[String]>) -> Vec<String> {
    live.sort();
    live.dedup();
    let Some(filter) = filter else {
        return live;
    };
    let wanted: HashSet<&str> = filter.iter().map(String::as_str).collect();
    for name in &wanted {
        if live.binary_search_by(|t| t.as_str().cmp(*name)).is_err() {
            tracing::warn!(database, table = %name, "requested table does not exist, skipping");
        }
    }
    live.into_iter().filter(|t| wanted.contains(t.as_str())).collect()
}

/// Two units per table, schema then data.
pub fn table_units(database: &str, tables: &[String], destination: &Destination) -> Vec<BackupUnit> {
    let mut units = Vec::with_capacity(tables.len() * 2);
    for table in tables {
        for (kind, dump) in [
            (UnitKind::SchemaDump, DumpKind::Schema),
            (UnitKind::DataDump, DumpKind::Data),
        ] {
            let file_name = format!("{}_{}_{}.sql", database, table, dump.as_str());
            units.push(BackupUnit {
                kind,
                source: SourceRef::Table {
                    database: database.to_string(),
                    table: table.clone(),
                },
                target: destination.target(format!("{}/{}", database, file_name)),
                sequence: units.len(),
            });
        }
    }
    units
}

pub fn archive_unit(site: &str, root: &Path, destination: &Destination) -> BackupUnit {
    BackupUnit {
        kind: UnitKind::DirectoryArchiveUpload,
        source: SourceRef::Path(root.to_path_buf()),
        target: destination.target(format!("{}_archive.tar.gz", site)),
        sequence: 0,
    }
}

/// One unit per regular file under `root`. Directories are implied by the keys.
pub fn file_units(site: &str, root: &Path, destination: &Destination) -> Result<Vec<BackupUnit>> {
    let mut units = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            AppError::Enumeration(format!("Failed to walk {}: {}", root.display(), e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = archive_name(root, entry.path()) else {
            continue;
        };
        units.push(BackupUnit {
            kind: UnitKind::FileUpload,
            source: SourceRef::Path(entry.path().to_path_buf()),
            target: destination.target(format!("{}/{}", site, rel)),
            sequence: units.len(),
        });
    }
    Ok(units)
}
