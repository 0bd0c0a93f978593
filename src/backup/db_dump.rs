// backuptool/src/backup/db_dump.rs
use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::Row;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use percent_encoding::percent_decode_str;
use url::Url;

use crate::errors::{AppError, Result};
use crate::utils::find_mysqldump_executable;

const DEFAULT_MYSQL_PORT: u16 = 3306;
const POOL_MAX_CONNECTIONS: u32 = 4;

/// Which half of a table a dump produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DumpKind {
    Schema,
    Data,
}

impl DumpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DumpKind::Schema => "schema",
            DumpKind::Data => "data",
        }
    }
}

/// Database operations a backup run needs. Shared by all workers of a run.
#[async_trait]
pub trait DatabaseSource: Send + Sync {
    /// Cheap connectivity check.
    async fn ping(&self) -> Result<()>;

    /// Base tables of `database`, sorted by name.
    async fn list_tables(&self, database: &str) -> Result<Vec<String>>;

    /// Writes a completed dump of one table half to `output`.
    async fn dump_table(&self, database: &str, table: &str, kind: DumpKind, output: &Path) -> Result<()>;

    async fn dump_schema(&self, database: &str, table: &str, output: &Path) -> Result<()> {
        self.dump_table(database, table, DumpKind::Schema, output).await
    }

    async fn dump_data(&self, database: &str, table: &str, output: &Path) -> Result<()> {
        self.dump_table(database, table, DumpKind::Data, output).await
    }
}

/// Connection parameters passed to `mysqldump`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MySqlParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    /// Server URL with any database path stripped.
    pub base_url: String,
}

impl MySqlParams {
    pub fn from_url(full_url: &str) -> Result<Self> {
        let mut parsed = Url::parse(full_url)?;
        if parsed.scheme() != "mysql" {
            return Err(AppError::Config(format!(
                "Database URL must start with mysql://, got scheme {}",
                parsed.scheme()
            )));
        }
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| AppError::Config("Database URL is missing a host".to_string()))?
            .to_string();
        let port = parsed.port().unwrap_or(DEFAULT_MYSQL_PORT);
        // `Url` keeps userinfo percent-encoded; mysqldump needs the literal values.
        let user = decode_userinfo(parsed.username(), "user name")?;
        if user.is_empty() {
            return Err(AppError::Config("Database URL is missing a user name".to_string()));
        }
        let password = parsed
            .password()
            .map(|p| decode_userinfo(p, "password"))
            .transpose()?;

        parsed.set_path("");
        let base_url = parsed.as_str().trim_end_matches('/').to_string();

        Ok(Self {
            host,
            port,
            user,
            password,
            base_url,
        })
    }

    /// `mysqldump` arguments for one table half. The password travels in `MYSQL_PWD`.
    pub fn dump_args(&self, database: &str, table: &str, kind: DumpKind, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            format!("--host={}", self.host).into(),
            format!("--port={}", self.port).into(),
            format!("--user={}", self.user).into(),
        ];
        match kind {
            DumpKind::Schema => {
                args.push("--no-data".into());
                args.push("--add-drop-table".into());
                args.push("--skip-triggers".into());
            }
            DumpKind::Data => {
                // mysqldump already emits SET FOREIGN_KEY_CHECKS=0 in its header.
                args.push("--no-create-info".into());
                args.push("--single-transaction".into());
                args.push("--skip-triggers".into());
            }
        }
        let mut result_file = OsString::from("--result-file=");
        result_file.push(output.as_os_str());
        args.push(result_file);
        args.push(database.into());
        args.push(table.into());
        args
    }
}

fn decode_userinfo(raw: &str, what: &str) -> Result<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|e| AppError::Config(format!("Database URL {} is not valid UTF-8: {}", what, e)))
}

/// MySQL source: `SHOW FULL TABLES` over a shared pool, dumps through `mysqldump`.
pub struct MySqlSource {
    pool: MySqlPool,
    params: MySqlParams,
    mysqldump_path: PathBuf,
}

impl MySqlSource {
    pub fn connect(url: &str) -> Result<Self> {
        let params = MySqlParams::from_url(url)?;
        let mysqldump_path = find_mysqldump_executable()?;
        tracing::info!(path = %mysqldump_path.display(), "found mysqldump executable");

        let pool = MySqlPoolOptions::new()
            .max_connections(POOL_MAX_CONNECTIONS)
            .connect_lazy(&params.base_url)?;

        Ok(Self {
            pool,
            params,
            mysqldump_path,
        })
    }
}

#[async_trait]
impl DatabaseSource for MySqlSource {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        tracing::info!(host = %self.params.host, port = self.params.port, "connected to database server");
        Ok(())
    }

    async fn list_tables(&self, database: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(&format!(
            "SHOW FULL TABLES FROM `{}` WHERE Table_type = 'BASE TABLE'",
            database
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Enumeration(format!("Failed to list tables of {}: {}", database, e)))?;

        let mut tables = rows
            .iter()
            .map(|row| {
                row.try_get::<Vec<u8>, _>(0)
                    .map(|raw| String::from_utf8_lossy(&raw).into_owned())
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| {
                AppError::Enumeration(format!("Failed to read table name of {}: {}", database, e))
            })?;
        tables.sort();
        Ok(tables)
    }

    async fn dump_table(&self, database: &str, table: &str, kind: DumpKind, output: &Path) -> Result<()> {
        let mut command = Command::new(&self.mysqldump_path);
        command
            .args(self.params.dump_args(database, table, kind, output))
            .kill_on_drop(true);
        if let Some(password) = &self.params.password {
            command.env("MYSQL_PWD", password);
        }

        let output_status = command.output().await.map_err(|e| {
            AppError::UnitIo(format!(
                "Failed to execute mysqldump ({}) for {}.{}: {}",
                kind.as_str(),
                database,
                table,
                e
            ))
        })?;

        if !output_status.status.success() {
            return Err(AppError::Command {
                stdout: String::from_utf8_lossy(&output_status.stdout).into_owned(),
                stderr: format!(
                    "mysqldump ({}) for {}.{} failed with status {}: {}",
                    kind.as_str(),
                    database,
                    table,
                    output_status.status,
                    String::from_utf8_lossy(&output_status.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}
