// backuptool/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_LOG_LEVEL: &str = "info";

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonGlobalConfig {
    pub tmp_dir: Option<PathBuf>,
    #[serde(default)]
    pub archive: bool,
    pub concurrency: Option<usize>,
    pub log_file: Option<PathBuf>,
    pub log_level: Option<String>,
    pub run_timeout_secs: Option<u64>,
    pub local_backup_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonWebSite {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonWebSiteConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub list: Vec<JsonWebSite>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonDatabaseConfig {
    #[serde(default)]
    pub enable: bool,
    pub url: Option<String>,
    #[serde(default)]
    pub database_list: Vec<String>,
    pub tables: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    #[serde(default)]
    pub global: JsonGlobalConfig,
    #[serde(default)]
    pub web_site: JsonWebSiteConfig,
    #[serde(default)]
    pub database: JsonDatabaseConfig,
    pub s3_storage: Option<JsonS3StorageConfig>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct SpacesConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSite {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DatabaseBackupConfig {
    pub url: String,
    pub databases: Vec<String>,
    pub tables: Option<Vec<String>>,
}

/// Where transferred artifacts end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationConfig {
    Spaces,
    LocalDir(PathBuf),
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub tmp_dir: PathBuf,
    pub archive: bool,
    pub concurrency: NonZeroUsize,
    pub run_timeout: Option<Duration>,
    pub destination: DestinationConfig,
    pub web_sites: Option<Vec<WebSite>>,
    pub database: Option<DatabaseBackupConfig>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub spaces_config: Option<SpacesConfig>,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub raw_json_config: RawJsonConfig,
    /// Problems found while loading; logged once logging is up.
    pub warnings: Vec<String>,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        Self::from_json_str(&config_content).with_context(|| {
            format!(
                "Failed to parse JSON from config file at {}",
                config_path.display()
            )
        })
    }

    pub fn from_json_str(config_content: &str) -> Result<Self> {
        let raw_json_config: RawJsonConfig = serde_json::from_str(config_content)?;
        let mut warnings = Vec::new();

        let spaces_config = raw_json_config.s3_storage.as_ref().and_then(|s3_raw| {
            if let (
                Some(bucket),
                Some(region),
                Some(key_id),
                Some(secret),
                Some(endpoint),
            ) = (
                s3_raw.bucket_name.as_ref().filter(|s| !s.is_empty()),
                s3_raw.region.as_ref().filter(|s| !s.is_empty()),
                s3_raw.access_key_id.as_ref().filter(|s| !s.is_empty()),
                s3_raw.secret_access_key.as_ref().filter(|s| !s.is_empty()),
                s3_raw.endpoint_url.as_ref().filter(|s| !s.is_empty()),
            ) {
                Some(SpacesConfig {
                    bucket_name: bucket.clone(),
                    region: region.clone(),
                    access_key_id: key_id.clone(),
                    secret_access_key: secret.clone(),
                    endpoint_url: endpoint.clone(),
                    folder_prefix: s3_raw
                        .folder_prefix
                        .as_deref()
                        .map(|s| s.trim_matches('/').to_string())
                        .filter(|s| !s.is_empty()),
                })
            } else {
                if s3_raw.bucket_name.is_some()
                    || s3_raw.region.is_some()
                    || s3_raw.access_key_id.is_some()
                    || s3_raw.secret_access_key.is_some()
                    || s3_raw.endpoint_url.is_some()
                {
                    warnings.push(
                        "s3_storage is present but some required fields (bucket_name, region, access_key_id, secret_access_key, endpoint_url) are missing or empty; S3 uploads are disabled"
                            .to_string(),
                    );
                }
                None
            }
        });

        Ok(AppConfig {
            spaces_config,
            log_level: raw_json_config
                .global
                .log_level
                .clone()
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            log_file: raw_json_config.global.log_file.clone(),
            raw_json_config,
            warnings,
        })
    }
}

pub fn load_backup_config(
    raw_config: &RawJsonConfig,
    spaces_is_configured: bool,
) -> Result<BackupConfig> {
    let global = &raw_config.global;

    let concurrency = NonZeroUsize::new(global.concurrency.unwrap_or(DEFAULT_CONCURRENCY))
        .context("global.concurrency must be at least 1")?;

    let destination = if spaces_is_configured {
        DestinationConfig::Spaces
    } else {
        match &global.local_backup_dir {
            Some(dir) if !dir.as_os_str().is_empty() => DestinationConfig::LocalDir(dir.clone()),
            _ => anyhow::bail!(
                "Neither s3_storage nor global.local_backup_dir is configured; there is nowhere to send backups."
            ),
        }
    };

    let tmp_dir = global
        .tmp_dir
        .clone()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(std::env::temp_dir);

    let web_sites = if raw_config.web_site.enable {
        Some(parse_web_sites(&raw_config.web_site.list)?)
    } else {
        None
    };

    let database = if raw_config.database.enable {
        Some(parse_database_config(&raw_config.database)?)
    } else {
        None
    };

    Ok(BackupConfig {
        tmp_dir,
        archive: global.archive,
        concurrency,
        run_timeout: global
            .run_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs),
        destination,
        web_sites,
        database,
    })
}

fn parse_web_sites(list: &[JsonWebSite]) -> Result<Vec<WebSite>> {
    let mut seen = HashSet::new();
    let mut sites = Vec::with_capacity(list.len());
    for site in list {
        let name = site.name.trim();
        if name.is_empty() || name.contains('/') || name.contains('\\') {
            anyhow::bail!("Invalid web_site name {:?}: must be non-empty and contain no path separators", site.name);
        }
        if site.path.as_os_str().is_empty() {
            anyhow::bail!("web_site {} has an empty path", name);
        }
        if !seen.insert(name.to_string()) {
            anyhow::bail!("Duplicate web_site name {}: destination keys would collide", name);
        }
        sites.push(WebSite {
            name: name.to_string(),
            path: site.path.clone(),
        });
    }
    Ok(sites)
}

fn parse_database_config(raw: &JsonDatabaseConfig) -> Result<DatabaseBackupConfig> {
    let url = raw
        .url
        .as_ref()
        .filter(|u| !u.trim().is_empty())
        .context("database.url must be set in config.json when database backup is enabled")?
        .clone();

    if raw.database_list.iter().any(|name| !is_valid_identifier(name)) {
        anyhow::bail!(
            "Invalid character in database_list: {:?}. Names may only contain letters, digits, '_' and '-'.",
            raw.database_list
        );
    }

    if let Some(tables) = &raw.tables {
        if tables.iter().any(|name| !is_valid_identifier(name)) {
            anyhow::bail!(
                "Invalid character in database.tables: {:?}. Names may only contain letters, digits, '_' and '-'.",
                tables
            );
        }
    }

    Ok(DatabaseBackupConfig {
        url,
        databases: raw.database_list.clone(),
        tables: raw.tables.clone(),
    })
}

/// Database and table names end up in file names and dump command arguments.
pub fn is_valid_identifier(name: &str) -> bool {
    !name.trim().is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-')
}
