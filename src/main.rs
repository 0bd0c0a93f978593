//! Backup Tool
//!
//! Dumps MySQL tables and web site directories to S3-compatible storage or a
//! local directory through a bounded worker pool.

// backuptool/src/main.rs
mod backup;
mod config;
mod errors;
mod logging;
mod utils;

use anyhow::{Context, Result};
use config::AppConfig;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    match run_app().await {
        Ok(_) => {
            println!("✅ Backup completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let config_path = config_path_from_args(env::args().skip(1))?;
    let app_config = AppConfig::load_from_json(&config_path).context(format!(
        "Failed to load application configuration from {}",
        config_path.display()
    ))?;

    logging::init(&app_config.log_level, app_config.log_file.as_deref())
        .context("Failed to initialise logging")?;
    for warning in &app_config.warnings {
        tracing::warn!(config = %config_path.display(), "{}", warning);
    }
    tracing::info!(config = %config_path.display(), "starting backup");

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling outstanding units");
            on_signal.cancel();
        }
    });

    backup::run_backup_flow(&app_config, cancel)
        .await
        .context("Backup process failed")
}

/// Accepts `-f <path>`, `--config <path>` or a bare path; defaults to `config.json`.
fn config_path_from_args(mut args: impl Iterator<Item = String>) -> Result<PathBuf> {
    match args.next() {
        None => Ok(PathBuf::from(DEFAULT_CONFIG_PATH)),
        Some(flag) if flag == "-f" || flag == "--config" => args
            .next()
            .map(PathBuf::from)
            .with_context(|| format!("{} requires a path argument", flag)),
        Some(path) => Ok(PathBuf::from(path)),
    }
}
