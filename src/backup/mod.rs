pub(crate) mod archive;
pub(crate) mod db_dump;
mod logic;
pub(crate) mod outcome;
pub(crate) mod pool;
pub(crate) mod s3_upload;
pub(crate) mod sink;
pub(crate) mod units;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, load_backup_config};

/// Public entry point for the backup process.
///
/// Every enabled database and web site becomes one run; runs execute one after
/// another and share the same sink and database connection.
pub async fn run_backup_flow(app_config: &AppConfig, cancel: CancellationToken) -> Result<()> {
    let backup_config = load_backup_config(
        &app_config.raw_json_config,
        app_config.spaces_config.is_some(),
    )
    .context("Failed to load backup configuration from JSON")?;

    let timeout_guard = backup_config.run_timeout.map(|limit| {
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(limit) => {
                    tracing::warn!(timeout_secs = limit.as_secs(), "run timeout reached, cancelling");
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        })
    });

    let result = logic::perform_backup_orchestration(app_config, &backup_config, &cancel).await;

    if let Some(handle) = timeout_guard {
        handle.abort();
    }
    result
}
