// backuptool/src/backup/s3_upload.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::error::DisplayErrorContext;
use s3::primitives::{ByteStream, Length};
use tokio::fs::File;

use crate::backup::sink::{TransferSink, TransferTarget};
use crate::config::SpacesConfig;
use crate::errors::{AppError, Result};

/// Uploads to an S3-compatible object storage service (like DigitalOcean Spaces).
///
/// One client is built per process and shared by all workers.
#[derive(Clone)]
pub struct S3Sink {
    client: s3::Client,
    bucket_name: String,
    folder_prefix: Option<String>,
}

impl S3Sink {
    pub async fn connect(spaces_config: &SpacesConfig) -> Self {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&spaces_config.endpoint_url)
            .region(Region::new(spaces_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &spaces_config.access_key_id,
                &spaces_config.secret_access_key,
                None, // session_token
                None, // expiry
                "Static", // provider_name
            ))
            .load()
            .await;

        // Path-style addressing keeps custom endpoints (MinIO, Spaces) working
        // without per-bucket DNS.
        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        Self {
            client: s3::Client::from_conf(s3_config),
            bucket_name: spaces_config.bucket_name.clone(),
            folder_prefix: spaces_config.folder_prefix.clone(),
        }
    }

    /// HEAD request on the target bucket. Callers decide whether a failure is fatal.
    pub async fn check_bucket(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket_name)
            .send()
            .await
            .map_err(|e| {
                AppError::Transfer(format!(
                    "Could not access bucket {}: {}",
                    self.bucket_name,
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }
}

#[async_trait]
impl TransferSink for S3Sink {
    async fn send(&self, source: File, size: u64, target: &TransferTarget) -> Result<()> {
        tracing::debug!(bucket = %target.container, key = %target.key, bytes = size, "put object");

        let body = ByteStream::read_from()
            .file(source)
            .length(Length::Exact(size))
            .build()
            .await
            .map_err(|e| {
                AppError::UnitIo(format!("Failed to open upload stream for {}: {}", target, e))
            })?;

        let content_length = i64::try_from(size).map_err(|_| {
            AppError::Transfer(format!("Object {} is too large to upload ({} bytes)", target, size))
        })?;

        self.client
            .put_object()
            .bucket(&target.container)
            .key(&target.key)
            .content_length(content_length)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                AppError::Transfer(format!(
                    "Failed to upload to S3 bucket {} with key {}: {}",
                    target.container,
                    target.key,
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(())
    }

    fn container(&self) -> String {
        self.bucket_name.clone()
    }

    fn key_prefix(&self) -> Option<&str> {
        self.folder_prefix.as_deref()
    }
}
