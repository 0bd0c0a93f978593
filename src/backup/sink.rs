// backuptool/src/backup/sink.rs
use async_trait::async_trait;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::errors::{AppError, Result};

/// Destination of a single transfer: a bucket or directory plus an object key.
///
/// Built once by the unit enumerator; sinks never rewrite it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferTarget {
    pub container: String,
    pub key: String,
}

impl TransferTarget {
    pub fn new(container: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for TransferTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.key)
    }
}

/// Delivers a byte stream of known length to a named destination.
///
/// Implementations are shared by every worker of a run and must not be
/// reconfigured while a run is in flight.
#[async_trait]
pub trait TransferSink: Send + Sync {
    /// Consumes exactly `size` bytes from `source` and stores them at `target`.
    async fn send(&self, source: File, size: u64, target: &TransferTarget) -> Result<()>;

    /// Container new targets should be addressed to.
    fn container(&self) -> String;

    /// Optional key prefix prepended to every key of a run.
    fn key_prefix(&self) -> Option<&str> {
        None
    }
}

/// Copies payloads below a local directory, `<root>/<key>`.
#[derive(Debug, Clone)]
pub struct LocalDirSink {
    root: PathBuf,
}

impl LocalDirSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, target: &TransferTarget) -> Result<PathBuf> {
        let key = Path::new(&target.key);
        if target.key.is_empty() || !key.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(AppError::Transfer(format!(
                "Refusing to write outside of {}: invalid key {:?}",
                target.container, target.key
            )));
        }
        Ok(Path::new(&target.container).join(key))
    }
}

#[async_trait]
impl TransferSink for LocalDirSink {
    async fn send(&self, source: File, size: u64, target: &TransferTarget) -> Result<()> {
        let dest = self.resolve(target)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                AppError::Transfer(format!(
                    "Failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let copied = copy_into(source, size, &dest).await;
        match copied {
            Ok(n) if n == size => {
                tracing::debug!(dest = %dest.display(), bytes = n, "local copy complete");
                Ok(())
            }
            Ok(n) => {
                let _ = fs::remove_file(&dest).await;
                Err(AppError::Transfer(format!(
                    "Short copy to {}: expected {} bytes, got {}",
                    dest.display(),
                    size,
                    n
                )))
            }
            Err(e) => {
                let _ = fs::remove_file(&dest).await;
                Err(AppError::Transfer(format!(
                    "Failed to copy to {}: {}",
                    dest.display(),
                    e
                )))
            }
        }
    }

    fn container(&self) -> String {
        self.root.to_string_lossy().into_owned()
    }
}

async fn copy_into(source: File, size: u64, dest: &Path) -> std::io::Result<u64> {
    let mut reader = source.take(size);
    let mut out = File::create(dest).await?;
    let n = tokio::io::copy(&mut reader, &mut out).await?;
    out.flush().await?;
    out.sync_all().await?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_with(dir: &Path, name: &str, contents: &[u8]) -> (File, u64) {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        let file = File::open(&path).await.unwrap();
        (file, contents.len() as u64)
    }

    #[tokio::test]
    async fn test_local_sink_creates_nested_key() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let sink = LocalDirSink::new(dst.path());

        let (file, size) = open_with(src.path(), "payload", b"hello backup").await;
        let target = TransferTarget::new(sink.container(), "blog/css/site.css");
        sink.send(file, size, &target).await.unwrap();

        let written = std::fs::read(dst.path().join("blog/css/site.css")).unwrap();
        assert_eq!(written, b"hello backup");
    }

    #[tokio::test]
    async fn test_local_sink_overwrites_existing_key() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let sink = LocalDirSink::new(dst.path());
        let target = TransferTarget::new(sink.container(), "shop/shop_orders_data.sql");

        let (first, size) = open_with(src.path(), "a", b"first run, longer payload").await;
        sink.send(first, size, &target).await.unwrap();
        let (second, size) = open_with(src.path(), "b", b"second").await;
        sink.send(second, size, &target).await.unwrap();

        let written = std::fs::read(dst.path().join("shop/shop_orders_data.sql")).unwrap();
        assert_eq!(written, b"second");
    }

    #[tokio::test]
    async fn test_local_sink_rejects_escaping_keys() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let sink = LocalDirSink::new(dst.path());

        for key in ["../evil", "/etc/passwd", ""] {
            let (file, size) = open_with(src.path(), "p", b"x").await;
            let err = sink
                .send(file, size, &TransferTarget::new(sink.container(), key))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), crate::errors::FailureKind::Transfer);
        }
    }

    #[tokio::test]
    async fn test_short_source_is_a_transfer_failure() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let sink = LocalDirSink::new(dst.path());

        let (file, _) = open_with(src.path(), "p", b"abc").await;
        let target = TransferTarget::new(sink.container(), "short.bin");
        let err = sink.send(file, 10, &target).await.unwrap_err();
        assert_eq!(err.kind(), crate::errors::FailureKind::Transfer);
        assert!(!dst.path().join("short.bin").exists());
    }
}
