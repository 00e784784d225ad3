//! Durable artifact placement.
//!
//! Artifacts are stored under a date-partitioned layout:
//! `<base_dir>/<yyyyMMdd>/<name>`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tracing::debug;

use crate::Result;

/// Blob store contract used by the orchestrator to persist outputs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Copy `reader` to durable storage under `name` and return the stored path.
    async fn store(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        name: &str,
    ) -> Result<String>;

    /// Copy a local file to durable storage under `name`.
    async fn store_file(&self, path: &Path, name: &str) -> Result<String> {
        let mut file = tokio::fs::File::open(path).await?;
        self.store(&mut file, name).await
    }
}

/// Local filesystem blob store.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    base_dir: PathBuf,
}

impl LocalBlobStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Directory for today's partition.
    fn partition_dir(&self) -> PathBuf {
        let day = chrono::Local::now().format("%Y%m%d").to_string();
        self.base_dir.join(day)
    }
}

/// Reject names that would escape the partition directory.
fn validate_name(name: &str) -> Result<()> {
    let path = Path::new(name);
    let is_plain = path.components().count() == 1
        && matches!(
            path.components().next(),
            Some(std::path::Component::Normal(_))
        );
    if name.is_empty() || !is_plain {
        return Err(crate::Error::validation(format!(
            "Invalid blob name: {:?}",
            name
        )));
    }
    Ok(())
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn store(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        name: &str,
    ) -> Result<String> {
        validate_name(name)?;
        let dir = self.partition_dir();
        tokio::fs::create_dir_all(&dir).await?;

        let target = dir.join(name);
        let mut file = tokio::fs::File::create(&target).await?;
        let written = tokio::io::copy(reader, &mut file).await?;
        file.sync_all().await?;

        debug!(path = %target.display(), bytes = written, "Stored blob");
        Ok(target.to_string_lossy().into_owned())
    }
}
