//! Blob byte storage behind the generation-versioned store.
//!
//! Bytes for each generation live under `generations/<n>` in a pluggable
//! `object_store` backend (memory, local filesystem, or S3-compatible).

use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use tracing::debug;

use crate::error::Result;

/// Where generation bytes are kept
#[derive(Debug, Clone)]
pub enum ObjectStoreConfig {
    /// Process memory; lost on drop
    Memory,
    /// A directory on the local filesystem
    Local { path: PathBuf },
    /// S3-compatible endpoint (MinIO, etc.)
    S3 {
        endpoint: String,
        access_key: String,
        secret_key: String,
        bucket: String,
        region: Option<String>,
    },
}

/// Thin wrapper addressing blob bytes by generation number
#[derive(Debug, Clone)]
pub struct Storage {
    inner: Arc<dyn ObjectStore>,
}

impl Storage {
    pub async fn new(config: ObjectStoreConfig) -> Result<Self> {
        let inner: Arc<dyn ObjectStore> = match config {
            ObjectStoreConfig::Memory => Arc::new(InMemory::new()),
            ObjectStoreConfig::Local { path } => {
                tokio::fs::create_dir_all(&path).await.map_err(|e| {
                    crate::BackendError::Protocol(format!(
                        "cannot create storage directory {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Arc::new(LocalFileSystem::new_with_prefix(&path)?)
            }
            ObjectStoreConfig::S3 {
                endpoint,
                access_key,
                secret_key,
                bucket,
                region,
            } => Arc::new(
                AmazonS3Builder::new()
                    .with_endpoint(endpoint)
                    .with_access_key_id(access_key)
                    .with_secret_access_key(secret_key)
                    .with_bucket_name(bucket)
                    .with_region(region.unwrap_or_else(|| "us-east-1".to_string()))
                    .with_allow_http(true)
                    .build()?,
            ),
        };
        Ok(Self { inner })
    }

    fn generation_path(generation: i64) -> Path {
        Path::from(format!("generations/{}", generation))
    }

    pub async fn put_generation(&self, generation: i64, data: Bytes) -> Result<()> {
        let size = data.len();
        self.inner
            .put(&Self::generation_path(generation), PutPayload::from(data))
            .await?;
        debug!(generation, size, "stored generation bytes");
        Ok(())
    }

    /// Read a byte range; the caller clips the range to the object size.
    pub async fn get_range(&self, generation: i64, range: Range<usize>) -> Result<Bytes> {
        if range.is_empty() {
            return Ok(Bytes::new());
        }
        Ok(self
            .inner
            .get_range(&Self::generation_path(generation), range)
            .await?)
    }

    pub async fn copy_generation(&self, from: i64, to: i64) -> Result<()> {
        self.inner
            .copy(&Self::generation_path(from), &Self::generation_path(to))
            .await?;
        Ok(())
    }

    pub async fn delete_generation(&self, generation: i64) -> Result<()> {
        match self.inner.delete(&Self::generation_path(generation)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_roundtrip_and_range() {
        let storage = Storage::new(ObjectStoreConfig::Memory).await.unwrap();
        storage
            .put_generation(7, Bytes::from_static(b"hello world"))
            .await
            .unwrap();

        let range = storage.get_range(7, 6..11).await.unwrap();
        assert_eq!(range.as_ref(), b"world");
        assert!(storage.get_range(7, 3..3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_copy_and_delete() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(ObjectStoreConfig::Local {
            path: temp_dir.path().join("objects"),
        })
        .await
        .unwrap();

        storage
            .put_generation(1, Bytes::from_static(b"abc"))
            .await
            .unwrap();
        storage.copy_generation(1, 2).await.unwrap();
        assert!(temp_dir
            .path()
            .join("objects")
            .join("generations")
            .join("2")
            .exists());

        storage.delete_generation(1).await.unwrap();
        // Deleting twice is not an error
        storage.delete_generation(1).await.unwrap();
        assert_eq!(storage.get_range(2, 0..3).await.unwrap().as_ref(), b"abc");
    }
}
