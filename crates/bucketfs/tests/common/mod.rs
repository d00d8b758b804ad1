//! Shared fixtures for the integration tests.
//!
//! Each test builds one `VersionedStore` and one or more mounts over it. A
//! second mount over the same store stands in for another machine or an
//! out-of-band writer.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backend::{
    InMemoryMetrics, ListResult, ObjectAttrs, ObjectBackend, StreamHandle, VersionedStore,
    WriteOptions, WriterId,
};
use bucketfs::{BucketFs, ManualClock, MountConfig};
use bytes::Bytes;

pub const MIB: usize = 1024 * 1024;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub struct TestMount {
    pub fs: BucketFs,
    pub clock: Arc<ManualClock>,
    pub metrics: Arc<InMemoryMetrics>,
}

impl TestMount {
    pub fn advance(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }
}

pub async fn store() -> anyhow::Result<Arc<VersionedStore>> {
    Ok(Arc::new(VersionedStore::ephemeral().await?))
}

pub fn mount(store: &Arc<VersionedStore>, config: MountConfig) -> anyhow::Result<TestMount> {
    let backend: Arc<dyn ObjectBackend> = store.clone();
    mount_backend(backend, config)
}

pub fn mount_backend(backend: Arc<dyn ObjectBackend>, config: MountConfig) -> anyhow::Result<TestMount> {
    let clock = Arc::new(ManualClock::new());
    let metrics = Arc::new(InMemoryMetrics::new());
    let fs = BucketFs::with_clock(backend, config, clock.clone())?.with_metrics(metrics.clone());
    Ok(TestMount { fs, clock, metrics })
}

pub fn config_with_ttl(secs: u64) -> MountConfig {
    MountConfig {
        metadata_cache_ttl_secs: secs,
        ..Default::default()
    }
}

/// Write an object directly to the store, bypassing every mount.
pub async fn put(store: &VersionedStore, name: &str, data: &[u8]) -> anyhow::Result<ObjectAttrs> {
    Ok(store
        .create_object(name, Bytes::copy_from_slice(data), WriteOptions::default())
        .await?)
}

/// Read a handle from offset 0 until a short read.
pub async fn read_to_end(fs: &BucketFs, fh: u64) -> anyhow::Result<Vec<u8>> {
    const CHUNK: u64 = 64 * 1024;
    let mut out = Vec::new();
    loop {
        let data = fs.read(fh, out.len() as u64, CHUNK).await?;
        out.extend_from_slice(&data);
        if (data.len() as u64) < CHUNK {
            return Ok(out);
        }
    }
}

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// A store whose stream calls can be made to hang, so tests can cancel an
/// operation while it waits on the backend.
#[derive(Debug)]
pub struct StallingBackend {
    pub inner: Arc<VersionedStore>,
    pub stall_open: AtomicBool,
    pub stall_finalize: AtomicBool,
}

impl StallingBackend {
    pub fn new(inner: Arc<VersionedStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            stall_open: AtomicBool::new(false),
            stall_finalize: AtomicBool::new(false),
        })
    }

    async fn maybe_stall(flag: &AtomicBool) {
        if flag.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
}

#[async_trait]
impl ObjectBackend for StallingBackend {
    async fn stat_object(&self, name: &str) -> backend::Result<ObjectAttrs> {
        self.inner.stat_object(name).await
    }

    async fn read_range(
        &self,
        name: &str,
        generation: i64,
        offset: u64,
        length: u64,
    ) -> backend::Result<Bytes> {
        self.inner.read_range(name, generation, offset, length).await
    }

    async fn create_object(
        &self,
        name: &str,
        data: Bytes,
        options: WriteOptions,
    ) -> backend::Result<ObjectAttrs> {
        self.inner.create_object(name, data, options).await
    }

    async fn open_write_stream(
        &self,
        name: &str,
        writer: &WriterId,
        if_generation_match: Option<i64>,
    ) -> backend::Result<StreamHandle> {
        Self::maybe_stall(&self.stall_open).await;
        self.inner
            .open_write_stream(name, writer, if_generation_match)
            .await
    }

    async fn append_stream(&self, stream: &StreamHandle, data: Bytes) -> backend::Result<u64> {
        self.inner.append_stream(stream, data).await
    }

    async fn finalize_stream(&self, stream: &StreamHandle) -> backend::Result<ObjectAttrs> {
        Self::maybe_stall(&self.stall_finalize).await;
        self.inner.finalize_stream(stream).await
    }

    async fn abort_stream(&self, stream: &StreamHandle) -> backend::Result<()> {
        self.inner.abort_stream(stream).await
    }

    async fn copy_object(
        &self,
        src_name: &str,
        src_generation: i64,
        dst_name: &str,
    ) -> backend::Result<ObjectAttrs> {
        self.inner
            .copy_object(src_name, src_generation, dst_name)
            .await
    }

    async fn delete_object(&self, name: &str, generation: i64) -> backend::Result<()> {
        self.inner.delete_object(name, generation).await
    }

    async fn list_objects(
        &self,
        prefix: &str,
        delimiter: Option<char>,
    ) -> backend::Result<ListResult> {
        self.inner.list_objects(prefix, delimiter).await
    }
}
