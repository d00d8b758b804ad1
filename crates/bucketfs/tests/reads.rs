//! Read path: handle pinning, block caching, gzip objects and
//! read-your-own-writes.

mod common;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use backend::{
    InMemoryMetrics, ObjectBackend, ReadType, RetryPolicy, RetryingBackend, VersionedStore,
    WriteOptions,
};
use bucketfs::{BucketFs, ContentCacheConfig, MountConfig, OpenFlags};
use bytes::Bytes;
use common::{config_with_ttl, init_tracing, mount, mount_backend, payload, put, read_to_end, store};
use flate2::write::GzEncoder;
use flate2::Compression;

fn small_blocks(readahead_blocks: u64, random_seek_threshold: u32) -> MountConfig {
    MountConfig {
        content_cache: ContentCacheConfig {
            block_size_bytes: 1024,
            readahead_blocks,
            random_seek_threshold,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Incompressible bytes, so encoded offsets span many blocks
fn noise(len: usize) -> Vec<u8> {
    let mut x: u32 = 0x9e37_79b9;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            (x >> 24) as u8
        })
        .collect()
}

fn text(len: usize) -> Vec<u8> {
    let line = b"the quick brown fox jumps over the lazy dog\n";
    line.iter().copied().cycle().take(len).collect()
}

#[tokio::test]
async fn test_handle_pinned_to_generation_at_open() -> Result<()> {
    init_tracing();
    let store = store().await?;
    put(&store, "p", b"version one").await?;
    let m = mount(&store, config_with_ttl(0))?;

    let pinned = m.fs.open_path("p", OpenFlags::READ_ONLY).await?;
    let newer = put(&store, "p", b"version two!!").await?;

    // The mount reports the newer generation...
    let attr = m.fs.stat("p").await?;
    assert_eq!(attr.size, 13);
    assert_eq!(attr.generation.unwrap().generation, newer.generation);

    // ...while the old handle keeps reading what it opened
    assert_eq!(read_to_end(&m.fs, pinned).await?, b"version one");
    let fresh = m.fs.open_path("p", OpenFlags::READ_ONLY).await?;
    assert_eq!(read_to_end(&m.fs, fresh).await?, b"version two!!");

    // Deleting the object takes every generation with it
    assert_eq!(store.retained_generations(), 2);
    store.delete_object("p", newer.generation).await?;
    assert_eq!(store.retained_generations(), 0);
    let err = m.fs.read(pinned, 0, 4).await.unwrap_err();
    assert_eq!(err.errno(), libc::ESTALE);

    m.fs.release(pinned).await?;
    m.fs.release(fresh).await?;
    Ok(())
}

#[tokio::test]
async fn test_generation_never_goes_backwards() -> Result<()> {
    init_tracing();
    let store = store().await?;
    put(&store, "g", b"1").await?;
    let m = mount(&store, config_with_ttl(0))?;

    let mut last = 0;
    for round in 0..5 {
        put(&store, "g", format!("round {}", round).as_bytes()).await?;
        let generation = m.fs.stat("g").await?.generation.unwrap().generation;
        assert!(generation > last);
        last = generation;
    }
    Ok(())
}

#[tokio::test]
async fn test_sequential_reads_fill_cache() -> Result<()> {
    init_tracing();
    let store = store().await?;
    let content = payload(16 * 1024);
    put(&store, "seq", &content).await?;
    let m = mount(&store, small_blocks(2, 2))?;

    let fh = m.fs.open_path("seq", OpenFlags::READ_ONLY).await?;
    let mut data = Vec::new();
    for offset in (0..16 * 1024).step_by(1024) {
        data.extend_from_slice(&m.fs.read(fh, offset as u64, 1024).await?);
    }
    assert_eq!(data, content);

    let stats = m.fs.cache_stats();
    assert_eq!(stats.content_blocks, 16);
    assert_eq!(stats.content_bytes, 16 * 1024);
    // One miss per fetch of three blocks
    assert_eq!(m.metrics.cache_misses(ReadType::Sequential), 6);
    assert_eq!(m.metrics.cache_hits(ReadType::Sequential), 10);
    assert_eq!(m.metrics.bytes_read_total(ReadType::Sequential), 16 * 1024);

    // A second handle is served entirely from cache
    let again = m.fs.open_path("seq", OpenFlags::READ_ONLY).await?;
    assert_eq!(read_to_end(&m.fs, again).await?, content);
    assert_eq!(m.metrics.cache_misses(ReadType::Sequential), 6);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_readers_see_same_bytes() -> Result<()> {
    init_tracing();
    let store = store().await?;
    let content = payload(8 * 1024);
    put(&store, "shared", &content).await?;
    let m = mount(&store, small_blocks(1, 2))?;

    let mut handles = Vec::new();
    for _ in 0..4 {
        handles.push(m.fs.open_path("shared", OpenFlags::READ_ONLY).await?);
    }
    let reads = handles.iter().map(|&fh| read_to_end(&m.fs, fh));
    for data in futures::future::try_join_all(reads).await? {
        assert_eq!(data, content);
    }
    assert_eq!(m.fs.cache_stats().content_blocks, 8);

    for fh in handles {
        m.fs.release(fh).await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_random_reads_bypass_cache() -> Result<()> {
    init_tracing();
    let store = store().await?;
    let content = payload(16 * 1024);
    put(&store, "rand", &content).await?;
    let m = mount(&store, small_blocks(2, 1))?;

    let fh = m.fs.open_path("rand", OpenFlags::READ_ONLY).await?;
    for offset in [9000u64, 100, 15000, 4321] {
        let data = m.fs.read(fh, offset, 300).await?;
        let end = (offset as usize + 300).min(content.len());
        assert_eq!(data.as_ref(), &content[offset as usize..end]);
    }

    assert_eq!(m.fs.cache_stats().content_blocks, 0);
    assert!(m.metrics.cache_misses(ReadType::Random) >= 4);
    assert_eq!(m.metrics.cache_hits(ReadType::Random), 0);
    Ok(())
}

#[tokio::test]
async fn test_gzip_passthrough_serves_encoded_ranges() -> Result<()> {
    init_tracing();
    let store = store().await?;
    let encoded = gzip(&noise(64 * 1024));
    store
        .create_object(
            "logs.txt.gz",
            Bytes::from(encoded.clone()),
            WriteOptions::default().with_content_encoding("gzip"),
        )
        .await?;
    let m = mount(&store, small_blocks(1, 2))?;

    let attr = m.fs.stat("logs.txt.gz").await?;
    assert_eq!(attr.size, encoded.len() as u64);
    assert_eq!(attr.content_encoding.as_deref(), Some("gzip"));

    let len = encoded.len() as u64;
    let ranges = [
        (0, 100),
        (len / 2, 257),
        (1000, 500),
        (len - 50, 50),
        (len / 4, 1),
    ];
    let fh = m.fs.open_path("logs.txt.gz", OpenFlags::READ_ONLY).await?;
    for (offset, size) in ranges {
        let data = m.fs.read(fh, offset, size).await?;
        let expected = &encoded[offset as usize..(offset + size) as usize];
        assert_eq!(data.as_ref(), expected, "range at {}", offset);
    }
    m.fs.release(fh).await?;

    let fh = m.fs.open_path("logs.txt.gz", OpenFlags::READ_ONLY).await?;
    assert_eq!(read_to_end(&m.fs, fh).await?, encoded);
    Ok(())
}

#[tokio::test]
async fn test_gzip_decoded_without_passthrough() -> Result<()> {
    init_tracing();
    let store = store().await?;
    let original = text(10_000);
    let encoded = gzip(&original);
    store
        .create_object(
            "notes.gz",
            Bytes::from(encoded.clone()),
            WriteOptions::default().with_content_encoding("gzip"),
        )
        .await?;
    let config = MountConfig {
        gzip_passthrough: false,
        ..Default::default()
    };
    let m = mount(&store, config)?;

    // Attributes describe the stored object
    assert_eq!(m.fs.stat("notes.gz").await?.size, encoded.len() as u64);

    let fh = m.fs.open_path("notes.gz", OpenFlags::READ_ONLY).await?;
    assert_eq!(m.fs.read(fh, 10, 5).await?.as_ref(), &original[10..15]);
    assert_eq!(read_to_end(&m.fs, fh).await?, original);
    Ok(())
}

#[tokio::test]
async fn test_read_your_own_writes() -> Result<()> {
    init_tracing();
    let store = store().await?;
    put(&store, "r", b"0123456789").await?;
    let config = MountConfig {
        streaming_writes: false,
        ..Default::default()
    };
    let writer = mount(&store, config)?;
    let other = mount(&store, config_with_ttl(0))?;

    let fh = writer.fs.open_path("r", OpenFlags::READ_WRITE).await?;
    writer.fs.write(fh, 10, b"abcdef").await?;

    assert_eq!(writer.fs.stat("r").await?.size, 16);
    assert_eq!(writer.fs.read(fh, 8, 8).await?.as_ref(), b"89abcdef");
    assert_eq!(other.fs.stat("r").await?.size, 10);

    writer.fs.sync(fh).await?;
    assert_eq!(other.fs.stat("r").await?.size, 16);

    writer.fs.write(fh, 0, b"XY").await?;
    writer.fs.release(fh).await?;
    let fh = other.fs.open_path("r", OpenFlags::READ_ONLY).await?;
    assert_eq!(read_to_end(&other.fs, fh).await?, b"XY23456789abcdef");
    Ok(())
}

#[tokio::test]
async fn test_open_with_truncate_replaces_content() -> Result<()> {
    init_tracing();
    let store = store().await?;
    put(&store, "t", b"old content").await?;
    let m = mount(&store, MountConfig::default())?;

    let fh = m.fs.open_path("t", OpenFlags::READ_WRITE.truncating()).await?;
    assert_eq!(m.fs.stat("t").await?.size, 0);
    m.fs.write(fh, 0, b"new").await?;
    m.fs.release(fh).await?;

    let attrs = store.stat_object("t").await?;
    assert_eq!(attrs.size, 3);
    let data = store.read_range("t", attrs.generation, 0, 16).await?;
    assert_eq!(data.as_ref(), b"new");
    Ok(())
}

#[tokio::test]
async fn test_retries_absorb_transient_failures() -> Result<()> {
    init_tracing();
    let metrics = Arc::new(InMemoryMetrics::new());
    let policy = RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        ..Default::default()
    };
    let retrying = Arc::new(
        RetryingBackend::new(VersionedStore::ephemeral().await?, policy)
            .with_metrics(metrics.clone()),
    );
    retrying
        .create_object("a", Bytes::from_static(b"data"), WriteOptions::default())
        .await?;
    let m = mount_backend(retrying.clone(), MountConfig::default())?;

    retrying.inner().inject_transient_failures(2);
    assert_eq!(m.fs.stat("a").await?.size, 4);
    assert_eq!(metrics.retry_count("stat_object"), 2);

    // Exhausting the budget surfaces as an I/O error
    retrying.inner().inject_transient_failures(3);
    let err = m.fs.stat("b").await.unwrap_err();
    assert_eq!(err.errno(), libc::EIO);
    Ok(())
}
