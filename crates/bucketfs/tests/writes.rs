//! Write path: buffer limits, sizes reported while several handles write,
//! and operations abandoned mid-flight.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use backend::{BackendError, ObjectBackend};
use bucketfs::{BucketFs, MountConfig, OpenFlags};
use common::{init_tracing, mount, mount_backend, payload, put, read_to_end, store, StallingBackend};
use tokio::time::timeout;

const ROOT: u64 = BucketFs::ROOT_INODE;

/// Let background tasks spawned on this runtime make progress.
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_writes_past_buffer_limit_are_efbig() -> Result<()> {
    init_tracing();
    let store = store().await?;
    put(&store, "f", b"abc").await?;
    let config = MountConfig {
        streaming_writes: false,
        max_buffered_bytes: 1024,
        ..Default::default()
    };
    let m = mount(&store, config)?;

    let fh = m.fs.open_path("f", OpenFlags::READ_WRITE).await?;
    let err = m.fs.write(fh, u64::MAX - 1, b"abc").await.unwrap_err();
    assert_eq!(err.errno(), libc::EFBIG);
    let err = m.fs.write(fh, 1024, b"x").await.unwrap_err();
    assert_eq!(err.errno(), libc::EFBIG);
    let err = m.fs.truncate(fh, 1025).await.unwrap_err();
    assert_eq!(err.errno(), libc::EFBIG);
    assert_eq!(m.metrics.op_error_count("write", "file_too_large"), 2);

    // Rejected writes left the content alone; the limit itself is reachable
    assert_eq!(read_to_end(&m.fs, fh).await?, b"abc");
    m.fs.write(fh, 1021, b"end").await?;
    m.fs.release(fh).await?;
    assert_eq!(store.stat_object("f").await?.size, 1024);
    Ok(())
}

#[tokio::test]
async fn test_stream_tail_is_not_bounded_by_buffer_limit() -> Result<()> {
    init_tracing();
    let store = store().await?;
    let config = MountConfig {
        max_buffered_bytes: 8,
        ..Default::default()
    };
    let m = mount(&store, config)?;

    let (_, fh) = m.fs.create(ROOT, "s", false).await?;
    m.fs.write(fh, 0, &payload(16)).await?;
    m.fs.write(fh, 16, &payload(16)).await?;

    // A jump far past the tail would have to be buffered
    let err = m.fs.write(fh, u64::MAX - 1, b"abc").await.unwrap_err();
    assert_eq!(err.errno(), libc::EFBIG);
    let err = m.fs.write(fh, 1 << 40, b"abc").await.unwrap_err();
    assert_eq!(err.errno(), libc::EFBIG);

    m.fs.release(fh).await?;
    let attrs = store.stat_object("s").await?;
    assert!(attrs.finalized);
    assert_eq!(attrs.size, 32);
    Ok(())
}

#[tokio::test]
async fn test_release_keeps_size_of_other_writer() -> Result<()> {
    init_tracing();
    let store = store().await?;
    put(&store, "f", b"old").await?;
    let config = MountConfig {
        streaming_writes: false,
        ..Default::default()
    };
    let m = mount(&store, config)?;

    let first = m.fs.open_path("f", OpenFlags::READ_WRITE).await?;
    let second = m.fs.open_path("f", OpenFlags::READ_WRITE).await?;
    m.fs.write(second, 0, b"new").await?;
    m.fs.write(first, 0, &payload(16)).await?;
    assert_eq!(m.fs.stat("f").await?.size, 16);

    m.fs.release(second).await?;
    assert_eq!(store.stat_object("f").await?.size, 3);
    // The first handle still holds its unsynced bytes
    assert_eq!(m.fs.stat("f").await?.size, 16);

    // Its upload lost the race against the second handle
    let err = m.fs.release(first).await.unwrap_err();
    assert_eq!(err.errno(), libc::ESTALE);
    assert_eq!(m.fs.stat("f").await?.size, 3);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_create_frees_the_name() -> Result<()> {
    init_tracing();
    let store = store().await?;
    put(&store, "f", b"old").await?;
    let stalling = StallingBackend::new(store.clone());
    let m = mount_backend(stalling.clone(), MountConfig::default())?;

    stalling.stall_open.store(true, Ordering::SeqCst);
    let attempt = timeout(Duration::from_millis(50), m.fs.create(ROOT, "f", false)).await;
    assert!(attempt.is_err());
    stalling.stall_open.store(false, Ordering::SeqCst);

    let fh = m.fs.open_path("f", OpenFlags::READ_WRITE).await?;
    assert_eq!(read_to_end(&m.fs, fh).await?, b"old");
    m.fs.write(fh, 3, b"er").await?;
    m.fs.release(fh).await?;
    assert_eq!(store.stat_object("f").await?.size, 5);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_release_aborts_stream() -> Result<()> {
    init_tracing();
    let store = store().await?;
    let stalling = StallingBackend::new(store.clone());
    let m = mount_backend(stalling.clone(), MountConfig::default())?;

    let (_, fh) = m.fs.create(ROOT, "f", false).await?;
    m.fs.write(fh, 0, b"never finalized").await?;

    stalling.stall_finalize.store(true, Ordering::SeqCst);
    let attempt = timeout(Duration::from_millis(50), m.fs.release(fh)).await;
    assert!(attempt.is_err());
    stalling.stall_finalize.store(false, Ordering::SeqCst);

    settle().await;
    assert!(matches!(
        store.stat_object("f").await,
        Err(BackendError::NotFound { .. })
    ));
    assert_eq!(m.fs.cache_stats().open_handles, 0);

    // The name is free and no size from the lost handle lingers
    let (_, fh) = m.fs.create(ROOT, "f", false).await?;
    m.fs.write(fh, 0, b"second").await?;
    m.fs.release(fh).await?;
    assert_eq!(store.stat_object("f").await?.size, 6);
    assert_eq!(m.fs.stat("f").await?.size, 6);
    Ok(())
}
