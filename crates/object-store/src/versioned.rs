//! Generation-versioned object store.
//!
//! Metadata (live generation, size, stream ownership) is kept in memory; the
//! bytes of every finalized generation are written to [`Storage`]. Superseded
//! generations stay readable until their object is deleted, so handles pinned
//! to an older generation keep working while a newer one is live.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::backend::ObjectBackend;
use crate::error::{BackendError, Result};
use crate::storage::{ObjectStoreConfig, Storage};
use crate::types::{ListResult, ObjectAttrs, StreamHandle, WriteOptions, WriterId};

#[derive(Debug)]
struct ObjectRecord {
    generation: i64,
    metageneration: i64,
    size: u64,
    updated: DateTime<Utc>,
    content_encoding: Option<String>,
    stream: Option<LiveStream>,
}

impl ObjectRecord {
    fn attrs(&self, name: &str) -> ObjectAttrs {
        ObjectAttrs {
            name: name.to_string(),
            generation: self.generation,
            metageneration: self.metageneration,
            size: self.size,
            updated: self.updated,
            content_encoding: self.content_encoding.clone(),
            finalized: self.stream.is_none(),
        }
    }
}

#[derive(Debug)]
struct LiveStream {
    id: u64,
    writer: WriterId,
    data: BytesMut,
    /// Finalized record hidden by the stream, restored on abort
    previous: Option<Box<ObjectRecord>>,
}

#[derive(Debug, Clone)]
struct BlobInfo {
    name: String,
    size: u64,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, ObjectRecord>,
    /// Every generation whose bytes are retained in storage
    blobs: HashMap<i64, BlobInfo>,
    unavailable: bool,
    transient_failures: u32,
    denied_prefixes: Vec<String>,
}

impl State {
    fn check(&mut self, name: &str) -> Result<()> {
        if self.unavailable {
            return Err(BackendError::Unavailable("backend offline".to_string()));
        }
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(BackendError::Unavailable(
                "injected transient failure".to_string(),
            ));
        }
        if self.denied_prefixes.iter().any(|p| name.starts_with(p)) {
            return Err(BackendError::PermissionDenied {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn live_generation(&self, name: &str) -> i64 {
        self.objects.get(name).map(|r| r.generation).unwrap_or(0)
    }
}

/// In-process object store with generations, unfinalized streams and
/// fault injection. Multiple mounts can share one instance to model
/// out-of-band writers.
#[derive(Debug)]
pub struct VersionedStore {
    storage: Storage,
    state: Mutex<State>,
    next_generation: AtomicI64,
    next_stream: AtomicU64,
}

impl VersionedStore {
    pub async fn new(config: ObjectStoreConfig) -> Result<Self> {
        let storage = Storage::new(config).await?;
        Ok(Self {
            storage,
            state: Mutex::new(State::default()),
            next_generation: AtomicI64::new(1),
            next_stream: AtomicU64::new(1),
        })
    }

    /// Fully in-memory store. Useful for testing.
    pub async fn ephemeral() -> Result<Self> {
        Self::new(ObjectStoreConfig::Memory).await
    }

    /// Make every call fail with a transient error until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Fail the next `count` calls with a transient error.
    pub fn inject_transient_failures(&self, count: u32) {
        self.state.lock().transient_failures = count;
    }

    /// Deny access to every object under `prefix`.
    pub fn deny_prefix(&self, prefix: impl Into<String>) {
        self.state.lock().denied_prefixes.push(prefix.into());
    }

    /// Number of generations whose bytes are retained.
    pub fn retained_generations(&self) -> usize {
        self.state.lock().blobs.len()
    }

    fn allocate_generation(&self) -> i64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst)
    }

    fn check_precondition(state: &State, name: &str, if_match: Option<i64>) -> Result<()> {
        if let Some(expected) = if_match {
            let live = state.live_generation(name);
            if live != expected {
                return Err(BackendError::precondition(
                    name,
                    format!("expected generation {}, live generation is {}", expected, live),
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectBackend for VersionedStore {
    async fn stat_object(&self, name: &str) -> Result<ObjectAttrs> {
        let mut state = self.state.lock();
        state.check(name)?;
        state
            .objects
            .get(name)
            .map(|record| record.attrs(name))
            .ok_or_else(|| BackendError::not_found(name))
    }

    async fn read_range(
        &self,
        name: &str,
        generation: i64,
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        let blob_size = {
            let mut state = self.state.lock();
            state.check(name)?;

            // Unfinalized generations are served from the stream buffer
            if let Some(record) = state.objects.get(name) {
                if record.generation == generation {
                    if let Some(stream) = &record.stream {
                        let len = stream.data.len() as u64;
                        let start = offset.min(len) as usize;
                        let end = offset.saturating_add(length).min(len) as usize;
                        return Ok(Bytes::copy_from_slice(&stream.data[start..end]));
                    }
                }
            }

            match state.blobs.get(&generation) {
                Some(blob) if blob.name == name => blob.size,
                _ => return Err(BackendError::not_found(format!("{}#{}", name, generation))),
            }
        };

        let start = offset.min(blob_size);
        let end = offset.saturating_add(length).min(blob_size);
        self.storage
            .get_range(generation, start as usize..end as usize)
            .await
    }

    async fn create_object(
        &self,
        name: &str,
        data: Bytes,
        options: WriteOptions,
    ) -> Result<ObjectAttrs> {
        {
            let mut state = self.state.lock();
            state.check(name)?;
        }

        let generation = self.allocate_generation();
        let size = data.len() as u64;
        self.storage.put_generation(generation, data).await?;

        let result = {
            let mut state = self.state.lock();
            let unfinalized = state
                .objects
                .get(name)
                .is_some_and(|record| record.stream.is_some());
            if unfinalized {
                Err(BackendError::precondition(
                    name,
                    "object has an open write stream",
                ))
            } else {
                Self::check_precondition(&state, name, options.if_generation_match).map(|()| {
                    let record = ObjectRecord {
                        generation,
                        metageneration: 1,
                        size,
                        updated: Utc::now(),
                        content_encoding: options.content_encoding.clone(),
                        stream: None,
                    };
                    let attrs = record.attrs(name);
                    state.objects.insert(name.to_string(), record);
                    state.blobs.insert(
                        generation,
                        BlobInfo {
                            name: name.to_string(),
                            size,
                        },
                    );
                    attrs
                })
            }
        };

        match result {
            Ok(attrs) => {
                debug!(name, generation, size, "object created");
                Ok(attrs)
            }
            Err(e) => {
                if let Err(cleanup) = self.storage.delete_generation(generation).await {
                    warn!(name, generation, error = %cleanup, "failed to discard rejected upload");
                }
                Err(e)
            }
        }
    }

    async fn open_write_stream(
        &self,
        name: &str,
        writer: &WriterId,
        if_generation_match: Option<i64>,
    ) -> Result<StreamHandle> {
        let mut state = self.state.lock();
        state.check(name)?;

        if let Some(stream) = state.objects.get(name).and_then(|r| r.stream.as_ref()) {
            return Err(BackendError::conflict(
                name,
                format!("write stream already owned by {}", stream.writer),
            ));
        }
        Self::check_precondition(&state, name, if_generation_match)?;

        let generation = self.allocate_generation();
        let id = self.next_stream.fetch_add(1, Ordering::SeqCst);
        let previous = state.objects.remove(name).map(Box::new);
        let content_encoding = previous.as_ref().and_then(|p| p.content_encoding.clone());
        let last_finalized_size = previous.as_ref().map(|p| p.size).unwrap_or(0);
        state.objects.insert(
            name.to_string(),
            ObjectRecord {
                generation,
                metageneration: 1,
                size: last_finalized_size,
                updated: Utc::now(),
                content_encoding,
                stream: Some(LiveStream {
                    id,
                    writer: writer.clone(),
                    data: BytesMut::new(),
                    previous,
                }),
            },
        );

        info!(name, generation, stream = id, writer = %writer, "write stream opened");
        Ok(StreamHandle {
            id,
            name: name.to_string(),
            generation,
            writer: writer.clone(),
        })
    }

    async fn append_stream(&self, stream: &StreamHandle, data: Bytes) -> Result<u64> {
        let mut state = self.state.lock();
        state.check(&stream.name)?;
        let live = state
            .objects
            .get_mut(&stream.name)
            .and_then(|record| record.stream.as_mut())
            .filter(|live| live.id == stream.id)
            .ok_or_else(|| BackendError::not_found(stream.name.clone()))?;
        live.data.extend_from_slice(&data);
        Ok(live.data.len() as u64)
    }

    async fn finalize_stream(&self, stream: &StreamHandle) -> Result<ObjectAttrs> {
        let data = {
            let mut state = self.state.lock();
            state.check(&stream.name)?;
            let live = state
                .objects
                .get(&stream.name)
                .and_then(|record| record.stream.as_ref())
                .filter(|live| live.id == stream.id)
                .ok_or_else(|| BackendError::not_found(stream.name.clone()))?;
            Bytes::copy_from_slice(&live.data)
        };

        let generation = self.allocate_generation();
        let size = data.len() as u64;
        self.storage.put_generation(generation, data).await?;

        let still_live = {
            let state = self.state.lock();
            state
                .objects
                .get(&stream.name)
                .and_then(|record| record.stream.as_ref())
                .is_some_and(|live| live.id == stream.id)
        };
        if !still_live {
            self.storage.delete_generation(generation).await?;
            return Err(BackendError::not_found(stream.name.clone()));
        }

        let mut state = self.state.lock();

        let attrs = {
            let record = state
                .objects
                .get_mut(&stream.name)
                .ok_or_else(|| BackendError::not_found(stream.name.clone()))?;
            record.generation = generation;
            record.metageneration = 1;
            record.size = size;
            record.updated = Utc::now();
            record.stream = None;
            record.attrs(&stream.name)
        };
        state.blobs.insert(
            generation,
            BlobInfo {
                name: stream.name.clone(),
                size,
            },
        );

        info!(name = %stream.name, generation, size, "write stream finalized");
        Ok(attrs)
    }

    async fn abort_stream(&self, stream: &StreamHandle) -> Result<()> {
        let mut state = self.state.lock();
        let owns = state
            .objects
            .get(&stream.name)
            .and_then(|record| record.stream.as_ref())
            .is_some_and(|live| live.id == stream.id);
        if !owns {
            return Ok(());
        }

        let previous = state
            .objects
            .remove(&stream.name)
            .and_then(|record| record.stream)
            .and_then(|live| live.previous);
        if let Some(previous) = previous {
            state.objects.insert(stream.name.clone(), *previous);
        }
        info!(name = %stream.name, stream = stream.id, "write stream aborted");
        Ok(())
    }

    async fn copy_object(
        &self,
        src_name: &str,
        src_generation: i64,
        dst_name: &str,
    ) -> Result<ObjectAttrs> {
        let (size, content_encoding) = {
            let mut state = self.state.lock();
            state.check(src_name)?;
            state.check(dst_name)?;

            let src = state
                .objects
                .get(src_name)
                .ok_or_else(|| BackendError::not_found(src_name))?;
            if src.stream.is_some() {
                return Err(BackendError::conflict(
                    src_name,
                    "cannot copy an unfinalized object",
                ));
            }
            if src.generation != src_generation {
                return Err(BackendError::precondition(
                    src_name,
                    format!(
                        "source generation {} is no longer live (live {})",
                        src_generation, src.generation
                    ),
                ));
            }
            let dst_streaming = state
                .objects
                .get(dst_name)
                .is_some_and(|record| record.stream.is_some());
            if dst_streaming {
                return Err(BackendError::precondition(
                    dst_name,
                    "destination has an open write stream",
                ));
            }
            (src.size, src.content_encoding.clone())
        };

        let generation = self.allocate_generation();
        self.storage
            .copy_generation(src_generation, generation)
            .await?;

        let mut state = self.state.lock();
        let record = ObjectRecord {
            generation,
            metageneration: 1,
            size,
            updated: Utc::now(),
            content_encoding,
            stream: None,
        };
        let attrs = record.attrs(dst_name);
        state.objects.insert(dst_name.to_string(), record);
        state.blobs.insert(
            generation,
            BlobInfo {
                name: dst_name.to_string(),
                size,
            },
        );
        debug!(src_name, src_generation, dst_name, generation, "object copied");
        Ok(attrs)
    }

    async fn delete_object(&self, name: &str, generation: i64) -> Result<()> {
        let removed_blobs = {
            let mut state = self.state.lock();
            state.check(name)?;
            let live = state
                .objects
                .get(name)
                .ok_or_else(|| BackendError::not_found(name))?;
            if live.generation != generation {
                return Err(BackendError::precondition(
                    name,
                    format!(
                        "expected generation {}, live generation is {}",
                        generation, live.generation
                    ),
                ));
            }
            state.objects.remove(name);

            let removed: Vec<i64> = state
                .blobs
                .iter()
                .filter(|(_, blob)| blob.name == name)
                .map(|(generation, _)| *generation)
                .collect();
            for generation in &removed {
                state.blobs.remove(generation);
            }
            removed
        };

        for generation in removed_blobs {
            self.storage.delete_generation(generation).await?;
        }
        debug!(name, generation, "object deleted");
        Ok(())
    }

    async fn list_objects(&self, prefix: &str, delimiter: Option<char>) -> Result<ListResult> {
        let mut state = self.state.lock();
        state.check(prefix)?;

        let mut result = ListResult::default();
        for (name, record) in state.objects.range(prefix.to_string()..) {
            let Some(rest) = name.strip_prefix(prefix) else {
                break;
            };
            match delimiter.and_then(|d| rest.find(d).map(|i| (d, i))) {
                Some((d, i)) => {
                    let common = format!("{}{}{}", prefix, &rest[..i], d);
                    if result.prefixes.last() != Some(&common) {
                        result.prefixes.push(common);
                    }
                }
                None => result.objects.push(record.attrs(name)),
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn writer(id: &str) -> WriterId {
        WriterId::new(id)
    }

    #[tokio::test]
    async fn test_create_and_read_generations() {
        let store = VersionedStore::ephemeral().await.unwrap();

        let v1 = store
            .create_object("a.txt", Bytes::from_static(b"first"), WriteOptions::default())
            .await
            .unwrap();
        let v2 = store
            .create_object("a.txt", Bytes::from_static(b"second"), WriteOptions::default())
            .await
            .unwrap();
        assert!(v2.generation > v1.generation);

        // Superseded generation is still readable by pinned readers
        let old = store.read_range("a.txt", v1.generation, 0, 100).await.unwrap();
        assert_eq!(old.as_ref(), b"first");
        let new = store.read_range("a.txt", v2.generation, 2, 3).await.unwrap();
        assert_eq!(new.as_ref(), b"con");

        let stat = store.stat_object("a.txt").await.unwrap();
        assert_eq!(stat.generation, v2.generation);
        assert_eq!(stat.size, 6);
    }

    #[tokio::test]
    async fn test_create_precondition() {
        let store = VersionedStore::ephemeral().await.unwrap();
        let v1 = store
            .create_object("a", Bytes::from_static(b"x"), WriteOptions::if_not_exists())
            .await
            .unwrap();

        let err = store
            .create_object("a", Bytes::from_static(b"y"), WriteOptions::if_not_exists())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::PreconditionFailed { .. }));

        store
            .create_object(
                "a",
                Bytes::from_static(b"z"),
                WriteOptions::if_generation_match(v1.generation),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stream_reports_zero_until_finalized() {
        let store = VersionedStore::ephemeral().await.unwrap();
        let stream = store
            .open_write_stream("s", &writer("w1"), Some(0))
            .await
            .unwrap();
        store
            .append_stream(&stream, Bytes::from(vec![7u8; 1024]))
            .await
            .unwrap();

        let stat = store.stat_object("s").await.unwrap();
        assert_eq!(stat.size, 0);
        assert!(!stat.finalized);

        let attrs = store.finalize_stream(&stream).await.unwrap();
        assert_eq!(attrs.size, 1024);
        assert!(attrs.finalized);
        assert!(attrs.generation > stream.generation);
        assert_eq!(store.stat_object("s").await.unwrap().size, 1024);
    }

    #[tokio::test]
    async fn test_second_stream_conflicts() {
        let store = VersionedStore::ephemeral().await.unwrap();
        store
            .open_write_stream("s", &writer("w1"), None)
            .await
            .unwrap();
        let err = store
            .open_write_stream("s", &writer("w2"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Conflict { .. }));

        // Full overwrite of an unfinalized object is rejected as a precondition
        let err = store
            .create_object("s", Bytes::from_static(b"x"), WriteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_finalize_on_spawned_task() {
        let store = Arc::new(VersionedStore::ephemeral().await.unwrap());
        let stream = store
            .open_write_stream("s", &writer("w"), Some(0))
            .await
            .unwrap();
        store
            .append_stream(&stream, Bytes::from_static(b"abc"))
            .await
            .unwrap();

        let attrs = tokio::spawn({
            let store = store.clone();
            let stream = stream.clone();
            async move { store.finalize_stream(&stream).await }
        })
        .await
        .unwrap()
        .unwrap();
        assert!(attrs.finalized);
        assert_eq!(attrs.size, 3);

        // The stream is gone once finalized
        let again = tokio::spawn(async move { store.finalize_stream(&stream).await })
            .await
            .unwrap();
        assert!(matches!(again, Err(BackendError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_abort_restores_previous() {
        let store = VersionedStore::ephemeral().await.unwrap();
        let v1 = store
            .create_object("a", Bytes::from_static(b"keep"), WriteOptions::default())
            .await
            .unwrap();
        let stream = store
            .open_write_stream("a", &writer("w"), Some(v1.generation))
            .await
            .unwrap();
        store.abort_stream(&stream).await.unwrap();

        let stat = store.stat_object("a").await.unwrap();
        assert_eq!(stat.generation, v1.generation);
        assert!(stat.finalized);
    }

    #[tokio::test]
    async fn test_copy_and_delete() {
        let store = VersionedStore::ephemeral().await.unwrap();
        let v1 = store
            .create_object("src", Bytes::from_static(b"payload"), WriteOptions::default())
            .await
            .unwrap();

        let copied = store.copy_object("src", v1.generation, "dst").await.unwrap();
        assert_eq!(copied.size, 7);

        let err = store.copy_object("src", v1.generation + 100, "x").await.unwrap_err();
        assert!(matches!(err, BackendError::PreconditionFailed { .. }));

        store.delete_object("src", v1.generation).await.unwrap();
        assert!(matches!(
            store.stat_object("src").await.unwrap_err(),
            BackendError::NotFound { .. }
        ));
        let data = store
            .read_range("dst", copied.generation, 0, 7)
            .await
            .unwrap();
        assert_eq!(data.as_ref(), b"payload");
    }

    #[tokio::test]
    async fn test_list_with_delimiter() {
        let store = VersionedStore::ephemeral().await.unwrap();
        for name in ["a.txt", "dir/", "dir/b.txt", "dir/sub/c.txt", "z.txt"] {
            store
                .create_object(name, Bytes::new(), WriteOptions::default())
                .await
                .unwrap();
        }

        let root = store.list_objects("", Some('/')).await.unwrap();
        let names: Vec<_> = root.objects.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "z.txt"]);
        assert_eq!(root.prefixes, vec!["dir/".to_string()]);

        let dir = store.list_objects("dir/", Some('/')).await.unwrap();
        let names: Vec<_> = dir.objects.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["dir/", "dir/b.txt"]);
        assert_eq!(dir.prefixes, vec!["dir/sub/".to_string()]);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = VersionedStore::ephemeral().await.unwrap();
        store.deny_prefix("secret/");
        let err = store.stat_object("secret/key").await.unwrap_err();
        assert!(matches!(err, BackendError::PermissionDenied { .. }));

        store.inject_transient_failures(1);
        assert!(store.stat_object("x").await.unwrap_err().is_transient());
        assert!(matches!(
            store.stat_object("x").await.unwrap_err(),
            BackendError::NotFound { .. }
        ));

        store.set_unavailable(true);
        assert!(store.list_objects("", None).await.unwrap_err().is_transient());
    }
}
