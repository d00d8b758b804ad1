//! File handle operations: open, create, read, write, sync and release.
//!
//! A handle reads from the generation it pinned at open. Writes are staged
//! in the handle's [`WriteBuffer`] and become a new generation on sync or
//! release. Uploads carry the pinned generation as a precondition, so a
//! handle never silently overwrites content it did not see.

use std::time::Instant;

use backend::{BackendError, Generation, ObjectAttrs, ReadType, WriteOptions, WriterId};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use tracing::{debug, info, instrument, trace, warn};

use crate::attr::FileAttr;
use crate::bucket_fs::{validate_new_name, BucketFs};
use crate::error::{FsError, Result};
use crate::handle::{HandleEntry, OpenFile, OpenFlags};
use crate::inode_table::{InodeKind, InodeTable};
use crate::read_path::{decode_gzip, slice_range, ReadPath, ReadPattern, ReadRequest};
use crate::write_buffer::{Staged, Streaming, WriteBuffer};

impl BucketFs {
    #[instrument(name = "BucketFs::open", skip(self))]
    pub async fn open(&self, ino: u64, flags: OpenFlags) -> Result<u64> {
        let started = Instant::now();
        let result = self.open_file(ino, flags).await;
        self.record("open", started, result)
    }

    /// Resolve `path` and open it.
    pub async fn open_path(&self, path: &str, flags: OpenFlags) -> Result<u64> {
        let attr = self.stat(path).await?;
        self.open(attr.ino, flags).await
    }

    /// Create (or truncate) a file and open it for writing. With
    /// `exclusive`, an existing object fails with `EEXIST`.
    #[instrument(name = "BucketFs::create", skip(self))]
    pub async fn create(&self, parent: u64, name: &str, exclusive: bool) -> Result<(FileAttr, u64)> {
        let started = Instant::now();
        let result = self.create_file(parent, name, exclusive).await;
        self.record("create", started, result)
    }

    #[instrument(name = "BucketFs::read", skip(self))]
    pub async fn read(&self, fh: u64, offset: u64, len: u64) -> Result<Bytes> {
        let started = Instant::now();
        let result = self.read_file(fh, offset, len).await;
        self.record("read", started, result)
    }

    #[instrument(name = "BucketFs::write", skip(self, data), fields(len = data.len()))]
    pub async fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let started = Instant::now();
        let result = self.write_file(fh, offset, data).await;
        self.record("write", started, result)
    }

    /// Truncate or extend the content seen through a writable handle.
    #[instrument(name = "BucketFs::truncate", skip(self))]
    pub async fn truncate(&self, fh: u64, size: u64) -> Result<()> {
        let started = Instant::now();
        let result = self.truncate_file(fh, size).await;
        self.record("truncate", started, result)
    }

    /// Make the handle's writes durable. Streaming handles append what is
    /// pending; buffered handles upload a new generation.
    #[instrument(name = "BucketFs::sync", skip(self))]
    pub async fn sync(&self, fh: u64) -> Result<()> {
        let started = Instant::now();
        let result = self.sync_file(fh).await;
        self.record("sync", started, result)
    }

    /// Close a handle, finalizing its writes.
    #[instrument(name = "BucketFs::release", skip(self))]
    pub async fn release(&self, fh: u64) -> Result<()> {
        let started = Instant::now();
        let result = self.release_file(fh).await;
        self.record("release", started, result)
    }

    fn entry(&self, fh: u64) -> Result<HandleEntry> {
        self.handles.get(fh).ok_or(FsError::BadHandle(fh))
    }

    fn live_entry(&self, fh: u64) -> Result<HandleEntry> {
        let entry = self.entry(fh)?;
        if entry.is_stale() {
            return Err(FsError::Stale(format!("handle {}", fh)));
        }
        Ok(entry)
    }

    async fn open_file(&self, ino: u64, flags: OpenFlags) -> Result<u64> {
        if flags.write {
            self.ensure_writable()?;
        }
        let (path, kind) = {
            let inodes = self.inodes.read();
            let path = inodes
                .get_path(ino)
                .ok_or_else(|| FsError::NotFound(format!("inode {}", ino)))?
                .to_string();
            (path, inodes.kind(ino).unwrap_or(InodeKind::File))
        };
        if kind == InodeKind::Directory {
            return Err(FsError::IsDir(path));
        }
        let name = InodeTable::object_name_for(&path, InodeKind::File);

        if flags.write {
            if let Some(owner) = self.streams.owner(&name) {
                return Err(FsError::Io(format!(
                    "{} is being written through handle {}",
                    name, owner
                )));
            }
        }

        // Writers pin the live generation; readers may use the cached one
        let attr = if flags.write {
            self.tracker.refresh(self.backend.as_ref(), ino, &name).await?
        } else {
            self.tracker.resolve(self.backend.as_ref(), ino, &name).await?
        };

        let fh = self.handles.allocate();
        let buffer = if flags.truncate {
            self.metadata.update_local_size(ino, fh, 0);
            let buffer = WriteBuffer::buffered_dirty(Vec::new()).with_limit(self.config.max_buffered_bytes);
            Some(buffer)
        } else {
            None
        };
        debug!(
            fh,
            ino,
            name = %name,
            generation = ?attr.generation,
            finalized = attr.finalized,
            write = flags.write,
            "handle opened"
        );
        self.handles.insert(OpenFile {
            fh,
            ino,
            name,
            flags,
            pinned: attr.generation.clone(),
            size: attr.size,
            gzip: attr.is_gzip(),
            pattern: ReadPattern::new(self.config.content_cache.random_seek_threshold),
            buffer,
            decoded: None,
            claim: None,
        });
        Ok(fh)
    }

    async fn create_file(&self, parent: u64, name: &str, exclusive: bool) -> Result<(FileAttr, u64)> {
        self.ensure_writable()?;
        validate_new_name(name)?;
        let path = self.child_path(parent, name)?;
        let existing_ino = self.inodes.read().get_inode(&path);
        if existing_ino.is_some_and(|ino| self.inodes.read().kind(ino) == Some(InodeKind::Directory)) {
            return Err(FsError::IsDir(path));
        }
        let object = InodeTable::object_name_for(&path, InodeKind::File);

        let existing = match self.backend.stat_object(&object).await {
            Ok(_) if exclusive => return Err(FsError::Exists(path)),
            Ok(attrs) => Some(attrs),
            Err(BackendError::NotFound { .. }) => None,
            Err(e) => return Err(e.into()),
        };
        let expected = existing.as_ref().map(|a| a.generation).unwrap_or(0);

        let ino = self.inodes.write().lookup(&path, InodeKind::File);
        let fh = self.handles.allocate();

        let (attr, pinned, buffer, claim) = if self.config.streaming_writes {
            let mut claim = self.streams.claim(&object, fh).map_err(|owner| {
                FsError::Io(format!("{} is being written through handle {}", object, owner))
            })?;
            let writer = WriterId::new(format!("{}/{}", self.mount_id, fh));
            let stream = self
                .backend
                .open_write_stream(&object, &writer, Some(expected))
                .await?;
            claim.arm(self.backend.clone(), stream.clone());

            let generation = Generation::new(object.clone(), stream.generation, 1);
            self.metadata.update_local_size(ino, fh, 0);
            let attr = self.tracker.observe(FileAttr {
                ino,
                kind: InodeKind::File,
                size: existing.as_ref().map(|a| a.size).unwrap_or(0),
                mtime: Utc::now(),
                generation: Some(generation.clone()),
                content_encoding: None,
                finalized: false,
            });
            let buffer = WriteBuffer::streaming(stream).with_limit(self.config.max_buffered_bytes);
            (attr, Some(generation), buffer, Some(claim))
        } else {
            let attrs = self
                .backend
                .create_object(&object, Bytes::new(), WriteOptions::if_generation_match(expected))
                .await?;
            let attr = self.tracker.observe(FileAttr::from_object(ino, &attrs));
            let buffer = WriteBuffer::buffered(Vec::new()).with_limit(self.config.max_buffered_bytes);
            (attr, Some(attrs.generation()), buffer, None)
        };

        info!(fh, ino, name = %object, streaming = buffer.is_streaming(), "file created");
        self.handles.insert(OpenFile {
            fh,
            ino,
            name: object,
            flags: OpenFlags::READ_WRITE,
            pinned,
            size: 0,
            gzip: false,
            pattern: ReadPattern::new(self.config.content_cache.random_seek_threshold),
            buffer: Some(buffer),
            decoded: None,
            claim,
        });
        Ok((attr, fh))
    }

    async fn read_file(&self, fh: u64, offset: u64, len: u64) -> Result<Bytes> {
        let entry = self.live_entry(fh)?;
        let mut guard = entry.file.lock().await;
        let file = &mut *guard;
        if !file.flags.read {
            return Err(FsError::BadHandle(fh));
        }

        // A writing handle sees its own bytes
        if let Some(buffer) = &file.buffer {
            if let Some(data) = buffer.read_buffered(offset, len) {
                self.metrics.bytes_read(data.len() as u64, ReadType::Buffered);
                return Ok(data);
            }
            if let Some(stream) = buffer.streaming_state() {
                return self.read_streaming(stream, offset, len).await;
            }
        }

        if file.gzip && !self.config.gzip_passthrough {
            if file.decoded.is_none() {
                let raw = self.load_stored(file).await?;
                let decoded = decode_gzip(&raw)?;
                debug!(fh, stored = raw.len(), decoded = decoded.len(), "decoded gzip object");
                file.decoded = Some(decoded);
            }
            let data = file
                .decoded
                .as_ref()
                .map(|decoded| slice_range(decoded, offset, len))
                .unwrap_or_default();
            self.metrics.bytes_read(data.len() as u64, ReadType::Buffered);
            return Ok(data);
        }

        let Some(generation) = file.pinned.clone() else {
            return Ok(Bytes::new());
        };
        let read_type = file.pattern.classify(offset, len);
        let path = ReadPath {
            backend: self.backend.as_ref(),
            cache: &self.content,
            tracker: &self.tracker,
            metrics: self.metrics.as_ref(),
            readahead_blocks: self.config.content_cache.readahead_blocks,
        };
        path.read(ReadRequest {
            ino: file.ino,
            generation: &generation,
            size: file.size,
            offset,
            len,
            read_type,
        })
        .await
    }

    async fn read_streaming(&self, state: &Streaming, offset: u64, len: u64) -> Result<Bytes> {
        let total = state.persisted + state.pending.len() as u64;
        let end = offset.saturating_add(len).min(total);
        if offset >= end {
            return Ok(Bytes::new());
        }

        let mut out = BytesMut::with_capacity((end - offset) as usize);
        if offset < state.persisted {
            let upto = end.min(state.persisted);
            let data = self
                .backend
                .read_range(&state.stream.name, state.stream.generation, offset, upto - offset)
                .await
                .map_err(FsError::from_handle)?;
            out.extend_from_slice(&data);
        }
        if end > state.persisted {
            let from = (offset.max(state.persisted) - state.persisted) as usize;
            let to = (end - state.persisted) as usize;
            out.extend_from_slice(&state.pending[from..to]);
        }
        self.metrics.bytes_read(out.len() as u64, ReadType::Buffered);
        Ok(out.freeze())
    }

    async fn write_file(&self, fh: u64, offset: u64, data: &[u8]) -> Result<usize> {
        self.ensure_writable()?;
        let entry = self.live_entry(fh)?;
        let mut guard = entry.file.lock().await;
        let file = &mut *guard;
        if !file.flags.write {
            return Err(FsError::BadHandle(fh));
        }
        self.ensure_buffer(file).await?;

        let offset = if file.flags.append {
            file.buffer.as_ref().map(WriteBuffer::size).unwrap_or(0)
        } else {
            offset
        };
        if !file.buffer.as_ref().is_some_and(|b| b.fits(offset, data.len())) {
            return Err(FsError::FileTooLarge(format!(
                "{} bytes at offset {} of {}",
                data.len(),
                offset,
                file.name
            )));
        }
        let staged = file.buffer.as_mut().map(|b| b.write(offset, data));
        if staged == Some(Staged::NotAtTail) {
            debug!(fh, offset, "write behind stream tail, switching to buffered");
            self.convert_to_buffered(file).await?;
            if let Some(buffer) = file.buffer.as_mut() {
                buffer.write(offset, data);
            }
        }

        let flush = file
            .buffer
            .as_ref()
            .and_then(WriteBuffer::streaming_state)
            .is_some_and(|s| s.pending.len() as u64 >= self.config.stream_flush_bytes);
        if flush {
            self.append_pending(file).await?;
        }

        let size = file.buffer.as_ref().map(WriteBuffer::size).unwrap_or(0);
        self.metadata.update_local_size(file.ino, fh, size);
        Ok(data.len())
    }

    async fn truncate_file(&self, fh: u64, size: u64) -> Result<()> {
        self.ensure_writable()?;
        let entry = self.live_entry(fh)?;
        let mut guard = entry.file.lock().await;
        let file = &mut *guard;
        if !file.flags.write {
            return Err(FsError::BadHandle(fh));
        }
        self.ensure_buffer(file).await?;

        let current = file.buffer.as_ref().map(WriteBuffer::size);
        if size > self.config.max_buffered_bytes && current != Some(size) {
            return Err(FsError::FileTooLarge(format!("{} to {} bytes", file.name, size)));
        }
        let applied = file.buffer.as_mut().is_some_and(|b| b.set_len(size));
        if !applied {
            self.convert_to_buffered(file).await?;
            if let Some(buffer) = file.buffer.as_mut() {
                buffer.set_len(size);
            }
        }
        self.metadata.update_local_size(file.ino, fh, size);
        Ok(())
    }

    async fn sync_file(&self, fh: u64) -> Result<()> {
        let entry = self.live_entry(fh)?;
        let mut guard = entry.file.lock().await;
        let file = &mut *guard;
        let result = if file.is_streaming() {
            self.append_pending(file).await
        } else {
            self.upload(file).await
        };
        if let Err(FsError::Stale(_)) = &result {
            warn!(fh, name = %file.name, "handle became stale on sync");
            entry.mark_stale();
        }
        result
    }

    async fn release_file(&self, fh: u64) -> Result<()> {
        let entry = self.handles.remove(fh).ok_or(FsError::BadHandle(fh))?;
        // Before any await, so a cancelled release leaves no size behind
        self.metadata.clear_local_size(entry.ino, fh);
        let mut guard = entry.file.lock().await;
        let file = &mut *guard;

        let result = if entry.is_stale() {
            let dirty = file.is_dirty();
            self.abandon_stream(file).await;
            if dirty {
                warn!(fh, name = %file.name, "discarding writes of stale handle");
                Err(FsError::Stale(file.name.clone()))
            } else {
                Ok(())
            }
        } else if file.is_streaming() {
            match self.finalize_stream(file).await {
                Ok(_) => Ok(()),
                Err(e) => {
                    self.abandon_stream(file).await;
                    Err(e)
                }
            }
        } else {
            self.upload(file).await
        };

        file.release_claim();
        trace!(fh, ino = file.ino, ok = result.is_ok(), "handle released");
        result
    }

    /// Make every local write on `ino` durable and finalize local streams.
    pub(crate) async fn flush_inode(&self, ino: u64) -> Result<()> {
        for (fh, entry) in self.handles.for_inode(ino) {
            if entry.is_stale() {
                continue;
            }
            let mut guard = entry.file.lock().await;
            let file = &mut *guard;
            let result = if file.is_streaming() {
                self.convert_to_buffered(file).await
            } else {
                self.upload(file).await
            };
            if let Err(e) = result {
                if matches!(e, FsError::Stale(_)) {
                    entry.mark_stale();
                }
                warn!(fh, ino, error = %e, "failed to flush handle");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Abort every local stream on `ino`. Returns whether any was live.
    pub(crate) async fn abort_local_streams(&self, ino: u64) -> bool {
        let mut aborted = false;
        for (_, entry) in self.handles.for_inode(ino) {
            let mut guard = entry.file.lock().await;
            let file = &mut *guard;
            if file.is_streaming() {
                self.abandon_stream(file).await;
                aborted = true;
            }
        }
        aborted
    }

    /// Load the pinned content into a buffered write buffer on first write.
    async fn ensure_buffer(&self, file: &mut OpenFile) -> Result<()> {
        if file.buffer.is_some() {
            return Ok(());
        }
        let stored = self.load_stored(file).await?;
        let content = if file.gzip && !self.config.gzip_passthrough {
            decode_gzip(&stored)?
        } else {
            stored
        };
        let buffer = WriteBuffer::buffered(content.to_vec()).with_limit(self.config.max_buffered_bytes);
        file.buffer = Some(buffer);
        Ok(())
    }

    async fn load_stored(&self, file: &OpenFile) -> Result<Bytes> {
        let Some(generation) = &file.pinned else {
            return Ok(Bytes::new());
        };
        self.backend
            .read_range(&generation.name, generation.generation, 0, file.size)
            .await
            .map_err(FsError::from_handle)
    }

    async fn append_pending(&self, file: &mut OpenFile) -> Result<()> {
        let Some(buffer) = file.buffer.as_mut() else {
            return Ok(());
        };
        let Some(stream) = buffer.streaming_state().map(|s| s.stream.clone()) else {
            return Ok(());
        };
        let Some(data) = buffer.take_pending() else {
            return Ok(());
        };
        let len = data.len() as u64;
        match self.backend.append_stream(&stream, data.clone()).await {
            Ok(persisted) => {
                buffer.mark_appended(len);
                trace!(name = %stream.name, appended = len, persisted, "stream append");
                Ok(())
            }
            Err(e) => {
                buffer.restore_pending(data);
                Err(FsError::from_handle(e))
            }
        }
    }

    /// Append what is pending and finalize the handle's stream.
    async fn finalize_stream(&self, file: &mut OpenFile) -> Result<Option<ObjectAttrs>> {
        let Some(stream) = file
            .buffer
            .as_ref()
            .and_then(WriteBuffer::streaming_state)
            .map(|s| s.stream.clone())
        else {
            return Ok(None);
        };
        self.append_pending(file).await?;
        let attrs = self
            .backend
            .finalize_stream(&stream)
            .await
            .map_err(FsError::from_handle)?;

        file.release_claim();
        self.tracker.observe(FileAttr::from_object(file.ino, &attrs));
        file.pinned = Some(attrs.generation());
        file.size = attrs.size;
        file.gzip = attrs.is_gzip();
        info!(name = %attrs.name, generation = attrs.generation, size = attrs.size, "stream finalized");
        Ok(Some(attrs))
    }

    /// Finalize the stream and continue with a buffered copy of its content.
    async fn convert_to_buffered(&self, file: &mut OpenFile) -> Result<()> {
        let Some(attrs) = self.finalize_stream(file).await? else {
            return Ok(());
        };
        let content = self
            .backend
            .read_range(&attrs.name, attrs.generation, 0, attrs.size)
            .await
            .map_err(FsError::from_handle)?;
        let buffer = WriteBuffer::buffered(content.to_vec()).with_limit(self.config.max_buffered_bytes);
        file.buffer = Some(buffer);
        debug!(fh = file.fh, name = %attrs.name, size = attrs.size, "handle converted to buffered");
        Ok(())
    }

    /// Upload a dirty buffer as a new generation of the pinned object.
    async fn upload(&self, file: &mut OpenFile) -> Result<()> {
        let Some(content) = file
            .buffer
            .as_ref()
            .filter(|b| b.is_dirty())
            .and_then(WriteBuffer::content)
        else {
            return Ok(());
        };
        let expected = file.pinned.as_ref().map(|g| g.generation).unwrap_or(0);
        let mut options = WriteOptions::if_generation_match(expected);
        if file.gzip && self.config.gzip_passthrough {
            options = options.with_content_encoding("gzip");
        }

        let attrs = self
            .backend
            .create_object(&file.name, content, options)
            .await?;
        self.tracker.observe(FileAttr::from_object(file.ino, &attrs));
        debug!(
            fh = file.fh,
            name = %attrs.name,
            previous = expected,
            generation = attrs.generation,
            size = attrs.size,
            "buffer uploaded"
        );
        file.pinned = Some(attrs.generation());
        file.size = attrs.size;
        if let Some(buffer) = file.buffer.as_mut() {
            buffer.mark_clean();
        }
        Ok(())
    }

    /// Abort the handle's stream, if any, and drop its buffer.
    async fn abandon_stream(&self, file: &mut OpenFile) {
        let Some(stream) = file
            .buffer
            .as_ref()
            .and_then(WriteBuffer::streaming_state)
            .map(|s| s.stream.clone())
        else {
            return;
        };
        if let Err(e) = self.backend.abort_stream(&stream).await {
            warn!(name = %stream.name, stream = stream.id, error = %e, "failed to abort stream");
        }
        file.release_claim();
        file.buffer = None;
        info!(fh = file.fh, name = %stream.name, "stream abandoned");
    }
}
