//! The mounted filesystem: namespace operations.
//!
//! `BucketFs` owns every cache of one mount and exposes inode-oriented
//! operations in the shape a FUSE binding would call them. File handle
//! operations (open, read, write, sync, release) live in `file_ops`.

use std::sync::Arc;
use std::time::Instant;

use backend::{BackendError, MetricsSink, NoopMetrics, ObjectBackend, WriteOptions};
use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::attr::{CacheStats, DirEntry, FileAttr};
use crate::clock::{Clock, SystemClock};
use crate::config::MountConfig;
use crate::content_cache::ContentCache;
use crate::error::{FsError, Result};
use crate::generation::GenerationTracker;
use crate::handle::HandleTable;
use crate::inode_table::{InodeKind, InodeTable};
use crate::locks::InodeLocks;
use crate::metadata_cache::MetadataCache;
use crate::rename::RenameOp;
use crate::write_buffer::StreamRegistry;

pub struct BucketFs {
    pub(crate) backend: Arc<dyn ObjectBackend>,
    pub(crate) config: MountConfig,
    pub(crate) mount_id: Uuid,
    pub(crate) inodes: RwLock<InodeTable>,
    pub(crate) handles: HandleTable,
    pub(crate) streams: StreamRegistry,
    pub(crate) locks: Arc<InodeLocks>,
    pub(crate) metadata: Arc<MetadataCache>,
    pub(crate) content: ContentCache,
    pub(crate) tracker: GenerationTracker,
    pub(crate) metrics: Arc<dyn MetricsSink>,
}

impl BucketFs {
    pub const ROOT_INODE: u64 = InodeTable::ROOT_INODE;

    pub fn new(backend: Arc<dyn ObjectBackend>, config: MountConfig) -> Result<Self> {
        Self::with_clock(backend, config, Arc::new(SystemClock))
    }

    /// Build a mount whose metadata expiry is measured on `clock`.
    pub fn with_clock(
        backend: Arc<dyn ObjectBackend>,
        config: MountConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| FsError::InvalidArgument(errors.join("; ")))?;

        let locks = Arc::new(InodeLocks::new());
        let metadata = Arc::new(MetadataCache::new(config.metadata_ttl(), clock));
        let content = ContentCache::new(&config.content_cache);
        let tracker = GenerationTracker::new(metadata.clone(), content.clone(), locks.clone());
        let mount_id = Uuid::new_v4();

        info!(
            %mount_id,
            metadata_ttl_secs = config.metadata_cache_ttl_secs,
            block_size = config.content_cache.block_size_bytes,
            gzip_passthrough = config.gzip_passthrough,
            streaming_writes = config.streaming_writes,
            read_only = config.read_only,
            "mount initialized"
        );

        Ok(Self {
            backend,
            config,
            mount_id,
            inodes: RwLock::new(InodeTable::new()),
            handles: HandleTable::new(),
            streams: StreamRegistry::new(),
            locks,
            metadata,
            content,
            tracker,
            metrics: Arc::new(NoopMetrics),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn mount_id(&self) -> Uuid {
        self.mount_id
    }

    /// Look up a child of a directory, counting one kernel reference on the
    /// returned inode.
    #[instrument(name = "BucketFs::lookup", skip(self))]
    pub async fn lookup(&self, parent: u64, name: &str) -> Result<FileAttr> {
        let started = Instant::now();
        let result = self.resolve_child(parent, name, true).await;
        self.record("lookup", started, result)
    }

    #[instrument(name = "BucketFs::getattr", skip(self))]
    pub async fn getattr(&self, ino: u64) -> Result<FileAttr> {
        let started = Instant::now();
        let result = self.attr_of(ino).await;
        self.record("getattr", started, result)
    }

    /// Resolve a mount-relative path without taking kernel references.
    #[instrument(name = "BucketFs::stat", skip(self))]
    pub async fn stat(&self, path: &str) -> Result<FileAttr> {
        let started = Instant::now();
        let result = self.resolve_path(path).await;
        self.record("stat", started, result)
    }

    #[instrument(name = "BucketFs::readdir", skip(self))]
    pub async fn readdir(&self, ino: u64) -> Result<Vec<DirEntry>> {
        let started = Instant::now();
        let result = self.list_dir(ino).await;
        self.record("readdir", started, result)
    }

    #[instrument(name = "BucketFs::mkdir", skip(self))]
    pub async fn mkdir(&self, parent: u64, name: &str) -> Result<FileAttr> {
        let started = Instant::now();
        let result = self.make_dir(parent, name).await;
        self.record("mkdir", started, result)
    }

    #[instrument(name = "BucketFs::rmdir", skip(self))]
    pub async fn rmdir(&self, parent: u64, name: &str) -> Result<()> {
        let started = Instant::now();
        let result = self.remove_dir(parent, name).await;
        self.record("rmdir", started, result)
    }

    #[instrument(name = "BucketFs::unlink", skip(self))]
    pub async fn unlink(&self, parent: u64, name: &str) -> Result<()> {
        let started = Instant::now();
        let result = self.remove_file(parent, name).await;
        self.record("unlink", started, result)
    }

    /// Rename a file. Directories cannot be renamed.
    #[instrument(name = "BucketFs::rename", skip(self))]
    pub async fn rename(
        &self,
        parent: u64,
        name: &str,
        new_parent: u64,
        new_name: &str,
    ) -> Result<()> {
        let started = Instant::now();
        let result = self.rename_file(parent, name, new_parent, new_name).await;
        self.record("rename", started, result)
    }

    /// Drop `count` kernel references. The inode and its cached state are
    /// evicted once no references, open handles or unsynced writes remain.
    pub fn forget(&self, ino: u64, count: u64) {
        let unreferenced = self.inodes.write().forget(ino, count);
        if !unreferenced
            || self.handles.has_inode(ino)
            || self.metadata.local_size(ino).is_some()
        {
            return;
        }
        if let Some(path) = self.inodes.write().remove(ino) {
            debug!(ino, path = %path, "evicting inode");
        }
        self.tracker.forget(ino);
        self.locks.remove(ino);
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            metadata_entries: self.metadata.len() as u64,
            content_blocks: self.content.block_count(),
            content_bytes: self.content.weighted_size(),
            content_hits: self.content.hits(),
            content_misses: self.content.misses(),
            inodes: self.inodes.read().len() as u64,
            open_handles: self.handles.len() as u64,
        }
    }

    pub(crate) fn record<T>(&self, op: &'static str, started: Instant, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.metrics.op_completed(op, started.elapsed()),
            Err(e) => {
                debug!(op, error = %e, "operation failed");
                self.metrics.op_failed(op, e.category());
            }
        }
        result
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.config.read_only {
            return Err(FsError::ReadOnly);
        }
        Ok(())
    }

    /// Path and kind of a directory inode
    pub(crate) fn dir_path(&self, ino: u64) -> Result<String> {
        let inodes = self.inodes.read();
        let path = inodes
            .get_path(ino)
            .ok_or_else(|| FsError::NotFound(format!("inode {}", ino)))?;
        match inodes.kind(ino) {
            Some(InodeKind::Directory) => Ok(path.to_string()),
            _ => Err(FsError::NotDir(path.to_string())),
        }
    }

    pub(crate) fn child_path(&self, parent: u64, name: &str) -> Result<String> {
        let parent_path = self.dir_path(parent)?;
        Ok(InodeTable::join(&parent_path, name))
    }

    async fn resolve_path(&self, path: &str) -> Result<FileAttr> {
        let mut attr = FileAttr::directory(Self::ROOT_INODE);
        for component in path.split('/').filter(|c| !c.is_empty()) {
            if !attr.is_dir() {
                return Err(FsError::NotDir(path.to_string()));
            }
            attr = self.resolve_child(attr.ino, component, false).await?;
        }
        Ok(attr)
    }

    pub(crate) async fn resolve_child(&self, parent: u64, name: &str, count_lookup: bool) -> Result<FileAttr> {
        if !is_valid_name(name) {
            debug!(parent, name = ?name, "rejecting invalid name");
            return Err(FsError::NotFound(name.escape_debug().to_string()));
        }
        let path = self.child_path(parent, name)?;

        let existing = self.inodes.read().get_inode(&path);
        if let Some(ino) = existing {
            if let Some(attr) = self.metadata.lookup(ino) {
                if count_lookup {
                    self.inodes.write().lookup(&path, attr.kind);
                }
                return Ok(attr);
            }
        }

        let object = InodeTable::object_name_for(&path, InodeKind::File);
        match self.backend.stat_object(&object).await {
            Ok(attrs) => {
                let ino = self.inode_for(&path, InodeKind::File, count_lookup);
                Ok(self.tracker.observe(FileAttr::from_object(ino, &attrs)))
            }
            Err(BackendError::NotFound { .. }) => {
                let prefix = InodeTable::object_name_for(&path, InodeKind::Directory);
                let listing = self.backend.list_objects(&prefix, Some('/')).await?;
                if listing.objects.is_empty() && listing.prefixes.is_empty() {
                    if let Some(ino) = existing {
                        self.tracker.forget(ino);
                    }
                    return Err(FsError::NotFound(path));
                }
                let ino = self.inode_for(&path, InodeKind::Directory, count_lookup);
                let attr = FileAttr::directory(ino);
                self.metadata.insert(attr.clone());
                Ok(attr)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn inode_for(&self, path: &str, kind: InodeKind, count_lookup: bool) -> u64 {
        let mut inodes = self.inodes.write();
        if count_lookup {
            inodes.lookup(path, kind)
        } else {
            inodes.get_or_create(path, kind)
        }
    }

    async fn attr_of(&self, ino: u64) -> Result<FileAttr> {
        if ino == Self::ROOT_INODE {
            return Ok(FileAttr::directory(ino));
        }
        if let Some(attr) = self.metadata.lookup(ino) {
            return Ok(attr);
        }
        let (name, kind) = {
            let inodes = self.inodes.read();
            let name = inodes
                .object_name(ino)
                .ok_or_else(|| FsError::NotFound(format!("inode {}", ino)))?;
            let kind = inodes.kind(ino).unwrap_or(InodeKind::File);
            (name, kind)
        };
        match kind {
            InodeKind::Directory => {
                let attr = FileAttr::directory(ino);
                self.metadata.insert(attr.clone());
                Ok(attr)
            }
            InodeKind::File => self.tracker.refresh(self.backend.as_ref(), ino, &name).await,
        }
    }

    async fn list_dir(&self, ino: u64) -> Result<Vec<DirEntry>> {
        let dir = self.dir_path(ino)?;
        let prefix = InodeTable::object_name_for(&dir, InodeKind::Directory);
        let listing = self.backend.list_objects(&prefix, Some('/')).await?;

        let mut entries = Vec::with_capacity(listing.objects.len() + listing.prefixes.len());
        for object in &listing.objects {
            // The directory's own placeholder
            if object.name == prefix {
                continue;
            }
            let name = InodeTable::filename(&object.name).to_string();
            if !is_valid_name(&name) {
                debug!(object = %object.name, "skipping object with unrepresentable name");
                continue;
            }
            let path = InodeTable::join(&dir, &name);
            let child = self.inodes.write().get_or_create(&path, InodeKind::File);
            self.tracker.observe(FileAttr::from_object(child, object));
            entries.push(DirEntry {
                ino: child,
                name,
                kind: InodeKind::File,
            });
        }
        for sub in &listing.prefixes {
            let name = InodeTable::filename(sub).to_string();
            if !is_valid_name(&name) || entries.iter().any(|e| e.name == name) {
                continue;
            }
            let path = InodeTable::join(&dir, &name);
            let child = self.inodes.write().get_or_create(&path, InodeKind::Directory);
            entries.push(DirEntry {
                ino: child,
                name,
                kind: InodeKind::Directory,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn make_dir(&self, parent: u64, name: &str) -> Result<FileAttr> {
        self.ensure_writable()?;
        validate_new_name(name)?;
        let path = self.child_path(parent, name)?;

        let file = InodeTable::object_name_for(&path, InodeKind::File);
        match self.backend.stat_object(&file).await {
            Ok(_) => return Err(FsError::Exists(path)),
            Err(BackendError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let prefix = InodeTable::object_name_for(&path, InodeKind::Directory);
        match self
            .backend
            .create_object(&prefix, Default::default(), WriteOptions::if_not_exists())
            .await
        {
            Ok(_) => {}
            Err(BackendError::PreconditionFailed { .. }) => return Err(FsError::Exists(path)),
            Err(e) => return Err(e.into()),
        }

        let ino = self.inodes.write().lookup(&path, InodeKind::Directory);
        let attr = FileAttr::directory(ino);
        self.metadata.insert(attr.clone());
        info!(path = %path, ino, "directory created");
        Ok(attr)
    }

    async fn remove_dir(&self, parent: u64, name: &str) -> Result<()> {
        self.ensure_writable()?;
        validate_new_name(name)?;
        let path = self.child_path(parent, name)?;
        let prefix = InodeTable::object_name_for(&path, InodeKind::Directory);

        let listing = self.backend.list_objects(&prefix, Some('/')).await?;
        let placeholder = listing.objects.iter().find(|o| o.name == prefix);
        let has_children = !listing.prefixes.is_empty()
            || listing.objects.iter().any(|o| o.name != prefix);
        if has_children {
            return Err(FsError::NotEmpty(path));
        }
        let Some(placeholder) = placeholder else {
            let file = InodeTable::object_name_for(&path, InodeKind::File);
            return match self.backend.stat_object(&file).await {
                Ok(_) => Err(FsError::NotDir(path)),
                Err(BackendError::NotFound { .. }) => Err(FsError::NotFound(path)),
                Err(e) => Err(e.into()),
            };
        };

        self.backend
            .delete_object(&prefix, placeholder.generation)
            .await?;

        let removed = self.inodes.write().remove_by_path(&path);
        if let Some(ino) = removed {
            self.metadata.invalidate(ino);
        }
        info!(path = %path, "directory removed");
        Ok(())
    }

    async fn remove_file(&self, parent: u64, name: &str) -> Result<()> {
        self.ensure_writable()?;
        validate_new_name(name)?;
        let path = self.child_path(parent, name)?;
        let object = InodeTable::object_name_for(&path, InodeKind::File);
        let ino = self.inodes.read().get_inode(&path);

        if ino.is_some_and(|ino| self.inodes.read().kind(ino) == Some(InodeKind::Directory)) {
            return Err(FsError::IsDir(path));
        }

        // Local streams on the object are abandoned, not finalized
        let mut aborted = false;
        if let Some(ino) = ino {
            aborted = self.abort_local_streams(ino).await;
        }

        match self.backend.stat_object(&object).await {
            Ok(attrs) => {
                self.backend
                    .delete_object(&object, attrs.generation)
                    .await?;
            }
            Err(BackendError::NotFound { .. }) if aborted => {}
            Err(BackendError::NotFound { .. }) => {
                let prefix = InodeTable::object_name_for(&path, InodeKind::Directory);
                let listing = self.backend.list_objects(&prefix, Some('/')).await?;
                if listing.objects.is_empty() && listing.prefixes.is_empty() {
                    return Err(FsError::NotFound(path));
                }
                return Err(FsError::IsDir(path));
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(ino) = ino {
            let stale = self.handles.mark_stale(ino, None);
            self.tracker.forget(ino);
            self.metadata.forget_local_sizes(ino);
            self.inodes.write().remove_by_path(&path);
            debug!(ino, stale_handles = stale, "unlinked inode");
        }
        info!(path = %path, "file removed");
        Ok(())
    }

    async fn rename_file(
        &self,
        parent: u64,
        name: &str,
        new_parent: u64,
        new_name: &str,
    ) -> Result<()> {
        self.ensure_writable()?;
        validate_new_name(name)?;
        validate_new_name(new_name)?;
        let src_path = self.child_path(parent, name)?;
        let dst_path = self.child_path(new_parent, new_name)?;
        if src_path == dst_path {
            return Ok(());
        }

        let src_ino = self.inodes.read().get_inode(&src_path);
        if src_ino.is_some_and(|ino| self.inodes.read().kind(ino) == Some(InodeKind::Directory)) {
            return Err(FsError::Unsupported(format!("directory rename: {}", src_path)));
        }
        let src_object = InodeTable::object_name_for(&src_path, InodeKind::File);
        let dst_object = InodeTable::object_name_for(&dst_path, InodeKind::File);

        // Local writes must be durable before the source is pinned
        if let Some(ino) = src_ino {
            self.flush_inode(ino).await?;
        }

        let source = match self.backend.stat_object(&src_object).await {
            Ok(attrs) => attrs,
            Err(BackendError::NotFound { .. }) => {
                let prefix = InodeTable::object_name_for(&src_path, InodeKind::Directory);
                let listing = self.backend.list_objects(&prefix, Some('/')).await?;
                if listing.objects.is_empty() && listing.prefixes.is_empty() {
                    return Err(FsError::NotFound(src_path));
                }
                return Err(FsError::Unsupported(format!("directory rename: {}", src_path)));
            }
            Err(e) => return Err(e.into()),
        };
        if !source.finalized {
            warn!(source = %src_object, "refusing to rename object with a foreign write stream");
            return Err(FsError::Io(format!(
                "{} is being written by another writer",
                src_object
            )));
        }

        info!(source = %source.generation(), destination = %dst_object, "renaming");
        let mut op = RenameOp::new(source.generation(), dst_object);
        let destination = op.run(self.backend.as_ref()).await?;

        let (moved, replaced) = {
            let mut inodes = self.inodes.write();
            match inodes.rename(&src_path, &dst_path) {
                Some((moved, replaced)) => (moved, replaced),
                None => {
                    let moved = inodes.get_or_create(&dst_path, InodeKind::File);
                    (moved, None)
                }
            }
        };
        if let Some(replaced) = replaced {
            self.handles.mark_stale(replaced, None);
            self.tracker.forget(replaced);
            self.metadata.forget_local_sizes(replaced);
        }

        let stale = self.handles.mark_stale(moved, None);
        self.metadata.forget_local_sizes(moved);
        self.tracker.forget(moved);
        self.tracker.observe(FileAttr::from_object(moved, &destination));
        debug!(ino = moved, stale_handles = stale, "rename applied to inode table");
        Ok(())
    }
}

impl std::fmt::Debug for BucketFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketFs")
            .field("mount_id", &self.mount_id)
            .field("config", &self.config)
            .field("open_handles", &self.handles.len())
            .finish()
    }
}

/// Names that can never map to an object this mount can address
pub(crate) fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\n')
        && !name.contains('\r')
}

pub(crate) fn validate_new_name(name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(FsError::InvalidArgument(name.escape_debug().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_validation() {
        assert!(is_valid_name("file.txt"));
        assert!(is_valid_name("with space"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("\n"));
        assert!(!is_valid_name("name\r"));
        assert!(!is_valid_name("a/b"));
        assert!(!is_valid_name(".."));
        assert!(matches!(
            validate_new_name("bad\n"),
            Err(FsError::InvalidArgument(_))
        ));
    }
}
