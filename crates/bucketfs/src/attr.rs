//! Attributes handed back to the kernel.

use backend::{Generation, ObjectAttrs};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::inode_table::InodeKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileAttr {
    pub ino: u64,
    pub kind: InodeKind,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    /// Backing generation. `None` for directories.
    pub generation: Option<Generation>,
    pub content_encoding: Option<String>,
    /// False while another writer's stream is open on the object
    pub finalized: bool,
}

impl FileAttr {
    pub fn from_object(ino: u64, attrs: &ObjectAttrs) -> Self {
        Self {
            ino,
            kind: InodeKind::File,
            size: attrs.size,
            mtime: attrs.updated,
            generation: Some(attrs.generation()),
            content_encoding: attrs.content_encoding.clone(),
            finalized: attrs.finalized,
        }
    }

    pub fn directory(ino: u64) -> Self {
        Self {
            ino,
            kind: InodeKind::Directory,
            size: 0,
            mtime: DateTime::<Utc>::UNIX_EPOCH,
            generation: None,
            content_encoding: None,
            finalized: true,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == InodeKind::Directory
    }

    pub fn is_gzip(&self) -> bool {
        self.content_encoding
            .as_deref()
            .is_some_and(|enc| enc.eq_ignore_ascii_case("gzip"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub ino: u64,
    pub name: String,
    pub kind: InodeKind,
}

/// Snapshot of cache occupancy for one mount
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub metadata_entries: u64,
    pub content_blocks: u64,
    pub content_bytes: u64,
    pub content_hits: u64,
    pub content_misses: u64,
    pub inodes: u64,
    pub open_handles: u64,
}
