//! Bidirectional inode ↔ path mapping
//!
//! Paths are mount-relative with a leading slash (`/dir/file.txt`). Object
//! names are bucket-relative without one; directories are addressed by their
//! prefix (`dir/`), and the root by the empty prefix.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InodeKind {
    File,
    Directory,
}

#[derive(Debug)]
struct InodeEntry {
    path: String,
    kind: InodeKind,
    /// Kernel lookup references not yet forgotten
    lookups: u64,
}

/// Bidirectional mapping between inodes and paths
#[derive(Debug)]
pub struct InodeTable {
    path_to_inode: HashMap<String, u64>,
    inodes: HashMap<u64, InodeEntry>,
    /// Next available inode number (starts at 2, as 1 is reserved for root)
    next_inode: AtomicU64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    /// Root inode number (always 1 in FUSE)
    pub const ROOT_INODE: u64 = 1;

    pub fn new() -> Self {
        let mut table = Self {
            path_to_inode: HashMap::new(),
            inodes: HashMap::new(),
            next_inode: AtomicU64::new(2),
        };
        table.path_to_inode.insert("/".to_string(), Self::ROOT_INODE);
        table.inodes.insert(
            Self::ROOT_INODE,
            InodeEntry {
                path: "/".to_string(),
                kind: InodeKind::Directory,
                lookups: 0,
            },
        );
        table
    }

    /// Get or create an inode for a path. An existing entry whose kind
    /// changed (file replaced by a directory of the same name) is re-kinded.
    pub fn get_or_create(&mut self, path: &str, kind: InodeKind) -> u64 {
        let normalized = Self::normalize_path(path);

        if let Some(&inode) = self.path_to_inode.get(&normalized) {
            if let Some(entry) = self.inodes.get_mut(&inode) {
                if inode != Self::ROOT_INODE {
                    entry.kind = kind;
                }
            }
            return inode;
        }

        let inode = self.next_inode.fetch_add(1, Ordering::SeqCst);
        self.path_to_inode.insert(normalized.clone(), inode);
        self.inodes.insert(
            inode,
            InodeEntry {
                path: normalized,
                kind,
                lookups: 0,
            },
        );
        inode
    }

    /// Like [`get_or_create`](Self::get_or_create), counting one kernel lookup reference.
    pub fn lookup(&mut self, path: &str, kind: InodeKind) -> u64 {
        let inode = self.get_or_create(path, kind);
        if let Some(entry) = self.inodes.get_mut(&inode) {
            entry.lookups += 1;
        }
        inode
    }

    /// Drop `count` lookup references. Returns true once none remain.
    pub fn forget(&mut self, inode: u64, count: u64) -> bool {
        match self.inodes.get_mut(&inode) {
            Some(entry) => {
                entry.lookups = entry.lookups.saturating_sub(count);
                entry.lookups == 0 && inode != Self::ROOT_INODE
            }
            None => false,
        }
    }

    pub fn get_inode(&self, path: &str) -> Option<u64> {
        self.path_to_inode.get(&Self::normalize_path(path)).copied()
    }

    pub fn get_path(&self, inode: u64) -> Option<&str> {
        self.inodes.get(&inode).map(|e| e.path.as_str())
    }

    pub fn kind(&self, inode: u64) -> Option<InodeKind> {
        self.inodes.get(&inode).map(|e| e.kind)
    }

    /// Backend object name (or prefix, for directories) for an inode
    pub fn object_name(&self, inode: u64) -> Option<String> {
        self.inodes
            .get(&inode)
            .map(|e| Self::object_name_for(&e.path, e.kind))
    }

    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }

    /// Remove an inode and its path mapping. The root is never removed.
    pub fn remove(&mut self, inode: u64) -> Option<String> {
        if inode == Self::ROOT_INODE {
            return None;
        }
        let entry = self.inodes.remove(&inode)?;
        if self.path_to_inode.get(&entry.path) == Some(&inode) {
            self.path_to_inode.remove(&entry.path);
        }
        Some(entry.path)
    }

    /// Unlink a path from its inode, leaving the inode itself addressable
    /// until forgotten.
    pub fn remove_by_path(&mut self, path: &str) -> Option<u64> {
        let normalized = Self::normalize_path(path);
        if normalized == "/" {
            return None;
        }
        self.path_to_inode.remove(&normalized)
    }

    /// Move an inode to a new path. Any inode previously at `new_path` loses
    /// its path mapping and is returned alongside the moved inode.
    pub fn rename(&mut self, old_path: &str, new_path: &str) -> Option<(u64, Option<u64>)> {
        let old_normalized = Self::normalize_path(old_path);
        let new_normalized = Self::normalize_path(new_path);

        let inode = self.path_to_inode.remove(&old_normalized)?;
        let replaced = self.path_to_inode.insert(new_normalized.clone(), inode);
        if let Some(entry) = self.inodes.get_mut(&inode) {
            entry.path = new_normalized;
        }
        Some((inode, replaced.filter(|&r| r != inode)))
    }

    /// Normalize a path to a consistent format: leading slash, no trailing slash
    pub fn normalize_path(path: &str) -> String {
        if path.is_empty() || path == "/" {
            return "/".to_string();
        }

        let mut normalized = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };

        while normalized.len() > 1 && normalized.ends_with('/') {
            normalized.pop();
        }

        normalized
    }

    pub fn object_name_for(path: &str, kind: InodeKind) -> String {
        let normalized = Self::normalize_path(path);
        if normalized == "/" {
            return String::new();
        }
        let name = &normalized[1..];
        match kind {
            InodeKind::File => name.to_string(),
            InodeKind::Directory => format!("{}/", name),
        }
    }

    /// Get the filename component of a path
    pub fn filename(path: &str) -> &str {
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            return "";
        }

        match trimmed.rfind('/') {
            Some(pos) => &trimmed[pos + 1..],
            None => trimmed,
        }
    }

    pub fn join(parent: &str, name: &str) -> String {
        let parent = Self::normalize_path(parent);
        if parent == "/" {
            format!("/{}", name)
        } else {
            format!("{}/{}", parent, name)
        }
    }
}
