//! Time-bounded attribute cache keyed by inode.
//!
//! Expiry is measured on an injected [`Clock`], so staleness windows can be
//! tested without sleeping. A TTL of zero disables the cache: every lookup
//! misses and inserts are dropped.
//!
//! Sizes written locally are tracked per handle, separately from cached
//! entries. They never expire, and the most recent one overrides the size of
//! whatever attributes the mount serves for that inode until every writing
//! handle on it is released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::trace;

use crate::attr::FileAttr;
use crate::clock::Clock;

#[derive(Debug, Clone)]
struct Entry {
    attr: FileAttr,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct LocalSize {
    size: u64,
    mtime: DateTime<Utc>,
    /// Write order across handles
    seq: u64,
}

#[derive(Debug, Default)]
struct LocalSizes {
    by_inode: HashMap<u64, HashMap<u64, LocalSize>>,
    next_seq: u64,
}

impl LocalSizes {
    fn latest(&self, ino: u64) -> Option<LocalSize> {
        self.by_inode
            .get(&ino)?
            .values()
            .max_by_key(|local| local.seq)
            .copied()
    }
}

#[derive(Debug)]
pub struct MetadataCache {
    entries: Mutex<HashMap<u64, Entry>>,
    local_sizes: Mutex<LocalSizes>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl MetadataCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            local_sizes: Mutex::new(LocalSizes::default()),
            ttl,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// Cached attributes, if present and unexpired.
    pub fn lookup(&self, ino: u64) -> Option<FileAttr> {
        if !self.is_enabled() {
            return None;
        }
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match entries.get(&ino) {
            Some(entry) if entry.expires_at > now => Some(self.overlay(entry.attr.clone())),
            Some(_) => {
                trace!(ino, "metadata entry expired");
                entries.remove(&ino);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, attr: FileAttr) {
        self.insert_with_ttl(attr, self.ttl);
    }

    pub fn insert_with_ttl(&self, attr: FileAttr, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        if entries.len() < before {
            trace!(swept = before - entries.len(), "swept expired metadata entries");
        }
        entries.insert(
            attr.ino,
            Entry {
                attr,
                expires_at: now + ttl,
            },
        );
    }

    pub fn invalidate(&self, ino: u64) {
        self.entries.lock().remove(&ino);
    }

    /// Record the size handle `fh` has produced, updating any cached entry
    /// in place.
    pub fn update_local_size(&self, ino: u64, fh: u64, size: u64) {
        let mtime = Utc::now();
        {
            let mut local = self.local_sizes.lock();
            local.next_seq += 1;
            let seq = local.next_seq;
            local
                .by_inode
                .entry(ino)
                .or_default()
                .insert(fh, LocalSize { size, mtime, seq });
        }
        if let Some(entry) = self.entries.lock().get_mut(&ino) {
            entry.attr.size = size;
            entry.attr.mtime = mtime;
        }
    }

    /// Drop the local size of one handle. Sizes of other handles on the same
    /// inode stay in effect.
    pub fn clear_local_size(&self, ino: u64, fh: u64) {
        let mut local = self.local_sizes.lock();
        if let Some(handles) = local.by_inode.get_mut(&ino) {
            handles.remove(&fh);
            if handles.is_empty() {
                local.by_inode.remove(&ino);
            }
        }
    }

    /// Drop the local sizes of every handle on `ino`.
    pub fn forget_local_sizes(&self, ino: u64) {
        self.local_sizes.lock().by_inode.remove(&ino);
    }

    pub fn local_size(&self, ino: u64) -> Option<u64> {
        self.local_sizes.lock().latest(ino).map(|l| l.size)
    }

    /// Apply a pending local size to attributes obtained elsewhere.
    pub fn overlay(&self, mut attr: FileAttr) -> FileAttr {
        if let Some(local) = self.local_sizes.lock().latest(attr.ino) {
            attr.size = local.size;
            attr.mtime = local.mtime;
        }
        attr
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
