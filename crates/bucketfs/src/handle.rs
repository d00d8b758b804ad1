//! Open file handles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use backend::Generation;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::read_path::ReadPattern;
use crate::write_buffer::{StreamClaim, WriteBuffer};

/// Access mode and the status flags the mount acts on, decoded from raw
/// `open(2)` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub truncate: bool,
    pub append: bool,
}

impl OpenFlags {
    pub const READ_ONLY: Self = Self {
        read: true,
        write: false,
        truncate: false,
        append: false,
    };

    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
        truncate: false,
        append: false,
    };

    pub fn from_raw(flags: i32) -> Self {
        let (read, write) = match flags & libc::O_ACCMODE {
            libc::O_WRONLY => (false, true),
            libc::O_RDWR => (true, true),
            _ => (true, false),
        };
        Self {
            read,
            write,
            truncate: write && flags & libc::O_TRUNC != 0,
            append: flags & libc::O_APPEND != 0,
        }
    }

    pub fn truncating(mut self) -> Self {
        self.truncate = true;
        self
    }
}

/// Per-handle state. Guarded by an async mutex so operations on one handle
/// run in issuance order.
#[derive(Debug)]
pub struct OpenFile {
    pub fh: u64,
    pub ino: u64,
    /// Object name at open time
    pub name: String,
    pub flags: OpenFlags,
    /// Generation the handle reads from. `None` until the first upload of a
    /// file that did not exist at open.
    pub pinned: Option<Generation>,
    /// Stored size of the pinned generation
    pub size: u64,
    pub gzip: bool,
    pub pattern: ReadPattern,
    /// Present once the handle has written (or was opened to write)
    pub buffer: Option<WriteBuffer>,
    /// Whole decoded content, when serving gzip objects decoded
    pub decoded: Option<Bytes>,
    /// Held while the handle owns a live stream
    pub claim: Option<StreamClaim>,
}

impl OpenFile {
    pub fn is_dirty(&self) -> bool {
        self.buffer.as_ref().is_some_and(WriteBuffer::is_dirty)
    }

    pub fn is_streaming(&self) -> bool {
        self.buffer.as_ref().is_some_and(WriteBuffer::is_streaming)
    }

    /// Give up stream ownership once the stream is finalized or aborted.
    pub fn release_claim(&mut self) {
        if let Some(mut claim) = self.claim.take() {
            claim.defuse();
        }
    }
}

/// Table entry for an open handle. The stale flag sits outside the handle
/// mutex so other operations can mark a handle stale while it is busy.
#[derive(Debug, Clone)]
pub struct HandleEntry {
    pub ino: u64,
    pub stale: Arc<AtomicBool>,
    pub file: Arc<tokio::sync::Mutex<OpenFile>>,
}

impl HandleEntry {
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }
}

/// Open handles of one mount
#[derive(Debug)]
pub struct HandleTable {
    next_fh: AtomicU64,
    entries: Mutex<HashMap<u64, HandleEntry>>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn allocate(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, file: OpenFile) -> HandleEntry {
        let fh = file.fh;
        let entry = HandleEntry {
            ino: file.ino,
            stale: Arc::new(AtomicBool::new(false)),
            file: Arc::new(tokio::sync::Mutex::new(file)),
        };
        self.entries.lock().insert(fh, entry.clone());
        entry
    }

    pub fn get(&self, fh: u64) -> Option<HandleEntry> {
        self.entries.lock().get(&fh).cloned()
    }

    pub fn remove(&self, fh: u64) -> Option<HandleEntry> {
        self.entries.lock().remove(&fh)
    }

    /// Handles currently open on an inode
    pub fn for_inode(&self, ino: u64) -> Vec<(u64, HandleEntry)> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, e)| e.ino == ino)
            .map(|(fh, e)| (*fh, e.clone()))
            .collect()
    }

    pub fn has_inode(&self, ino: u64) -> bool {
        self.entries.lock().values().any(|e| e.ino == ino)
    }

    /// Mark every handle of an inode stale, except `keep`.
    pub fn mark_stale(&self, ino: u64, keep: Option<u64>) -> usize {
        let entries = self.entries.lock();
        let mut marked = 0;
        for (fh, entry) in entries.iter() {
            if entry.ino == ino && Some(*fh) != keep {
                entry.mark_stale();
                marked += 1;
            }
        }
        marked
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
