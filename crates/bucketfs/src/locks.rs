//! Per-inode exclusion scopes.
//!
//! Scopes are closures, so a guard can never be held across an `.await`:
//! backend calls happen outside, and only the in-memory mutation that follows
//! them runs inside.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

#[derive(Debug, Default)]
pub struct InodeLocks {
    locks: Mutex<HashMap<u64, Arc<RwLock<()>>>>,
}

impl InodeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, ino: u64) -> Arc<RwLock<()>> {
        self.locks.lock().entry(ino).or_default().clone()
    }

    /// Run `f` sharing the inode with other readers.
    pub fn read<R>(&self, ino: u64, f: impl FnOnce() -> R) -> R {
        let lock = self.lock_for(ino);
        let _guard = lock.read();
        f()
    }

    /// Run `f` with exclusive access to the inode's state.
    pub fn write<R>(&self, ino: u64, f: impl FnOnce() -> R) -> R {
        let lock = self.lock_for(ino);
        let _guard = lock.write();
        f()
    }

    pub fn remove(&self, ino: u64) {
        self.locks.lock().remove(&ino);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
