//! Block cache for object content
//!
//! Blocks are keyed by (inode, generation, block index), so bytes of two
//! generations can never be confused with each other. Blocks of a superseded
//! generation are dropped via invalidation closures when the tracker observes
//! a newer one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use moka::sync::Cache;
use tracing::{debug, warn};

use crate::config::ContentCacheConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub ino: u64,
    pub generation: i64,
    pub index: u64,
}

/// Size-bounded block cache
#[derive(Clone)]
pub struct ContentCache {
    blocks: Cache<BlockKey, Bytes>,
    block_size: u64,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl ContentCache {
    pub fn new(config: &ContentCacheConfig) -> Self {
        let blocks = Cache::builder()
            .max_capacity(config.max_size_bytes())
            .weigher(|_key: &BlockKey, value: &Bytes| -> u32 {
                value.len().try_into().unwrap_or(u32::MAX)
            })
            .support_invalidation_closures()
            .build();

        Self {
            blocks,
            block_size: config.block_size_bytes.max(1),
            hits: Default::default(),
            misses: Default::default(),
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn get(&self, key: &BlockKey) -> Option<Bytes> {
        let block = self.blocks.get(key);
        if block.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        block
    }

    pub fn insert(&self, key: BlockKey, block: Bytes) {
        self.blocks.insert(key, block);
    }

    /// Drop every block of an inode
    pub fn invalidate_inode(&self, ino: u64) {
        debug!(ino, "invalidating content blocks");
        if let Err(e) = self.blocks.invalidate_entries_if(move |k, _| k.ino == ino) {
            warn!(ino, error = %e, "content invalidation closure rejected, clearing cache");
            self.blocks.invalidate_all();
        }
    }

    /// Drop the blocks of one generation of an inode
    pub fn invalidate_generation(&self, ino: u64, generation: i64) {
        debug!(ino, generation, "invalidating content generation");
        if let Err(e) = self
            .blocks
            .invalidate_entries_if(move |k, _| k.ino == ino && k.generation == generation)
        {
            warn!(ino, generation, error = %e, "content invalidation closure rejected, clearing cache");
            self.blocks.invalidate_all();
        }
    }

    /// Number of cached blocks, after applying pending evictions
    pub fn block_count(&self) -> u64 {
        self.blocks.run_pending_tasks();
        self.blocks.entry_count()
    }

    pub fn weighted_size(&self) -> u64 {
        self.blocks.run_pending_tasks();
        self.blocks.weighted_size()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCache")
            .field("block_size", &self.block_size)
            .field("block_count", &self.blocks.entry_count())
            .field("weighted_size", &self.blocks.weighted_size())
            .finish()
    }
}
