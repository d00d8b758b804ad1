//! Ranged reads through the content block cache.
//!
//! Every read is served from the handle's pinned generation. While that
//! generation is current, blocks come from the cache; sequential readers
//! fetch whole blocks plus read-ahead on a miss, random readers fetch exactly
//! the requested range and do not populate the cache. Once the pinned
//! generation has been superseded the cache is bypassed altogether.

use std::io::Read;

use backend::{Generation, MetricsSink, ObjectBackend, ReadType};
use bytes::{Bytes, BytesMut};
use flate2::read::GzDecoder;
use tracing::{debug, trace};

use crate::content_cache::{BlockKey, ContentCache};
use crate::error::{FsError, Result};
use crate::generation::GenerationTracker;

/// Sequential/random classification for one handle.
#[derive(Debug, Clone)]
pub struct ReadPattern {
    expected_offset: Option<u64>,
    seeks: u32,
    threshold: u32,
}

impl ReadPattern {
    pub fn new(threshold: u32) -> Self {
        Self {
            expected_offset: None,
            seeks: 0,
            threshold,
        }
    }

    /// Classify a read and remember where the next sequential one starts.
    ///
    /// A handle is sequential until it has made `threshold` non-contiguous
    /// reads; it stays random from then on.
    pub fn classify(&mut self, offset: u64, len: u64) -> ReadType {
        let expected = self.expected_offset.unwrap_or(0);
        if offset != expected {
            self.seeks = self.seeks.saturating_add(1);
        }
        self.expected_offset = Some(offset.saturating_add(len));

        if self.seeks >= self.threshold {
            ReadType::Random
        } else {
            ReadType::Sequential
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReadRequest<'a> {
    pub ino: u64,
    pub generation: &'a Generation,
    /// Size of the pinned generation; reads are clipped to it
    pub size: u64,
    pub offset: u64,
    pub len: u64,
    pub read_type: ReadType,
}

pub struct ReadPath<'a> {
    pub backend: &'a dyn ObjectBackend,
    pub cache: &'a ContentCache,
    pub tracker: &'a GenerationTracker,
    pub metrics: &'a dyn MetricsSink,
    pub readahead_blocks: u64,
}

impl ReadPath<'_> {
    pub async fn read(&self, req: ReadRequest<'_>) -> Result<Bytes> {
        let end = req.offset.saturating_add(req.len).min(req.size);
        if req.offset >= end {
            return Ok(Bytes::new());
        }

        let data = if self.tracker.is_current(req.ino, req.generation) {
            self.read_cached(&req, end).await?
        } else {
            debug!(
                ino = req.ino,
                generation = %req.generation,
                "pinned generation superseded, bypassing content cache"
            );
            self.metrics.cache_read(false, req.read_type);
            self.fetch(req.generation, req.offset, end - req.offset).await?
        };

        self.metrics.bytes_read(data.len() as u64, req.read_type);
        Ok(data)
    }

    async fn read_cached(&self, req: &ReadRequest<'_>, end: u64) -> Result<Bytes> {
        let block_size = self.cache.block_size();
        let generation = req.generation.generation;
        let first = req.offset / block_size;
        let last = (end - 1) / block_size;

        let mut blocks: Vec<Option<Bytes>> = (first..=last)
            .map(|index| {
                self.cache.get(&BlockKey {
                    ino: req.ino,
                    generation,
                    index,
                })
            })
            .collect();
        for block in &blocks {
            self.metrics.cache_read(block.is_some(), req.read_type);
        }

        if let Some(first_missing) = blocks.iter().position(Option::is_none) {
            if req.read_type == ReadType::Random {
                return self.fetch(req.generation, req.offset, end - req.offset).await;
            }

            let last_block = (req.size - 1) / block_size;
            let fetch_first = first + first_missing as u64;
            let fetch_last = last.saturating_add(self.readahead_blocks).min(last_block);
            let start = fetch_first * block_size;
            let stop = ((fetch_last + 1) * block_size).min(req.size);
            trace!(ino = req.ino, start, stop, "fetching blocks");
            let data = self.fetch(req.generation, start, stop - start).await?;

            for (i, block_start) in (start..stop).step_by(block_size as usize).enumerate() {
                let index = fetch_first + i as u64;
                let rel = (block_start - start) as usize;
                if rel >= data.len() {
                    break;
                }
                let expected_len = block_size.min(req.size - block_start) as usize;
                let block = data.slice(rel..(rel + expected_len).min(data.len()));

                // Short blocks mean the object is smaller than the pinned
                // size claims; serve them but never cache them.
                if block.len() == expected_len {
                    let key = BlockKey {
                        ino: req.ino,
                        generation,
                        index,
                    };
                    let cached = block.clone();
                    self.tracker
                        .insert_if_current(req.ino, req.generation, || self.cache.insert(key, cached));
                }
                if index <= last {
                    blocks[(index - first) as usize] = Some(block);
                }
            }
        }

        let mut out = BytesMut::with_capacity((end - req.offset) as usize);
        for (i, block) in blocks.into_iter().enumerate() {
            let Some(block) = block else { break };
            let block_start = (first + i as u64) * block_size;
            let from = req.offset.saturating_sub(block_start) as usize;
            let to = ((end - block_start) as usize).min(block.len());
            if from < to {
                out.extend_from_slice(&block[from..to]);
            }
        }
        Ok(out.freeze())
    }

    async fn fetch(&self, generation: &Generation, offset: u64, len: u64) -> Result<Bytes> {
        self.backend
            .read_range(&generation.name, generation.generation, offset, len)
            .await
            .map_err(FsError::from_handle)
    }
}

/// Decode a whole gzip-encoded object.
pub fn decode_gzip(encoded: &[u8]) -> Result<Bytes> {
    let mut decoder = GzDecoder::new(encoded);
    let mut decoded = Vec::new();
    decoder
        .read_to_end(&mut decoded)
        .map_err(|e| FsError::Io(format!("gzip decode failed: {}", e)))?;
    Ok(Bytes::from(decoded))
}

/// Slice `[offset, offset + len)` out of fully materialized content.
pub fn slice_range(data: &Bytes, offset: u64, len: u64) -> Bytes {
    let size = data.len() as u64;
    let start = offset.min(size) as usize;
    let end = offset.saturating_add(len).min(size) as usize;
    data.slice(start..end)
}
