//! The object API consumed by the filesystem core.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::types::{ListResult, ObjectAttrs, StreamHandle, WriteOptions, WriterId};

/// Backend object API.
///
/// Implementations own transport, authentication and wire encoding. The
/// filesystem core depends only on this trait.
#[async_trait]
pub trait ObjectBackend: std::fmt::Debug + Send + Sync {
    /// Stat the live generation of `name`.
    async fn stat_object(&self, name: &str) -> Result<ObjectAttrs>;

    /// Read `length` bytes at `offset` of a specific generation, as stored
    /// (no content decoding). Reads past the end are truncated.
    async fn read_range(
        &self,
        name: &str,
        generation: i64,
        offset: u64,
        length: u64,
    ) -> Result<Bytes>;

    /// Replace the full content of `name`, producing a new generation.
    async fn create_object(
        &self,
        name: &str,
        data: Bytes,
        options: WriteOptions,
    ) -> Result<ObjectAttrs>;

    /// Open an appendable stream. The object becomes visible immediately as
    /// unfinalized with the last finalized size.
    async fn open_write_stream(
        &self,
        name: &str,
        writer: &WriterId,
        if_generation_match: Option<i64>,
    ) -> Result<StreamHandle>;

    /// Append to a live stream; returns the number of bytes persisted so far.
    async fn append_stream(&self, stream: &StreamHandle, data: Bytes) -> Result<u64>;

    /// Finalize a stream, producing the authoritative generation.
    async fn finalize_stream(&self, stream: &StreamHandle) -> Result<ObjectAttrs>;

    /// Discard a live stream without finalizing it.
    async fn abort_stream(&self, stream: &StreamHandle) -> Result<()>;

    /// Server-side copy of a pinned source generation.
    async fn copy_object(
        &self,
        src_name: &str,
        src_generation: i64,
        dst_name: &str,
    ) -> Result<ObjectAttrs>;

    /// Delete `name` if its live generation is `generation`.
    async fn delete_object(&self, name: &str, generation: i64) -> Result<()>;

    /// List objects and common prefixes directly below `prefix`.
    async fn list_objects(&self, prefix: &str, delimiter: Option<char>) -> Result<ListResult>;
}
