//! Filesystem adapter and cache-coherency engine over generation-versioned
//! object storage.
//!
//! # Architecture
//!
//! - [`BucketFs`]: inode-oriented filesystem operations for one mount
//! - `InodeTable`: bidirectional inode ↔ path mapping
//! - `GenerationTracker`: newest generation per inode; invalidates cached
//!   state when a newer one is observed
//! - `MetadataCache`: attributes with a TTL on an injected [`Clock`]
//! - `ContentCache` / `ReadPath`: generation-tagged block cache with
//!   sequential read-ahead
//! - `WriteBuffer`: buffered and unfinalized-stream write staging
//! - [`RenameOp`]: copy-then-delete rename state machine
//! - [`FsError`]: the closed error taxonomy every backend failure maps into
//!
//! The backend is any [`backend::ObjectBackend`]; the filesystem depends only
//! on that trait and on [`backend::MetricsSink`].

pub mod attr;
mod bucket_fs;
pub mod clock;
pub mod config;
mod content_cache;
pub mod error;
mod file_ops;
mod generation;
mod handle;
mod inode_table;
mod locks;
mod metadata_cache;
mod read_path;
pub mod rename;
mod write_buffer;

pub use attr::{CacheStats, DirEntry, FileAttr};
pub use bucket_fs::BucketFs;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ContentCacheConfig, MountConfig};
pub use error::{FsError, Result};
pub use handle::OpenFlags;
pub use inode_table::InodeKind;
pub use rename::{RenameOp, RenamePhase};

pub use backend;
