//! Generation-versioned object storage for bucketfs.
//!
//! This crate is the backend-call layer consumed by the filesystem core:
//!
//! - [`ObjectBackend`]: the object API (stat, ranged read, full-object write,
//!   appendable streams, copy, delete, list)
//! - [`VersionedStore`]: an implementation that keeps generation metadata in
//!   memory and blob bytes in any `object_store` backend
//! - [`RetryingBackend`] / [`InstrumentedBackend`]: wrappers adding retries of
//!   transient failures and per-method request metrics
//! - [`MetricsSink`]: the telemetry interface shared with the core

mod backend;
mod error;
mod instrumented;
mod retry;
mod storage;
mod telemetry;
mod types;
mod versioned;

pub use backend::ObjectBackend;
pub use error::{BackendError, Result};
pub use instrumented::InstrumentedBackend;
pub use retry::{RetryPolicy, RetryingBackend};
pub use storage::{ObjectStoreConfig, Storage};
pub use telemetry::{InMemoryMetrics, MetricsSink, NoopMetrics, ReadType};
pub use types::{Generation, ListResult, ObjectAttrs, StreamHandle, WriteOptions, WriterId};
pub use versioned::VersionedStore;
