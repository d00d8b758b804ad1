//! Metrics sink shared by the backend layers and the filesystem core.
//!
//! Exporters are out of scope here; implementations forward to whatever
//! metrics pipeline the host process uses.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;

/// How a read was classified by the read path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadType {
    Sequential,
    Random,
    /// Served from a handle's local write buffer
    Buffered,
}

impl ReadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadType::Sequential => "sequential",
            ReadType::Random => "random",
            ReadType::Buffered => "buffered",
        }
    }
}

impl fmt::Display for ReadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiver for operation and cache counters.
pub trait MetricsSink: fmt::Debug + Send + Sync {
    /// One filesystem operation completed.
    fn op_completed(&self, op: &'static str, latency: Duration);

    /// One filesystem operation failed with `category`.
    fn op_failed(&self, op: &'static str, category: &'static str);

    /// One backend request completed (successfully or not).
    fn backend_request(&self, method: &'static str, latency: Duration);

    /// A transient backend failure is about to be retried.
    fn backend_retry(&self, method: &'static str, category: &'static str);

    /// A content cache lookup.
    fn cache_read(&self, hit: bool, read_type: ReadType);

    /// Bytes returned to the caller by the read path.
    fn bytes_read(&self, bytes: u64, read_type: ReadType);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn op_completed(&self, _op: &'static str, _latency: Duration) {}
    fn op_failed(&self, _op: &'static str, _category: &'static str) {}
    fn backend_request(&self, _method: &'static str, _latency: Duration) {}
    fn backend_retry(&self, _method: &'static str, _category: &'static str) {}
    fn cache_read(&self, _hit: bool, _read_type: ReadType) {}
    fn bytes_read(&self, _bytes: u64, _read_type: ReadType) {}
}

/// Counters kept in process memory, keyed by a flattened label string.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, key: String, value: u64) {
        *self.counters.lock().entry(key).or_insert(0) += value;
    }

    /// Current value of a counter, 0 if never touched.
    pub fn counter(&self, key: &str) -> u64 {
        self.counters.lock().get(key).copied().unwrap_or(0)
    }

    pub fn op_count(&self, op: &str) -> u64 {
        self.counter(&format!("fs_ops_count/{}", op))
    }

    pub fn op_error_count(&self, op: &str, category: &str) -> u64 {
        self.counter(&format!("fs_ops_error_count/{}/{}", op, category))
    }

    pub fn backend_request_count(&self, method: &str) -> u64 {
        self.counter(&format!("backend_request_count/{}", method))
    }

    pub fn retry_count(&self, method: &str) -> u64 {
        self.counter(&format!("backend_retry_count/{}", method))
    }

    pub fn cache_hits(&self, read_type: ReadType) -> u64 {
        self.counter(&format!("file_cache_read_count/true/{}", read_type))
    }

    pub fn cache_misses(&self, read_type: ReadType) -> u64 {
        self.counter(&format!("file_cache_read_count/false/{}", read_type))
    }

    pub fn bytes_read_total(&self, read_type: ReadType) -> u64 {
        self.counter(&format!("file_cache_read_bytes_count/{}", read_type))
    }
}

impl MetricsSink for InMemoryMetrics {
    fn op_completed(&self, op: &'static str, latency: Duration) {
        self.add(format!("fs_ops_count/{}", op), 1);
        self.add(
            format!("fs_ops_latency_us/{}", op),
            latency.as_micros() as u64,
        );
    }

    fn op_failed(&self, op: &'static str, category: &'static str) {
        self.add(format!("fs_ops_error_count/{}/{}", op, category), 1);
    }

    fn backend_request(&self, method: &'static str, latency: Duration) {
        self.add(format!("backend_request_count/{}", method), 1);
        self.add(
            format!("backend_request_latency_us/{}", method),
            latency.as_micros() as u64,
        );
    }

    fn backend_retry(&self, method: &'static str, category: &'static str) {
        self.add(format!("backend_retry_count/{}", method), 1);
        self.add(format!("backend_retry_count/{}/{}", method, category), 1);
    }

    fn cache_read(&self, hit: bool, read_type: ReadType) {
        self.add(format!("file_cache_read_count/{}/{}", hit, read_type), 1);
    }

    fn bytes_read(&self, bytes: u64, read_type: ReadType) {
        self.add(format!("file_cache_read_bytes_count/{}", read_type), bytes);
    }
}
