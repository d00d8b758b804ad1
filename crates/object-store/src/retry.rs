//! Retry with exponential backoff for transient backend failures.
//!
//! Only errors for which [`BackendError::is_transient`] holds are retried.
//! Logical conflicts (generation mismatch, a second writer) are returned on
//! the first attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use crate::backend::ObjectBackend;
use crate::error::Result;
use crate::telemetry::{MetricsSink, NoopMetrics};
use crate::types::{ListResult, ObjectAttrs, StreamHandle, WriteOptions, WriterId};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Backoff before attempt `attempt + 1` (attempt is 1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        self.initial_backoff.mul_f64(factor).min(self.max_backoff)
    }
}

/// Backend wrapper adding retries.
#[derive(Debug)]
pub struct RetryingBackend<B> {
    inner: B,
    policy: RetryPolicy,
    metrics: Arc<dyn MetricsSink>,
}

impl<B: ObjectBackend> RetryingBackend<B> {
    pub fn new(inner: B, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    async fn with_retry<T, F, Fut>(&self, method: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    let backoff = self.policy.backoff(attempt);
                    warn!(
                        method,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient backend error, retrying"
                    );
                    self.metrics.backend_retry(method, e.category());
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl<B: ObjectBackend> ObjectBackend for RetryingBackend<B> {
    async fn stat_object(&self, name: &str) -> Result<ObjectAttrs> {
        self.with_retry("stat_object", || self.inner.stat_object(name))
            .await
    }

    async fn read_range(
        &self,
        name: &str,
        generation: i64,
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        self.with_retry("read_range", || {
            self.inner.read_range(name, generation, offset, length)
        })
        .await
    }

    async fn create_object(
        &self,
        name: &str,
        data: Bytes,
        options: WriteOptions,
    ) -> Result<ObjectAttrs> {
        self.with_retry("create_object", || {
            self.inner.create_object(name, data.clone(), options.clone())
        })
        .await
    }

    async fn open_write_stream(
        &self,
        name: &str,
        writer: &WriterId,
        if_generation_match: Option<i64>,
    ) -> Result<StreamHandle> {
        self.with_retry("open_write_stream", || {
            self.inner.open_write_stream(name, writer, if_generation_match)
        })
        .await
    }

    async fn append_stream(&self, stream: &StreamHandle, data: Bytes) -> Result<u64> {
        self.with_retry("append_stream", || {
            self.inner.append_stream(stream, data.clone())
        })
        .await
    }

    async fn finalize_stream(&self, stream: &StreamHandle) -> Result<ObjectAttrs> {
        self.with_retry("finalize_stream", || self.inner.finalize_stream(stream))
            .await
    }

    async fn abort_stream(&self, stream: &StreamHandle) -> Result<()> {
        self.with_retry("abort_stream", || self.inner.abort_stream(stream))
            .await
    }

    async fn copy_object(
        &self,
        src_name: &str,
        src_generation: i64,
        dst_name: &str,
    ) -> Result<ObjectAttrs> {
        self.with_retry("copy_object", || {
            self.inner.copy_object(src_name, src_generation, dst_name)
        })
        .await
    }

    async fn delete_object(&self, name: &str, generation: i64) -> Result<()> {
        self.with_retry("delete_object", || {
            self.inner.delete_object(name, generation)
        })
        .await
    }

    async fn list_objects(&self, prefix: &str, delimiter: Option<char>) -> Result<ListResult> {
        self.with_retry("list_objects", || {
            self.inner.list_objects(prefix, delimiter)
        })
        .await
    }
}
