//! Per-method request counting and latency for any backend.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use crate::backend::ObjectBackend;
use crate::error::Result;
use crate::telemetry::MetricsSink;
use crate::types::{ListResult, ObjectAttrs, StreamHandle, WriteOptions, WriterId};

#[derive(Debug)]
pub struct InstrumentedBackend<B> {
    inner: B,
    metrics: Arc<dyn MetricsSink>,
}

impl<B: ObjectBackend> InstrumentedBackend<B> {
    pub fn new(inner: B, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { inner, metrics }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    async fn timed<T, Fut>(&self, method: &'static str, call: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>> + Send,
    {
        let start = Instant::now();
        let result = call.await;
        let elapsed = start.elapsed();
        self.metrics.backend_request(method, elapsed);
        trace!(method, elapsed_us = elapsed.as_micros() as u64, ok = result.is_ok(), "backend request");
        result
    }
}

#[async_trait]
impl<B: ObjectBackend> ObjectBackend for InstrumentedBackend<B> {
    async fn stat_object(&self, name: &str) -> Result<ObjectAttrs> {
        self.timed("stat_object", self.inner.stat_object(name)).await
    }

    async fn read_range(
        &self,
        name: &str,
        generation: i64,
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        self.timed(
            "read_range",
            self.inner.read_range(name, generation, offset, length),
        )
        .await
    }

    async fn create_object(
        &self,
        name: &str,
        data: Bytes,
        options: WriteOptions,
    ) -> Result<ObjectAttrs> {
        self.timed("create_object", self.inner.create_object(name, data, options))
            .await
    }

    async fn open_write_stream(
        &self,
        name: &str,
        writer: &WriterId,
        if_generation_match: Option<i64>,
    ) -> Result<StreamHandle> {
        self.timed(
            "open_write_stream",
            self.inner.open_write_stream(name, writer, if_generation_match),
        )
        .await
    }

    async fn append_stream(&self, stream: &StreamHandle, data: Bytes) -> Result<u64> {
        self.timed("append_stream", self.inner.append_stream(stream, data))
            .await
    }

    async fn finalize_stream(&self, stream: &StreamHandle) -> Result<ObjectAttrs> {
        self.timed("finalize_stream", self.inner.finalize_stream(stream))
            .await
    }

    async fn abort_stream(&self, stream: &StreamHandle) -> Result<()> {
        self.timed("abort_stream", self.inner.abort_stream(stream))
            .await
    }

    async fn copy_object(
        &self,
        src_name: &str,
        src_generation: i64,
        dst_name: &str,
    ) -> Result<ObjectAttrs> {
        self.timed(
            "copy_object",
            self.inner.copy_object(src_name, src_generation, dst_name),
        )
        .await
    }

    async fn delete_object(&self, name: &str, generation: i64) -> Result<()> {
        self.timed("delete_object", self.inner.delete_object(name, generation))
            .await
    }

    async fn list_objects(&self, prefix: &str, delimiter: Option<char>) -> Result<ListResult> {
        self.timed("list_objects", self.inner.list_objects(prefix, delimiter))
            .await
    }
}
