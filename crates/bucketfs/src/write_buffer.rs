//! Local write staging for open handles.
//!
//! A handle writes in one of two modes:
//!
//! - **Buffered**: the full content is held locally and uploaded as one new
//!   generation on sync or close.
//! - **Streaming**: bytes are appended to a live backend stream. The object is
//!   visible to others as unfinalized until close finalizes it. Only the
//!   bytes not yet appended are held locally.

use std::collections::HashMap;
use std::sync::Arc;

use backend::{ObjectBackend, StreamHandle};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::warn;

#[derive(Debug)]
struct Buffered {
    data: Vec<u8>,
    dirty: bool,
}

#[derive(Debug)]
pub struct Streaming {
    pub stream: StreamHandle,
    /// Bytes already accepted by the backend stream
    pub persisted: u64,
    pub pending: BytesMut,
}

#[derive(Debug)]
enum Mode {
    Buffered(Buffered),
    Streaming(Streaming),
}

/// Outcome of staging a write
#[derive(Debug, PartialEq, Eq)]
pub enum Staged {
    Accepted,
    /// A streaming handle was asked to write somewhere other than its tail
    NotAtTail,
    /// The write would grow buffered content past the limit
    TooLarge,
}

#[derive(Debug)]
pub struct WriteBuffer {
    mode: Mode,
    /// Largest content a buffered handle may hold
    limit: u64,
}

impl WriteBuffer {
    /// Buffered mode seeded with existing content
    pub fn buffered(initial: Vec<u8>) -> Self {
        Self {
            mode: Mode::Buffered(Buffered {
                data: initial,
                dirty: false,
            }),
            limit: u64::MAX,
        }
    }

    /// Buffered mode for content that must be uploaded even if never written,
    /// e.g. after truncation
    pub fn buffered_dirty(initial: Vec<u8>) -> Self {
        Self {
            mode: Mode::Buffered(Buffered {
                data: initial,
                dirty: true,
            }),
            limit: u64::MAX,
        }
    }

    pub fn streaming(stream: StreamHandle) -> Self {
        Self {
            mode: Mode::Streaming(Streaming {
                stream,
                persisted: 0,
                pending: BytesMut::new(),
            }),
            limit: u64::MAX,
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.mode, Mode::Streaming(_))
    }

    /// Size as seen by the writing handle
    pub fn size(&self) -> u64 {
        match &self.mode {
            Mode::Buffered(b) => b.data.len() as u64,
            Mode::Streaming(s) => s.persisted + s.pending.len() as u64,
        }
    }

    /// Whether anything remains that a sync or close must make durable
    pub fn is_dirty(&self) -> bool {
        match &self.mode {
            Mode::Buffered(b) => b.dirty,
            Mode::Streaming(s) => !s.pending.is_empty(),
        }
    }

    /// Whether `len` bytes at `offset` can be staged without exceeding the
    /// limit. Tail appends to a stream are never held in full and always fit.
    pub fn fits(&self, offset: u64, len: usize) -> bool {
        let Some(end) = offset.checked_add(len as u64) else {
            return false;
        };
        match &self.mode {
            Mode::Streaming(s) if offset == s.persisted + s.pending.len() as u64 => true,
            _ => end <= self.limit && usize::try_from(end).is_ok(),
        }
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> Staged {
        let fits = self.fits(offset, data.len());
        match &mut self.mode {
            Mode::Buffered(b) => {
                if !fits {
                    return Staged::TooLarge;
                }
                let start = offset as usize;
                let end = start + data.len();
                if b.data.len() < end {
                    b.data.resize(end, 0);
                }
                b.data[start..end].copy_from_slice(data);
                b.dirty = true;
                Staged::Accepted
            }
            Mode::Streaming(s) => {
                if offset != s.persisted + s.pending.len() as u64 {
                    return Staged::NotAtTail;
                }
                s.pending.extend_from_slice(data);
                Staged::Accepted
            }
        }
    }

    /// Truncate or zero-extend buffered content within the limit. Streams
    /// cannot be truncated.
    pub fn set_len(&mut self, size: u64) -> bool {
        match &mut self.mode {
            Mode::Buffered(b) => {
                if size > self.limit {
                    return false;
                }
                let Ok(len) = usize::try_from(size) else {
                    return false;
                };
                b.data.resize(len, 0);
                b.dirty = true;
                true
            }
            Mode::Streaming(s) => size == s.persisted + s.pending.len() as u64,
        }
    }

    /// Full content of a buffered handle
    pub fn content(&self) -> Option<Bytes> {
        match &self.mode {
            Mode::Buffered(b) => Some(Bytes::copy_from_slice(&b.data)),
            Mode::Streaming(_) => None,
        }
    }

    pub fn read_buffered(&self, offset: u64, len: u64) -> Option<Bytes> {
        match &self.mode {
            Mode::Buffered(b) => {
                let size = b.data.len() as u64;
                let start = offset.min(size) as usize;
                let end = offset.saturating_add(len).min(size) as usize;
                Some(Bytes::copy_from_slice(&b.data[start..end]))
            }
            Mode::Streaming(_) => None,
        }
    }

    pub fn mark_clean(&mut self) {
        if let Mode::Buffered(b) = &mut self.mode {
            b.dirty = false;
        }
    }

    pub fn streaming_state(&self) -> Option<&Streaming> {
        match &self.mode {
            Mode::Streaming(s) => Some(s),
            Mode::Buffered(_) => None,
        }
    }

    /// Take the bytes waiting to be appended to the stream.
    pub fn take_pending(&mut self) -> Option<Bytes> {
        match &mut self.mode {
            Mode::Streaming(s) if !s.pending.is_empty() => Some(s.pending.split().freeze()),
            _ => None,
        }
    }

    /// Record that `len` bytes taken with [`take_pending`](Self::take_pending)
    /// were appended.
    pub fn mark_appended(&mut self, len: u64) {
        if let Mode::Streaming(s) = &mut self.mode {
            s.persisted += len;
        }
    }

    /// Put back bytes whose append failed, ahead of anything written since.
    pub fn restore_pending(&mut self, data: Bytes) {
        if let Mode::Streaming(s) = &mut self.mode {
            let mut restored = BytesMut::from(data.as_ref());
            restored.extend_from_slice(&s.pending);
            s.pending = restored;
        }
    }
}

/// Which local handle owns the live stream of each object name.
///
/// At most one handle may own a stream for a given name. Ownership is held
/// through a [`StreamClaim`] and ends when the claim is dropped.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    owners: Arc<Mutex<HashMap<String, u64>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `name` for handle `fh`. Fails with the current owner if another
    /// handle holds it.
    pub fn claim(&self, name: &str, fh: u64) -> Result<StreamClaim, u64> {
        let mut owners = self.owners.lock();
        if let Some(&owner) = owners.get(name) {
            return Err(owner);
        }
        owners.insert(name.to_string(), fh);
        Ok(StreamClaim {
            owners: self.owners.clone(),
            name: name.to_string(),
            fh,
            live: None,
        })
    }

    pub fn owner(&self, name: &str) -> Option<u64> {
        self.owners.lock().get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.owners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One handle's ownership of an object name in the [`StreamRegistry`].
///
/// Dropping the claim frees the name. If it is dropped while still armed
/// with a stream, as when an operation on the handle is cancelled, the stream
/// is aborted on the current runtime.
#[derive(Debug)]
pub struct StreamClaim {
    owners: Arc<Mutex<HashMap<String, u64>>>,
    name: String,
    fh: u64,
    live: Option<(Arc<dyn ObjectBackend>, StreamHandle)>,
}

impl StreamClaim {
    /// Abort `stream` if the claim is dropped before [`defuse`](Self::defuse).
    pub fn arm(&mut self, backend: Arc<dyn ObjectBackend>, stream: StreamHandle) {
        self.live = Some((backend, stream));
    }

    /// The stream was finalized or aborted; dropping only frees the name.
    pub fn defuse(&mut self) {
        self.live = None;
    }
}

impl Drop for StreamClaim {
    fn drop(&mut self) {
        {
            let mut owners = self.owners.lock();
            if owners.get(&self.name) == Some(&self.fh) {
                owners.remove(&self.name);
            }
        }

        let Some((backend, stream)) = self.live.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(
                    fh = self.fh,
                    name = %stream.name,
                    stream = stream.id,
                    "aborting stream of dropped handle"
                );
                runtime.spawn(async move {
                    if let Err(e) = backend.abort_stream(&stream).await {
                        warn!(
                            name = %stream.name,
                            stream = stream.id,
                            error = %e,
                            "failed to abort stream"
                        );
                    }
                });
            }
            Err(_) => {
                warn!(
                    fh = self.fh,
                    name = %stream.name,
                    stream = stream.id,
                    "no runtime to abort stream of dropped handle"
                );
            }
        }
    }
}
