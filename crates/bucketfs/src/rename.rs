//! Rename emulation over copy and delete.
//!
//! Object storage has no rename. A rename copies the pinned source generation
//! to the destination, then deletes that source generation. The two steps are
//! not atomic: stopping after the copy leaves both names present, and a later
//! retry of the remaining phase completes the move.

use std::fmt;

use backend::{BackendError, Generation, ObjectAttrs, ObjectBackend};
use tracing::{debug, info, warn};

use crate::error::{FsError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenamePhase {
    CopyPending,
    /// Destination written; source generation still present
    DeletePending { destination: ObjectAttrs },
    Done { destination: ObjectAttrs },
}

impl fmt::Display for RenamePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenamePhase::CopyPending => f.write_str("copy-pending"),
            RenamePhase::DeletePending { .. } => f.write_str("delete-pending"),
            RenamePhase::Done { .. } => f.write_str("done"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenameOp {
    source: Generation,
    destination: String,
    phase: RenamePhase,
}

impl RenameOp {
    /// Start a rename of the pinned `source` generation to `destination`.
    pub fn new(source: Generation, destination: impl Into<String>) -> Self {
        Self {
            source,
            destination: destination.into(),
            phase: RenamePhase::CopyPending,
        }
    }

    pub fn source(&self) -> &Generation {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn phase(&self) -> &RenamePhase {
        &self.phase
    }

    pub fn is_done(&self) -> bool {
        matches!(self.phase, RenamePhase::Done { .. })
    }

    /// Advance one phase. A failed step leaves the phase unchanged so the
    /// step can be retried.
    pub async fn step(&mut self, backend: &dyn ObjectBackend) -> Result<&RenamePhase> {
        let next = match &self.phase {
            RenamePhase::CopyPending => {
                let destination = backend
                    .copy_object(&self.source.name, self.source.generation, &self.destination)
                    .await
                    .map_err(|e| self.copy_error(e))?;
                debug!(
                    source = %self.source,
                    destination = %destination.generation(),
                    "rename copy complete"
                );
                RenamePhase::DeletePending { destination }
            }
            RenamePhase::DeletePending { destination } => {
                match backend
                    .delete_object(&self.source.name, self.source.generation)
                    .await
                {
                    Ok(()) => {}
                    // Already removed by an earlier attempt
                    Err(BackendError::NotFound { .. }) => {
                        debug!(source = %self.source, "rename source already deleted");
                    }
                    Err(e) => {
                        warn!(
                            source = %self.source,
                            destination = %self.destination,
                            error = %e,
                            "rename delete failed, both names present"
                        );
                        return Err(e.into());
                    }
                }
                RenamePhase::Done {
                    destination: destination.clone(),
                }
            }
            RenamePhase::Done { .. } => return Ok(&self.phase),
        };
        self.phase = next;
        Ok(&self.phase)
    }

    /// Run every remaining phase and return the destination attributes.
    pub async fn run(&mut self, backend: &dyn ObjectBackend) -> Result<ObjectAttrs> {
        loop {
            if let RenamePhase::Done { destination } = self.step(backend).await?.clone() {
                info!(source = %self.source, destination = %self.destination, "rename complete");
                return Ok(destination);
            }
        }
    }

    fn copy_error(&self, e: BackendError) -> FsError {
        match e {
            // The pinned source vanished or moved on before it was copied
            BackendError::NotFound { .. } => FsError::NotFound(self.source.name.clone()),
            // Source still being written by another mount
            BackendError::Conflict { .. } => FsError::Io(e.to_string()),
            other => other.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backend::{VersionedStore, WriteOptions, WriterId};
    use bytes::Bytes;

    async fn store_with(name: &str, content: &'static [u8]) -> (VersionedStore, Generation) {
        let store = VersionedStore::ephemeral().await.unwrap();
        let attrs = store
            .create_object(name, Bytes::from_static(content), WriteOptions::default())
            .await
            .unwrap();
        (store, attrs.generation())
    }

    #[tokio::test]
    async fn test_run_moves_content() {
        let (store, source) = store_with("a", b"payload").await;
        let mut op = RenameOp::new(source, "b");

        let destination = op.run(&store).await.unwrap();

        assert!(op.is_done());
        assert_eq!(destination.name, "b");
        assert_eq!(destination.size, 7);
        assert!(matches!(
            store.stat_object("a").await,
            Err(BackendError::NotFound { .. })
        ));
        let data = store
            .read_range("b", destination.generation, 0, 7)
            .await
            .unwrap();
        assert_eq!(data.as_ref(), b"payload");
    }

    #[tokio::test]
    async fn test_stop_after_copy_leaves_both_names() {
        let (store, source) = store_with("a", b"payload").await;
        let mut op = RenameOp::new(source, "b");

        let phase = op.step(&store).await.unwrap().clone();
        assert!(matches!(phase, RenamePhase::DeletePending { .. }));
        assert_eq!(phase.to_string(), "delete-pending");

        assert_eq!(store.stat_object("a").await.unwrap().size, 7);
        assert_eq!(store.stat_object("b").await.unwrap().size, 7);

        // Resuming completes the move
        op.run(&store).await.unwrap();
        assert!(store.stat_object("a").await.is_err());
    }

    #[tokio::test]
    async fn test_unfinalized_source_is_io_error() {
        let store = VersionedStore::ephemeral().await.unwrap();
        let stream = store
            .open_write_stream("a", &WriterId::new("other-mount/1"), None)
            .await
            .unwrap();
        store
            .append_stream(&stream, Bytes::from_static(b"partial"))
            .await
            .unwrap();
        let source = store.stat_object("a").await.unwrap().generation();

        let mut op = RenameOp::new(source, "b");
        let err = op.run(&store).await.unwrap_err();

        assert_eq!(err.errno(), libc::EIO);
        assert_eq!(op.phase(), &RenamePhase::CopyPending);
        assert!(store.stat_object("b").await.is_err());
    }

    #[tokio::test]
    async fn test_superseded_source_is_not_found() {
        let (store, source) = store_with("a", b"one").await;
        store
            .create_object("a", Bytes::from_static(b"two"), WriteOptions::default())
            .await
            .unwrap();
        store.delete_object("a", source.generation + 1).await.unwrap();

        let mut op = RenameOp::new(source, "b");
        let err = op.run(&store).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
