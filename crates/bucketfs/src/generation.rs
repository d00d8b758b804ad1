//! Generation tracking and staleness detection.
//!
//! The tracker holds the newest generation this mount has observed for each
//! file inode. Observing a newer generation replaces the metadata entry and
//! drops the content blocks of the superseded generation in one exclusive
//! per-inode scope. Observations older than what is known are ignored, so the
//! generation a mount reports for an inode never goes backwards.

use std::collections::HashMap;
use std::sync::Arc;

use backend::{BackendError, Generation, ObjectBackend};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::attr::FileAttr;
use crate::content_cache::ContentCache;
use crate::error::Result;
use crate::locks::InodeLocks;
use crate::metadata_cache::MetadataCache;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// First generation seen for the inode
    New,
    /// Same content version; metadata refreshed
    Unchanged,
    /// Supersedes the previously known generation
    Advanced { previous: Generation },
    /// Older than the known generation; ignored
    Older,
}

#[derive(Debug)]
pub struct GenerationTracker {
    latest: Mutex<HashMap<u64, FileAttr>>,
    metadata: Arc<MetadataCache>,
    content: ContentCache,
    locks: Arc<InodeLocks>,
}

impl GenerationTracker {
    pub fn new(metadata: Arc<MetadataCache>, content: ContentCache, locks: Arc<InodeLocks>) -> Self {
        Self {
            latest: Mutex::new(HashMap::new()),
            metadata,
            content,
            locks,
        }
    }

    /// Attributes for a file inode: the cached entry while it is fresh,
    /// otherwise a backend stat.
    ///
    /// A missing object forgets the inode's cached state. Any other failure
    /// leaves cached state untouched and is surfaced to the caller.
    pub async fn resolve(&self, backend: &dyn ObjectBackend, ino: u64, name: &str) -> Result<FileAttr> {
        if let Some(attr) = self.metadata.lookup(ino) {
            return Ok(attr);
        }
        self.refresh(backend, ino, name).await
    }

    /// Like [`resolve`](Self::resolve), bypassing the metadata cache.
    pub async fn refresh(&self, backend: &dyn ObjectBackend, ino: u64, name: &str) -> Result<FileAttr> {
        match backend.stat_object(name).await {
            Ok(attrs) => Ok(self.observe(FileAttr::from_object(ino, &attrs))),
            Err(e @ BackendError::NotFound { .. }) => {
                self.forget(ino);
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record attributes obtained from the backend and return what the
    /// mount should report.
    pub fn observe(&self, attr: FileAttr) -> FileAttr {
        let (reported, _) = self.observe_with(attr);
        reported
    }

    pub fn observe_with(&self, attr: FileAttr) -> (FileAttr, Observation) {
        let ino = attr.ino;
        let Some(incoming) = attr.generation.clone() else {
            self.metadata.insert(attr.clone());
            return (self.metadata.overlay(attr), Observation::Unchanged);
        };

        let (reported, observation) = self.locks.write(ino, || {
            let mut latest = self.latest.lock();
            let observation = match latest.get(&ino).and_then(|a| a.generation.as_ref()) {
                None => Observation::New,
                // A renamed inode starts a new lineage under its new name
                Some(known) if known.name != incoming.name || incoming.supersedes(known) => {
                    if !incoming.same_content(known) {
                        self.content.invalidate_generation(ino, known.generation);
                    }
                    Observation::Advanced {
                        previous: known.clone(),
                    }
                }
                Some(known) if incoming == *known => Observation::Unchanged,
                Some(_) => Observation::Older,
            };

            match observation {
                Observation::Older => {
                    let known = latest.get(&ino).cloned().unwrap_or(attr);
                    (known, observation)
                }
                _ => {
                    latest.insert(ino, attr.clone());
                    self.metadata.insert(attr.clone());
                    (attr, observation)
                }
            }
        });

        match &observation {
            Observation::Advanced { previous } => {
                info!(ino, previous = %previous, current = %incoming, "generation advanced");
            }
            Observation::Older => {
                debug!(ino, observed = %incoming, "ignoring older generation");
            }
            _ => {}
        }
        (self.metadata.overlay(reported), observation)
    }

    /// Whether `generation` is still the newest known for the inode.
    pub fn is_current(&self, ino: u64, generation: &Generation) -> bool {
        self.latest
            .lock()
            .get(&ino)
            .and_then(|a| a.generation.as_ref())
            .is_some_and(|known| known.same_content(generation))
    }

    pub fn latest(&self, ino: u64) -> Option<Generation> {
        self.latest
            .lock()
            .get(&ino)
            .and_then(|a| a.generation.clone())
    }

    /// Drop everything known about an inode: tracked generation, metadata
    /// entry and content blocks.
    pub fn forget(&self, ino: u64) {
        self.locks.write(ino, || {
            if let Some(attr) = self.latest.lock().remove(&ino) {
                debug!(ino, generation = ?attr.generation, "forgetting inode state");
            }
            self.metadata.invalidate(ino);
            self.content.invalidate_inode(ino);
        });
    }

    /// Insert a block only if `generation` is still current, atomically with
    /// respect to invalidation.
    pub fn insert_if_current(&self, ino: u64, generation: &Generation, insert: impl FnOnce()) -> bool {
        self.locks.read(ino, || {
            if self.is_current(ino, generation) {
                insert();
                true
            } else {
                false
            }
        })
    }
}
