//! Core types shared by every backend implementation.
//!
//! Objects are identified by name and versioned by a generation number. Each
//! write of content produces a new generation; metadata-only updates bump the
//! metageneration.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of one immutable version of a named object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Generation {
    /// Object name (bucket-relative, no leading slash)
    pub name: String,
    /// Content version. Strictly increasing per name.
    pub generation: i64,
    /// Metadata version within a generation
    pub metageneration: i64,
}

impl Generation {
    pub fn new(name: impl Into<String>, generation: i64, metageneration: i64) -> Self {
        Self {
            name: name.into(),
            generation,
            metageneration,
        }
    }

    /// True if `self` is a strictly newer version of the same object than `other`.
    pub fn supersedes(&self, other: &Generation) -> bool {
        self.name == other.name
            && (self.generation > other.generation
                || (self.generation == other.generation
                    && self.metageneration > other.metageneration))
    }

    /// True if both refer to the same content version.
    pub fn same_content(&self, other: &Generation) -> bool {
        self.name == other.name && self.generation == other.generation
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}.{}",
            self.name, self.generation, self.metageneration
        )
    }
}

/// Attributes returned by a stat of an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectAttrs {
    pub name: String,
    pub generation: i64,
    pub metageneration: i64,
    /// Authoritative size. For an unfinalized object this is the last
    /// finalized size (zero for an object that was never finalized).
    pub size: u64,
    pub updated: DateTime<Utc>,
    /// `Content-Encoding` as stored, e.g. `gzip`
    pub content_encoding: Option<String>,
    /// False while a write stream is still open on the object
    pub finalized: bool,
}

impl ObjectAttrs {
    pub fn generation(&self) -> Generation {
        Generation::new(self.name.clone(), self.generation, self.metageneration)
    }

    pub fn is_gzip(&self) -> bool {
        self.content_encoding
            .as_deref()
            .is_some_and(|enc| enc.eq_ignore_ascii_case("gzip"))
    }
}

/// Preconditions and metadata attached to a full-object write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Only write if the live generation equals this value. Zero means the
    /// object must not exist.
    pub if_generation_match: Option<i64>,
    pub content_encoding: Option<String>,
}

impl WriteOptions {
    pub fn if_generation_match(generation: i64) -> Self {
        Self {
            if_generation_match: Some(generation),
            ..Default::default()
        }
    }

    pub fn if_not_exists() -> Self {
        Self::if_generation_match(0)
    }

    pub fn with_content_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(encoding.into());
        self
    }
}

/// Identity of a writer that owns a live stream.
///
/// Mounts derive this from their mount id and the owning file handle, so two
/// handles on the same mount are distinct writers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WriterId(pub String);

impl WriterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for WriterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle to a live (unfinalized) write stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamHandle {
    pub id: u64,
    pub name: String,
    /// Generation assigned to the unfinalized object when the stream opened
    pub generation: i64,
    pub writer: WriterId,
}

/// Result of a delimited listing.
#[derive(Debug, Clone, Default)]
pub struct ListResult {
    /// Objects directly under the prefix
    pub objects: Vec<ObjectAttrs>,
    /// Common prefixes (sub-"directories"), each ending with the delimiter
    pub prefixes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supersedes() {
        let g1 = Generation::new("a", 1, 1);
        let g2 = Generation::new("a", 2, 1);
        let g1m2 = Generation::new("a", 1, 2);
        let other = Generation::new("b", 5, 1);

        assert!(g2.supersedes(&g1));
        assert!(!g1.supersedes(&g2));
        assert!(g1m2.supersedes(&g1));
        assert!(!g1.supersedes(&g1));
        assert!(!other.supersedes(&g1));
        assert!(g1.same_content(&g1m2));
    }

    #[test]
    fn test_is_gzip() {
        let mut attrs = ObjectAttrs {
            name: "a".to_string(),
            generation: 1,
            metageneration: 1,
            size: 0,
            updated: Utc::now(),
            content_encoding: Some("GZIP".to_string()),
            finalized: true,
        };
        assert!(attrs.is_gzip());
        attrs.content_encoding = None;
        assert!(!attrs.is_gzip());
    }
}
