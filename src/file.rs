//! Candidate files: immutable blobs with reference identity.
//!
//! A browser `File` is shared by reference: the same object can sit in an
//! input's file list and in an outgoing form body at once, and the cache is
//! keyed on that identity rather than on content. [`CandidateFile`] mirrors
//! this with an `Arc` over the blob; clones share identity, and a sanitised
//! result is always a new allocation.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::SystemTime;

/// Media type of every file produced by the rasteriser.
pub const PDF_MEDIA_TYPE: &str = "application/pdf";

struct FileData {
    name: String,
    media_type: String,
    bytes: Vec<u8>,
    last_modified: SystemTime,
}

/// Identity of a blob. Two handles compare equal only if they share storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(usize);

/// A named, typed, immutable byte blob.
#[derive(Clone)]
pub struct CandidateFile(Arc<FileData>);

impl CandidateFile {
    /// Create a new blob stamped with the current time.
    pub fn new(name: impl Into<String>, media_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self::with_last_modified(name, media_type, bytes, SystemTime::now())
    }

    pub fn with_last_modified(
        name: impl Into<String>,
        media_type: impl Into<String>,
        bytes: Vec<u8>,
        last_modified: SystemTime,
    ) -> Self {
        Self(Arc::new(FileData {
            name: name.into(),
            media_type: media_type.into(),
            bytes,
            last_modified,
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Declared media type; may be empty when the host did not know it.
    pub fn media_type(&self) -> &str {
        &self.0.media_type
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0.bytes
    }

    pub fn size(&self) -> u64 {
        self.0.bytes.len() as u64
    }

    pub fn last_modified(&self) -> SystemTime {
        self.0.last_modified
    }

    pub fn id(&self) -> FileId {
        FileId(Arc::as_ptr(&self.0) as usize)
    }

    /// `true` when both handles point at the same blob.
    pub fn same_blob(&self, other: &CandidateFile) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> WeakFile {
        WeakFile(Arc::downgrade(&self.0))
    }
}

impl PartialEq for CandidateFile {
    fn eq(&self, other: &Self) -> bool {
        self.same_blob(other)
    }
}

impl Eq for CandidateFile {}

impl fmt::Debug for CandidateFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CandidateFile")
            .field("name", &self.0.name)
            .field("media_type", &self.0.media_type)
            .field("size", &self.0.bytes.len())
            .finish()
    }
}

/// Non-owning handle used by the cache so entries die with their blob.
#[derive(Clone)]
pub struct WeakFile(Weak<FileData>);

impl WeakFile {
    pub fn upgrade(&self) -> Option<CandidateFile> {
        self.0.upgrade().map(CandidateFile)
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl fmt::Debug for WeakFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WeakFile").field(&self.is_alive()).finish()
    }
}
