//! Attachment metadata and the blob store collaborator.
//!
//! The revision store only records which attachments a revision has. The bytes are handed to
//! an [`AttachmentStore`], addressed by their blake3 hash.
use std::{collections::HashMap, fmt, sync::Arc};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Blake3 hash of attachment content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttachmentHash([u8; 32]);

impl AttachmentHash {
    /// Hash the given content.
    pub fn new(data: impl AsRef<[u8]>) -> Self {
        Self(*blake3::hash(data.as_ref()).as_bytes())
    }

    /// Create from raw hash bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short hex form for logging.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..5])
    }
}

impl fmt::Display for AttachmentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for AttachmentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttachmentHash({})", self.fmt_short())
    }
}

/// Metadata of an attachment stored with a revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Attachment name, unique per revision.
    pub name: String,
    /// MIME type.
    pub content_type: String,
    /// Content length in bytes.
    pub length: u64,
    /// Generation of the revision that last changed the content.
    pub revpos: u64,
    /// Content hash.
    pub hash: AttachmentHash,
}

/// An attachment supplied together with a revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentInput {
    /// The attachment is unchanged and already held by an ancestor revision.
    Stub,
    /// New attachment content.
    Inline {
        /// MIME type.
        content_type: String,
        /// The content.
        data: Bytes,
    },
}

/// Blob storage for attachment content.
pub trait AttachmentStore: fmt::Debug + Send + Sync + 'static {
    /// Store content and return its hash.
    fn put(&self, data: Bytes) -> anyhow::Result<AttachmentHash>;

    /// Load content by hash.
    fn get(&self, hash: &AttachmentHash) -> anyhow::Result<Option<Bytes>>;
}

/// In-memory [`AttachmentStore`].
#[derive(Debug, Clone, Default)]
pub struct MemAttachmentStore {
    blobs: Arc<Mutex<HashMap<AttachmentHash, Bytes>>>,
}

impl MemAttachmentStore {
    /// Number of distinct blobs held.
    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    /// Whether no blob is held.
    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

impl AttachmentStore for MemAttachmentStore {
    fn put(&self, data: Bytes) -> anyhow::Result<AttachmentHash> {
        let hash = AttachmentHash::new(&data);
        self.blobs.lock().entry(hash).or_insert(data);
        Ok(hash)
    }

    fn get(&self, hash: &AttachmentHash) -> anyhow::Result<Option<Bytes>> {
        Ok(self.blobs.lock().get(hash).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_addressed() -> anyhow::Result<()> {
        let store = MemAttachmentStore::default();
        let a = store.put(Bytes::from_static(b"hello"))?;
        let b = store.put(Bytes::from_static(b"hello"))?;
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert_eq!(a, AttachmentHash::new(b"hello"));
        assert_eq!(store.get(&a)?, Some(Bytes::from_static(b"hello")));
        assert_eq!(store.get(&AttachmentHash::new(b"other"))?, None);
        assert_eq!(a.to_string().len(), 64);
        Ok(())
    }
}
