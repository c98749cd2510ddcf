use crate::revision::RevId;

/// Result type used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by the document store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A revision id is not of the form `<generation>-<token>`.
    #[error("invalid revision id: {0:?}")]
    InvalidRevisionId(String),
    /// A document id is empty or uses a reserved prefix.
    #[error("invalid document id: {0:?}")]
    InvalidDocumentId(String),
    /// A revision history handed to a merge is malformed.
    #[error("invalid revision history: {0}")]
    InvalidHistory(String),
    /// The revision is already part of the document's tree.
    ///
    /// Replication retries hit this benignly, see [`Error::is_duplicate`].
    #[error("revision {rev} of document {doc_id} already exists")]
    DuplicateRevision {
        /// The document id.
        doc_id: String,
        /// The revision that was inserted twice.
        rev: RevId,
    },
    /// The document id is already registered.
    #[error("document {0} already exists")]
    DocumentExists(String),
    /// No document with this id exists.
    #[error("document {0} not found")]
    DocumentNotFound(String),
    /// The document exists, but the requested revision does not.
    #[error("revision {rev} of document {doc_id} not found")]
    RevisionNotFound {
        /// The document id.
        doc_id: String,
        /// The missing revision.
        rev: RevId,
    },
    /// A local edit did not target a live leaf revision.
    #[error("document update conflict: {doc_id}")]
    Conflict {
        /// The document id.
        doc_id: String,
    },
    /// An attachment stub was supplied, but no ancestor holds the attachment.
    #[error("attachment {name} of document {doc_id} references no stored attachment")]
    MissingAttachmentStub {
        /// The document id.
        doc_id: String,
        /// The attachment name.
        name: String,
    },
    /// The attachment store failed.
    #[error("attachment store failed")]
    Attachment(#[source] anyhow::Error),
    /// A structural invariant of a revision tree was violated.
    #[error("revision tree invariant violated: {0}")]
    Invariant(String),
    /// The storage engine failed.
    #[error("storage error")]
    Storage(#[from] redb::Error),
    /// A schema migration failed and was rolled back.
    #[error("migration from schema version {from} to {to} failed")]
    Migration {
        /// Schema version before the migration.
        from: u64,
        /// Schema version the migration targeted.
        to: u64,
        /// The failure reported by the migration.
        #[source]
        source: anyhow::Error,
    },
    /// The outer transaction was rolled back because a nested unit of work failed.
    #[error("transaction rolled back after a nested unit of work failed")]
    TransactionPoisoned,
    /// The execution queue no longer accepts or runs work.
    #[error("execution queue is closed")]
    QueueClosed,
}

impl Error {
    /// Whether the storage connection is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Storage(
                redb::Error::Io(_) | redb::Error::Corrupted(_) | redb::Error::LockPoisoned(_)
            )
        )
    }

    /// Whether this error reports a revision that was already present.
    ///
    /// Callers replaying replicated revisions treat this as "already applied".
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Error::DuplicateRevision { .. })
    }

    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        Error::Invariant(msg.into())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(value: redb::DatabaseError) -> Self {
        Error::Storage(value.into())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(value: redb::TransactionError) -> Self {
        Error::Storage(value.into())
    }
}

impl From<redb::TableError> for Error {
    fn from(value: redb::TableError) -> Self {
        Error::Storage(value.into())
    }
}

impl From<redb::StorageError> for Error {
    fn from(value: redb::StorageError) -> Self {
        Error::Storage(value.into())
    }
}

impl From<redb::CommitError> for Error {
    fn from(value: redb::CommitError) -> Self {
        Error::Storage(value.into())
    }
}
