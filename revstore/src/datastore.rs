use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    sync::Arc,
};

use bytes::Bytes;
use tracing::debug;

use crate::{
    attachments::{Attachment, AttachmentInput, AttachmentStore, MemAttachmentStore},
    config::StoreConfig,
    edit::{self, Resolution},
    error::{Error, Result},
    merge::{self, ForceInsertItem},
    queue::QueueHandle,
    revision::{validate_doc_id, NewRevision, RevId, Revision, Sequence},
    revs_diff::{self, RevsDiffEntry},
    store::Connection,
    tree::DocumentRevisionTree,
};

/// A page of the change feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    /// Current revisions of the documents changed in the window, ordered by sequence.
    pub results: Vec<Revision>,
    /// Highest sequence seen, or the requested start if nothing changed.
    pub last_sequence: Sequence,
}

/// Document store
///
/// All operations are executed on the store's execution queue, one after another. Cloning is
/// cheap and clones share the queue.
#[derive(Debug, Clone)]
pub struct Datastore {
    queue: QueueHandle,
    attachments: Arc<dyn AttachmentStore>,
    max_possible_ancestors: usize,
}

impl Datastore {
    /// Create an in-memory store.
    pub fn memory() -> Result<Self> {
        Self::with_config(
            StoreConfig::memory(),
            Arc::new(MemAttachmentStore::default()),
        )
    }

    /// Create or open a store persisted at `path`.
    ///
    /// Attachment content is kept in memory.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(
            StoreConfig::persistent(path.as_ref()),
            Arc::new(MemAttachmentStore::default()),
        )
    }

    /// Open a store with an explicit config and attachment store.
    pub fn with_config(config: StoreConfig, attachments: Arc<dyn AttachmentStore>) -> Result<Self> {
        let conn = Connection::open(&config)?;
        debug!(path = ?config.path, "opened store");
        let queue = QueueHandle::spawn(conn, &config);
        Ok(Self {
            queue,
            attachments,
            max_possible_ancestors: config.max_possible_ancestors,
        })
    }

    /// The execution queue, for running custom units of work.
    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    /// Create a new document.
    ///
    /// See [`edit::create_document`].
    pub async fn create_document(
        &self,
        doc_id: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Result<Revision> {
        let doc_id = doc_id.into();
        let body = body.into();
        self.queue
            .submit_transactional(move |conn| edit::create_document(conn, &doc_id, body))
            .await
    }

    /// Add a revision below the live leaf `parent`.
    pub async fn update_document(
        &self,
        doc_id: impl Into<String>,
        parent: &RevId,
        body: impl Into<Bytes>,
    ) -> Result<Revision> {
        let doc_id = doc_id.into();
        let parent = parent.clone();
        let body = body.into();
        self.queue
            .submit_transactional(move |conn| edit::update_document(conn, &doc_id, &parent, body))
            .await
    }

    /// Add a tombstone below the live leaf `parent`.
    pub async fn delete_document(
        &self,
        doc_id: impl Into<String>,
        parent: &RevId,
    ) -> Result<Revision> {
        let doc_id = doc_id.into();
        let parent = parent.clone();
        self.queue
            .submit_transactional(move |conn| edit::delete_document(conn, &doc_id, &parent))
            .await
    }

    /// Tombstone every live leaf of a document.
    ///
    /// Returns the new tombstones, none if the document was already deleted.
    pub async fn delete_all_leaves(&self, doc_id: impl Into<String>) -> Result<Vec<Revision>> {
        let doc_id = doc_id.into();
        self.queue
            .submit_transactional(move |conn| edit::delete_all_leaves(conn, &doc_id))
            .await
    }

    /// Resolve the conflicts of a document with `resolver`.
    ///
    /// See [`edit::resolve_conflicts`].
    pub async fn resolve_conflicts<F>(
        &self,
        doc_id: impl Into<String>,
        resolver: F,
    ) -> Result<Option<Revision>>
    where
        F: FnOnce(&str, &[Revision]) -> Option<Resolution> + Send + 'static,
    {
        let doc_id = doc_id.into();
        self.queue
            .submit_transactional(move |conn| edit::resolve_conflicts(conn, &doc_id, resolver))
            .await
    }

    /// Get the winning revision of a document, or a specific revision, with its body.
    pub async fn get_document(
        &self,
        doc_id: impl Into<String>,
        rev: Option<RevId>,
    ) -> Result<Revision> {
        let doc_id = doc_id.into();
        self.queue
            .submit(move |conn| {
                let tree = load_tree(conn, &doc_id, true)?;
                let found = match &rev {
                    Some(rev) => tree.lookup(rev),
                    None => tree.current(),
                };
                match (found, rev) {
                    (Some(found), _) => Ok(found.clone()),
                    (None, Some(rev)) => Err(Error::RevisionNotFound { doc_id, rev }),
                    (None, None) => Err(Error::invariant(format!("{doc_id} has no winner"))),
                }
            })
            .await
    }

    /// Whether the document exists and is not deleted, or has the revision `rev`.
    pub async fn contains_document(
        &self,
        doc_id: impl Into<String>,
        rev: Option<RevId>,
    ) -> Result<bool> {
        let doc_id = doc_id.into();
        self.queue
            .submit(move |conn| {
                validate_doc_id(&doc_id)?;
                let Some(doc) = conn.numeric_id(&doc_id)? else {
                    return Ok(false);
                };
                match rev {
                    Some(rev) => Ok(conn.query_revision_exists(doc, &rev)?.is_some()),
                    None => Ok(conn
                        .current_revision(doc, false)?
                        .is_some_and(|current| !current.deleted)),
                }
            })
            .await
    }

    /// Winning revisions of the requested documents, in request order.
    ///
    /// Unknown documents are skipped.
    pub async fn documents_with_ids(&self, doc_ids: Vec<String>) -> Result<Vec<Revision>> {
        self.queue
            .submit(move |conn| {
                let mut found = Vec::with_capacity(doc_ids.len());
                for doc_id in &doc_ids {
                    let Some(doc) = conn.numeric_id(doc_id)? else {
                        continue;
                    };
                    if let Some(current) = conn.current_revision(doc, true)? {
                        found.push(current);
                    }
                }
                Ok(found)
            })
            .await
    }

    /// A page of the non-deleted documents ordered by id.
    pub async fn all_documents(
        &self,
        offset: usize,
        limit: usize,
        descending: bool,
    ) -> Result<Vec<Revision>> {
        self.queue
            .submit(move |conn| {
                let mut docs = live_documents(conn)?;
                if descending {
                    docs.reverse();
                }
                let mut page = Vec::new();
                for (doc, _) in docs.into_iter().skip(offset).take(limit) {
                    if let Some(current) = conn.current_revision(doc, true)? {
                        page.push(current);
                    }
                }
                Ok(page)
            })
            .await
    }

    /// Ids of all non-deleted documents, ordered.
    pub async fn all_document_ids(&self) -> Result<Vec<String>> {
        self.queue
            .submit(|conn| {
                let docs = live_documents(conn)?;
                Ok(docs.into_iter().map(|(_, doc_id)| doc_id).collect())
            })
            .await
    }

    /// Number of non-deleted documents.
    pub async fn document_count(&self) -> Result<usize> {
        self.queue
            .submit(|conn| Ok(live_documents(conn)?.len()))
            .await
    }

    /// Load the full revision tree of a document, with bodies.
    pub async fn get_all_revisions_of_document(
        &self,
        doc_id: impl Into<String>,
    ) -> Result<DocumentRevisionTree> {
        let doc_id = doc_id.into();
        self.queue
            .submit(move |conn| load_tree(conn, &doc_id, true))
            .await
    }

    /// Merge a revision that arrives with its history, oldest first.
    ///
    /// Returns the sequence of the inserted revision. Inserting a revision the document
    /// already has fails with [`Error::DuplicateRevision`].
    pub async fn force_insert_with_history(
        &self,
        doc_id: impl Into<String>,
        revision: NewRevision,
        history: Vec<RevId>,
        attachments: BTreeMap<String, AttachmentInput>,
    ) -> Result<Sequence> {
        let item = ForceInsertItem {
            doc_id: doc_id.into(),
            revision,
            history,
            attachments,
        };
        let outcomes = self.force_insert(vec![item]).await?;
        outcomes
            .first()
            .copied()
            .ok_or_else(|| Error::invariant("merge returned no sequence"))
    }

    /// Merge several revisions in one transaction.
    ///
    /// Either all items are merged or none is. Returns the sequence of each inserted revision.
    pub async fn force_insert(&self, items: Vec<ForceInsertItem>) -> Result<Vec<Sequence>> {
        let store = self.attachments.clone();
        self.queue
            .submit_transactional(move |conn| {
                let outcomes = merge::force_insert_many(conn, store.as_ref(), &items)?;
                Ok(outcomes.into_iter().map(|outcome| outcome.sequence).collect())
            })
            .await
    }

    /// Find which of the requested revisions are missing locally.
    pub async fn revs_diff(
        &self,
        requested: BTreeMap<String, BTreeSet<RevId>>,
    ) -> Result<BTreeMap<String, RevsDiffEntry>> {
        let limit = self.max_possible_ancestors;
        self.queue
            .submit(move |conn| revs_diff::revs_diff(conn, &requested, limit))
            .await
    }

    /// Ids of all documents with more than one live leaf.
    pub async fn conflicted_ids(&self) -> Result<Vec<String>> {
        self.queue
            .submit(|conn| {
                let mut conflicted = Vec::new();
                for (doc, doc_id) in conn.documents()? {
                    if conn.load_tree(doc, false)?.is_conflicted() {
                        conflicted.push(doc_id);
                    }
                }
                Ok(conflicted)
            })
            .await
    }

    /// Documents changed after `since`, looking at up to `limit` sequences.
    pub async fn changes(&self, since: Sequence, limit: u64) -> Result<Changes> {
        self.queue
            .submit(move |conn| {
                let mut changes = Changes {
                    results: Vec::new(),
                    last_sequence: since,
                };
                for (doc, sequence) in conn.changes_since(since, limit)? {
                    changes.last_sequence = changes.last_sequence.max(sequence);
                    let tree = conn.load_tree(doc, true)?;
                    let current = tree.current().ok_or_else(|| {
                        Error::invariant(format!("document {doc} has no current revision"))
                    })?;
                    changes.results.push(current.clone());
                }
                Ok(changes)
            })
            .await
    }

    /// The highest sequence allocated so far.
    pub async fn last_sequence(&self) -> Result<Sequence> {
        self.queue.submit(|conn| conn.last_sequence()).await
    }

    /// Drop the bodies of all non-leaf revisions.
    pub async fn compact(&self) -> Result<usize> {
        self.queue
            .submit_transactional(edit::compact)
            .await
    }

    /// Attachment metadata of a revision.
    pub async fn attachments(
        &self,
        doc_id: impl Into<String>,
        rev: &RevId,
    ) -> Result<Vec<Attachment>> {
        let doc_id = doc_id.into();
        let rev = rev.clone();
        self.queue
            .submit(move |conn| {
                let doc = numeric_id(conn, &doc_id)?;
                let sequence = conn
                    .query_revision_exists(doc, &rev)?
                    .ok_or(Error::RevisionNotFound { doc_id, rev })?;
                conn.attachments(sequence)
            })
            .await
    }

    /// Load attachment content from the attachment store.
    pub fn attachment_data(&self, attachment: &Attachment) -> Result<Option<Bytes>> {
        self.attachments
            .get(&attachment.hash)
            .map_err(Error::Attachment)
    }

    /// Shut down the execution queue after the queued work finished.
    pub async fn shutdown(&self) -> Result<()> {
        self.queue.shutdown().await
    }
}

fn numeric_id(conn: &mut Connection, doc_id: &str) -> Result<u64> {
    validate_doc_id(doc_id)?;
    conn.numeric_id(doc_id)?
        .ok_or_else(|| Error::DocumentNotFound(doc_id.to_string()))
}

/// Documents whose winner is not a tombstone, ordered by document id.
fn live_documents(conn: &mut Connection) -> Result<Vec<(u64, String)>> {
    let mut live = Vec::new();
    for (doc, doc_id) in conn.documents()? {
        if conn
            .current_revision(doc, false)?
            .is_some_and(|current| !current.deleted)
        {
            live.push((doc, doc_id));
        }
    }
    live.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(live)
}

fn load_tree(conn: &mut Connection, doc_id: &str, bodies: bool) -> Result<DocumentRevisionTree> {
    let doc = numeric_id(conn, doc_id)?;
    conn.load_tree(doc, bodies)
}
