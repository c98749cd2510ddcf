//! Merging revisions that arrive together with their history.
//!
//! This is the replication ingest path. The incoming history is attached below the deepest
//! revision the local tree already knows. Ancestors the tree has never seen are inserted as
//! body-less stubs, and the winner is recomputed once at the end.
use std::collections::BTreeMap;

use tracing::debug;

use crate::{
    attachments::{Attachment, AttachmentInput, AttachmentStore},
    error::{Error, Result},
    revision::{validate_doc_id, NewRevision, RevId, Sequence},
    store::{Connection, RevisionRow},
    tree::DocumentRevisionTree,
};

/// A revision together with its history, ready to be merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForceInsertItem {
    /// The document id.
    pub doc_id: String,
    /// The new tip.
    pub revision: NewRevision,
    /// Ids from the oldest known ancestor up to and including the new tip.
    pub history: Vec<RevId>,
    /// Attachments of the new tip, by name.
    pub attachments: BTreeMap<String, AttachmentInput>,
}

impl ForceInsertItem {
    /// Create an item without attachments.
    pub fn new(doc_id: impl Into<String>, revision: NewRevision, history: Vec<RevId>) -> Self {
        Self {
            doc_id: doc_id.into(),
            revision,
            history,
            attachments: Default::default(),
        }
    }

    /// Add an attachment to the new tip.
    pub fn with_attachment(mut self, name: impl Into<String>, input: AttachmentInput) -> Self {
        self.attachments.insert(name.into(), input);
        self
    }
}

/// How an incoming history was attached to the local tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeCase {
    /// The document did not exist locally.
    NewDocument,
    /// The history was attached below a known revision.
    CommonAncestor {
        /// Position of the deepest known revision in the history.
        index: usize,
    },
    /// The document exists but shares no revision with the history, which became a new root.
    DisjointRoot,
}

/// Result of a successful merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Sequence of the inserted tip.
    pub sequence: Sequence,
    /// How the history was attached.
    pub case: MergeCase,
    /// The document's winner after the merge.
    pub winner: RevId,
    /// Whether the document has conflicting leaves after the merge.
    pub conflicted: bool,
}

/// Check the shape of an incoming history.
///
/// The history must be non-empty, end in the new tip, and increase the generation by exactly
/// one per entry.
pub fn validate_history(doc_id: &str, revision: &NewRevision, history: &[RevId]) -> Result<()> {
    validate_doc_id(doc_id)?;
    let Some(tip) = history.last() else {
        return Err(Error::InvalidHistory("history is empty".into()));
    };
    if *tip != revision.rev_id {
        return Err(Error::InvalidHistory(format!(
            "history ends in {tip} instead of {}",
            revision.rev_id
        )));
    }
    for pair in history.windows(2) {
        if pair[0].next_generation() != Some(pair[1].generation()) {
            return Err(Error::InvalidHistory(format!(
                "{} does not follow {}",
                pair[1], pair[0]
            )));
        }
    }
    Ok(())
}

/// Merge one revision and its history into the store.
///
/// Should run inside a transaction, so that a failure leaves no partial history behind.
pub fn force_insert(
    conn: &mut Connection,
    store: &dyn AttachmentStore,
    item: &ForceInsertItem,
) -> Result<MergeOutcome> {
    let ForceInsertItem {
        doc_id,
        revision,
        history,
        attachments,
    } = item;
    validate_history(doc_id, revision, history)?;

    let (doc, mut tree) = match conn.numeric_id(doc_id)? {
        Some(doc) => (doc, conn.load_tree(doc, false)?),
        None => (conn.insert_document_id(doc_id)?, DocumentRevisionTree::default()),
    };
    if tree.contains(&revision.rev_id) {
        return Err(Error::DuplicateRevision {
            doc_id: doc_id.clone(),
            rev: revision.rev_id.clone(),
        });
    }

    let (case, start, mut parent) = if tree.is_empty() {
        (MergeCase::NewDocument, 0, None)
    } else {
        match tree.common_ancestor(history) {
            Some(index) => {
                let ancestor = tree.lookup(&history[index]).ok_or_else(|| {
                    Error::invariant(format!("ancestor {} vanished", history[index]))
                })?;
                (
                    MergeCase::CommonAncestor { index },
                    index + 1,
                    Some(ancestor.sequence),
                )
            }
            None => (MergeCase::DisjointRoot, 0, None),
        }
    };
    debug!(%doc_id, rev = %revision.rev_id, ?case, "merging revision history");

    let tip = history.len() - 1;
    for rev_id in &history[start..tip] {
        let row = RevisionRow::stub(doc, rev_id.clone(), parent);
        let sequence = conn.insert_revision_row(&row)?;
        tree.add(row.into_revision(doc_id.as_str(), sequence))?;
        parent = Some(sequence);
    }
    let row = RevisionRow {
        doc,
        rev_id: revision.rev_id.clone(),
        parent,
        deleted: revision.deleted,
        current: false,
        available: true,
        body: revision.body.clone(),
    };
    let sequence = conn.insert_revision_row(&row)?;
    tree.add(row.into_revision(doc_id.as_str(), sequence))?;

    if !attachments.is_empty() {
        store_attachments(conn, store, &tree, &revision.rev_id, sequence, attachments)?;
    }

    let winner = conn.store_winner(&mut tree)?;
    let winner = tree
        .by_sequence(winner)
        .map(|rev| rev.rev_id.clone())
        .ok_or_else(|| Error::invariant(format!("winner sequence {winner} not in tree")))?;
    Ok(MergeOutcome {
        sequence,
        case,
        winner,
        conflicted: tree.is_conflicted(),
    })
}

/// Merge several items, in order. Stops at the first failure.
pub fn force_insert_many(
    conn: &mut Connection,
    store: &dyn AttachmentStore,
    items: &[ForceInsertItem],
) -> Result<Vec<MergeOutcome>> {
    items
        .iter()
        .map(|item| force_insert(conn, store, item))
        .collect()
}

/// Record the attachments of a freshly inserted tip.
///
/// Attachments are diffed against those of the nearest ancestor holding a body: stubs copy the
/// ancestor's entry, and inline content that did not change keeps the ancestor's revpos.
fn store_attachments(
    conn: &mut Connection,
    store: &dyn AttachmentStore,
    tree: &DocumentRevisionTree,
    tip: &RevId,
    sequence: Sequence,
    attachments: &BTreeMap<String, AttachmentInput>,
) -> Result<()> {
    let path = tree
        .path_to_root(tip)
        .ok_or_else(|| Error::invariant(format!("{tip} not in tree")))?;
    let base: BTreeMap<String, Attachment> = match path.iter().skip(1).find(|rev| rev.available) {
        Some(ancestor) => conn
            .attachments(ancestor.sequence)?
            .into_iter()
            .map(|attachment| (attachment.name.clone(), attachment))
            .collect(),
        None => BTreeMap::new(),
    };

    for (name, input) in attachments {
        let attachment = match input {
            AttachmentInput::Stub => {
                base.get(name)
                    .cloned()
                    .ok_or_else(|| Error::MissingAttachmentStub {
                        doc_id: path[0].doc_id.clone(),
                        name: name.clone(),
                    })?
            }
            AttachmentInput::Inline { content_type, data } => {
                let hash = store.put(data.clone()).map_err(Error::Attachment)?;
                let revpos = match base.get(name) {
                    Some(prev) if prev.hash == hash => prev.revpos,
                    _ => tip.generation(),
                };
                Attachment {
                    name: name.clone(),
                    content_type: content_type.clone(),
                    length: data.len() as u64,
                    revpos,
                    hash,
                }
            }
        };
        conn.insert_attachment(sequence, &attachment)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::attachments::MemAttachmentStore;

    fn history(ids: &[&str]) -> Vec<RevId> {
        ids.iter().map(|s| s.parse().unwrap()).collect()
    }

    fn item(doc_id: &str, ids: &[&str]) -> ForceInsertItem {
        let history = history(ids);
        let tip = history.last().cloned().unwrap();
        ForceInsertItem::new(doc_id, NewRevision::new(tip.clone(), tip.to_string()), history)
    }

    fn merge(conn: &mut Connection, item: &ForceInsertItem) -> Result<MergeOutcome> {
        let store = MemAttachmentStore::default();
        conn.transaction(|conn| force_insert(conn, &store, item))
    }

    fn tree(conn: &mut Connection, doc_id: &str) -> DocumentRevisionTree {
        let doc = conn.numeric_id(doc_id).unwrap().unwrap();
        conn.load_tree(doc, true).unwrap()
    }

    #[test]
    fn new_document_gets_stubs() -> Result<()> {
        let mut conn = Connection::memory()?;
        let outcome = merge(&mut conn, &item("doc", &["1-a", "2-b", "3-x"]))?;
        assert_eq!(outcome.case, MergeCase::NewDocument);
        assert_eq!(outcome.winner.as_str(), "3-x");
        assert!(!outcome.conflicted);

        let tree = tree(&mut conn, "doc");
        assert_eq!(tree.len(), 3);
        for stub in ["1-a", "2-b"] {
            let rev = tree.lookup(&stub.parse()?).unwrap();
            assert!(!rev.available);
            assert!(!rev.current);
            assert!(!rev.deleted);
            assert!(rev.body.is_none());
        }
        let tip = tree.lookup(&"3-x".parse()?).unwrap();
        assert!(tip.available && tip.current);
        assert_eq!(tip.sequence, outcome.sequence);
        assert_eq!(tip.body.as_deref(), Some(&b"3-x"[..]));
        Ok(())
    }

    #[test]
    fn attach_below_common_ancestor() -> Result<()> {
        let mut conn = Connection::memory()?;
        merge(&mut conn, &item("doc", &["1-a", "2-b"]))?;
        let outcome = merge(&mut conn, &item("doc", &["1-a", "2-b", "3-c", "4-d"]))?;
        assert_eq!(outcome.case, MergeCase::CommonAncestor { index: 1 });
        assert_eq!(outcome.winner.as_str(), "4-d");

        let tree = tree(&mut conn, "doc");
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.leaves().count(), 1);
        assert!(tree.lookup(&"3-c".parse()?).unwrap().is_stub());
        // the old winner is no longer current
        assert!(!tree.lookup(&"2-b".parse()?).unwrap().current);
        Ok(())
    }

    #[test]
    fn branch_creates_conflict() -> Result<()> {
        let mut conn = Connection::memory()?;
        merge(&mut conn, &item("doc", &["1-a", "2-b"]))?;
        let outcome = merge(&mut conn, &item("doc", &["1-a", "2-c"]))?;
        assert_eq!(outcome.case, MergeCase::CommonAncestor { index: 0 });
        assert!(outcome.conflicted);
        assert_eq!(outcome.winner.as_str(), "2-c");
        let tree = tree(&mut conn, "doc");
        assert_eq!(tree.leaves().count(), 2);
        assert_eq!(tree.current().unwrap().rev_id.as_str(), "2-c");
        Ok(())
    }

    #[test]
    fn disjoint_history_becomes_new_root() -> Result<()> {
        let mut conn = Connection::memory()?;
        merge(&mut conn, &item("doc", &["1-a", "2-b"]))?;
        let outcome = merge(&mut conn, &item("doc", &["1-x", "2-y", "3-z"]))?;
        assert_eq!(outcome.case, MergeCase::DisjointRoot);
        assert!(outcome.conflicted);
        assert_eq!(outcome.winner.as_str(), "3-z");
        let tree = tree(&mut conn, "doc");
        assert_eq!(tree.roots().count(), 2);
        assert_eq!(tree.len(), 5);
        Ok(())
    }

    #[test]
    fn truncated_history() -> Result<()> {
        let mut conn = Connection::memory()?;
        merge(&mut conn, &item("doc", &["1-a", "2-b", "3-c"]))?;
        // peers may send only the most recent part of a long history
        let outcome = merge(&mut conn, &item("doc", &["3-c", "4-d"]))?;
        assert_eq!(outcome.case, MergeCase::CommonAncestor { index: 0 });
        assert_eq!(tree(&mut conn, "doc").len(), 4);
        Ok(())
    }

    #[test]
    fn duplicate_leaves_tree_unchanged() -> Result<()> {
        let mut conn = Connection::memory()?;
        let item = item("doc", &["1-a", "2-b"]);
        merge(&mut conn, &item)?;
        let before = tree(&mut conn, "doc");
        let last_sequence = conn.last_sequence()?;
        let err = merge(&mut conn, &item).unwrap_err();
        assert!(err.is_duplicate());
        let after = tree(&mut conn, "doc");
        assert_eq!(
            before.iter().collect::<Vec<_>>(),
            after.iter().collect::<Vec<_>>()
        );
        assert_eq!(conn.last_sequence()?, last_sequence);
        Ok(())
    }

    #[test]
    fn validation_happens_before_mutation() -> Result<()> {
        let mut conn = Connection::memory()?;
        let leaf = NewRevision::new("2-b".parse()?, "body");
        let cases = [
            ForceInsertItem::new("doc", leaf.clone(), vec![]),
            ForceInsertItem::new("doc", leaf.clone(), history(&["1-a", "2-c"])),
            ForceInsertItem::new("doc", leaf.clone(), history(&["2-b", "1-a"])),
            ForceInsertItem::new("doc", leaf.clone(), history(&["1-a", "3-x", "2-b"])),
        ];
        for item in &cases {
            assert!(matches!(
                merge(&mut conn, item),
                Err(Error::InvalidHistory(_))
            ));
        }
        let bad_doc = ForceInsertItem::new("_bad", leaf, history(&["1-a", "2-b"]));
        assert!(matches!(
            merge(&mut conn, &bad_doc),
            Err(Error::InvalidDocumentId(_))
        ));
        assert_eq!(conn.numeric_id("doc")?, None);
        assert_eq!(conn.last_sequence()?, 0);
        Ok(())
    }

    #[test]
    fn deleted_tip_loses() -> Result<()> {
        let mut conn = Connection::memory()?;
        merge(&mut conn, &item("doc", &["1-a", "2-b"]))?;
        let tombstone = ForceInsertItem::new(
            "doc",
            NewRevision::deleted("3-c".parse()?),
            history(&["1-a", "2-x", "3-c"]),
        );
        let outcome = merge(&mut conn, &tombstone)?;
        assert_eq!(outcome.winner.as_str(), "2-b");
        assert!(!outcome.conflicted);
        Ok(())
    }

    #[test]
    fn attachments_are_diffed_against_ancestor() -> Result<()> {
        let mut conn = Connection::memory()?;
        let store = MemAttachmentStore::default();
        let inline = |data: &'static [u8]| AttachmentInput::Inline {
            content_type: "text/plain".into(),
            data: Bytes::from_static(data),
        };

        let first = item("doc", &["1-a"])
            .with_attachment("keep.txt", inline(b"same"))
            .with_attachment("edit.txt", inline(b"old"));
        let first = conn.transaction(|conn| force_insert(conn, &store, &first))?;

        let second = item("doc", &["1-a", "2-b"])
            .with_attachment("keep.txt", AttachmentInput::Stub)
            .with_attachment("edit.txt", inline(b"new"));
        let second = conn.transaction(|conn| force_insert(conn, &store, &second))?;

        let attachments = conn.attachments(second.sequence)?;
        assert_eq!(attachments.len(), 2);
        let edit = &attachments[0];
        assert_eq!(edit.name, "edit.txt");
        assert_eq!(edit.revpos, 2);
        assert_eq!(store.get(&edit.hash).unwrap(), Some(Bytes::from_static(b"new")));
        let keep = &attachments[1];
        assert_eq!(keep.revpos, 1);
        assert_eq!(conn.attachments(first.sequence)?[1], *keep);
        assert_eq!(store.len(), 3);
        Ok(())
    }

    #[test]
    fn missing_stub_rolls_back() -> Result<()> {
        let mut conn = Connection::memory()?;
        let store = MemAttachmentStore::default();
        // the ancestors are stubs themselves, so nothing can back the attachment
        let item = item("doc", &["1-a", "2-b"]).with_attachment("a.txt", AttachmentInput::Stub);
        let err = conn
            .transaction(|conn| force_insert(conn, &store, &item))
            .unwrap_err();
        assert!(matches!(err, Error::MissingAttachmentStub { .. }));
        assert_eq!(conn.numeric_id("doc")?, None);
        Ok(())
    }

    #[test]
    fn batch_is_all_or_nothing() -> Result<()> {
        let mut conn = Connection::memory()?;
        let store = MemAttachmentStore::default();
        let items = [item("a", &["1-a"]), item("b", &["1-b"]), item("a", &["1-a"])];
        let err = conn
            .transaction(|conn| force_insert_many(conn, &store, &items))
            .unwrap_err();
        assert!(err.is_duplicate());
        assert_eq!(conn.numeric_id("a")?, None);
        assert_eq!(conn.numeric_id("b")?, None);

        let outcomes =
            conn.transaction(|conn| force_insert_many(conn, &store, &items[..2]))?;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].sequence < outcomes[1].sequence);
        Ok(())
    }
}
