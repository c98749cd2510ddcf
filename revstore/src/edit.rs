//! Local edits and compaction.
//!
//! Local edits always append one revision below an existing leaf, with a freshly generated
//! revision id. Like merges, each edit recomputes the winner before it returns.
use bytes::Bytes;
use tracing::debug;

use crate::{
    error::{Error, Result},
    revision::{validate_doc_id, RevId, Revision},
    store::{Connection, RevisionRow},
    tree::DocumentRevisionTree,
};

/// Create a document with a generation 1 revision.
///
/// If the document exists and its winner is a tombstone, the new revision continues from that
/// tombstone instead. Any other existing document is a conflict.
pub fn create_document(conn: &mut Connection, doc_id: &str, body: Bytes) -> Result<Revision> {
    validate_doc_id(doc_id)?;
    match conn.numeric_id(doc_id)? {
        None => {
            let doc = conn.insert_document_id(doc_id)?;
            let mut tree = DocumentRevisionTree::default();
            append(conn, doc, doc_id, &mut tree, None, false, Some(body))
        }
        Some(doc) => {
            let mut tree = conn.load_tree(doc, false)?;
            let winner = tree.compute_winner()?;
            if !winner.deleted {
                return Err(Error::Conflict {
                    doc_id: doc_id.to_string(),
                });
            }
            let parent = winner.rev_id.clone();
            append(conn, doc, doc_id, &mut tree, Some(parent), false, Some(body))
        }
    }
}

/// Add a revision below `parent`, which must be a live leaf.
pub fn update_document(
    conn: &mut Connection,
    doc_id: &str,
    parent: &RevId,
    body: Bytes,
) -> Result<Revision> {
    let (doc, mut tree) = load_for_edit(conn, doc_id, parent)?;
    append(conn, doc, doc_id, &mut tree, Some(parent.clone()), false, Some(body))
}

/// Add a tombstone below `parent`, which must be a live leaf.
pub fn delete_document(conn: &mut Connection, doc_id: &str, parent: &RevId) -> Result<Revision> {
    let (doc, mut tree) = load_for_edit(conn, doc_id, parent)?;
    append(conn, doc, doc_id, &mut tree, Some(parent.clone()), true, None)
}

/// Tombstone every live leaf of a document.
///
/// Returns the new tombstones, which is empty if the document was deleted already.
pub fn delete_all_leaves(conn: &mut Connection, doc_id: &str) -> Result<Vec<Revision>> {
    let doc = existing(conn, doc_id)?;
    let mut tree = conn.load_tree(doc, false)?;
    let leaves: Vec<RevId> = tree.live_leaves().map(|rev| rev.rev_id.clone()).collect();
    let mut tombstones = Vec::with_capacity(leaves.len());
    for leaf in leaves {
        tombstones.push(append(conn, doc, doc_id, &mut tree, Some(leaf), true, None)?);
    }
    for tombstone in tombstones.iter_mut() {
        tombstone.current = tree
            .lookup(&tombstone.rev_id)
            .is_some_and(|rev| rev.current);
    }
    Ok(tombstones)
}

/// How a conflicted document is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Keep this live leaf and tombstone every other one.
    Keep(RevId),
    /// Append a revision with this body below the winner and tombstone every other live leaf.
    Replace(Bytes),
    /// Tombstone every live leaf.
    Delete,
}

/// Resolve the conflicts of a document in one go.
///
/// `resolver` is handed the live leaves with their bodies, winner first. Returns the winner
/// after the resolution, or `None` if the document had no conflicts or the resolver declined.
pub fn resolve_conflicts<F>(
    conn: &mut Connection,
    doc_id: &str,
    resolver: F,
) -> Result<Option<Revision>>
where
    F: FnOnce(&str, &[Revision]) -> Option<Resolution>,
{
    let doc = existing(conn, doc_id)?;
    let mut tree = conn.load_tree(doc, true)?;
    if !tree.is_conflicted() {
        return Ok(None);
    }
    let winner = tree.compute_winner()?.clone();
    let mut leaves = vec![winner.clone()];
    leaves.extend(tree.conflicts()?.into_iter().cloned());
    let Some(resolution) = resolver(doc_id, &leaves) else {
        debug!(%doc_id, "conflict resolution declined");
        return Ok(None);
    };

    let (keep, replacement) = match resolution {
        Resolution::Keep(rev) => {
            if !tree.contains(&rev) {
                return Err(Error::RevisionNotFound {
                    doc_id: doc_id.to_string(),
                    rev,
                });
            }
            if !leaves.iter().any(|leaf| leaf.rev_id == rev) {
                return Err(Error::Conflict {
                    doc_id: doc_id.to_string(),
                });
            }
            (Some(rev), None)
        }
        Resolution::Replace(body) => (Some(winner.rev_id), Some(body)),
        Resolution::Delete => (None, None),
    };
    for leaf in &leaves {
        if keep.as_ref() != Some(&leaf.rev_id) {
            append(conn, doc, doc_id, &mut tree, Some(leaf.rev_id.clone()), true, None)?;
        }
    }
    if let (Some(keep), Some(body)) = (keep, replacement) {
        append(conn, doc, doc_id, &mut tree, Some(keep), false, Some(body))?;
    }
    let winner = tree
        .current()
        .cloned()
        .ok_or_else(|| Error::invariant(format!("{doc_id} has no winner after resolution")))?;
    debug!(%doc_id, winner = %winner.rev_id, resolved = leaves.len(), "resolved conflicts");
    Ok(Some(winner))
}

fn existing(conn: &mut Connection, doc_id: &str) -> Result<u64> {
    conn.numeric_id(doc_id)?
        .ok_or_else(|| Error::DocumentNotFound(doc_id.to_string()))
}

fn load_for_edit(
    conn: &mut Connection,
    doc_id: &str,
    parent: &RevId,
) -> Result<(u64, DocumentRevisionTree)> {
    let doc = existing(conn, doc_id)?;
    let tree = conn.load_tree(doc, false)?;
    let Some(rev) = tree.lookup(parent) else {
        return Err(Error::RevisionNotFound {
            doc_id: doc_id.to_string(),
            rev: parent.clone(),
        });
    };
    if rev.deleted || !tree.is_leaf(parent) {
        return Err(Error::Conflict {
            doc_id: doc_id.to_string(),
        });
    }
    Ok((doc, tree))
}

fn append(
    conn: &mut Connection,
    doc: u64,
    doc_id: &str,
    tree: &mut DocumentRevisionTree,
    parent: Option<RevId>,
    deleted: bool,
    body: Option<Bytes>,
) -> Result<Revision> {
    let (rev_id, parent) = match parent {
        None => (RevId::first(), None),
        Some(parent) => {
            let sequence = tree
                .lookup(&parent)
                .map(|rev| rev.sequence)
                .ok_or_else(|| Error::invariant(format!("parent {parent} not in tree")))?;
            let rev_id = parent.child().map_err(|_| Error::Conflict {
                doc_id: doc_id.to_string(),
            })?;
            (rev_id, Some(sequence))
        }
    };
    let row = RevisionRow {
        doc,
        rev_id,
        parent,
        deleted,
        current: false,
        available: true,
        body,
    };
    let sequence = conn.insert_revision_row(&row)?;
    let mut revision = row.into_revision(doc_id, sequence);
    tree.add(revision.clone())?;
    let winner = conn.store_winner(tree)?;
    revision.current = winner == sequence;
    debug!(
        %doc_id,
        rev = %revision.rev_id,
        sequence,
        current = revision.current,
        "appended revision"
    );
    Ok(revision)
}

/// Drop the bodies of all revisions that are no longer leaves.
///
/// Returns the number of compacted revisions.
pub fn compact(conn: &mut Connection) -> Result<usize> {
    let mut compacted = 0;
    for (doc, _) in conn.documents()? {
        let tree = conn.load_tree(doc, false)?;
        let sequences: Vec<_> = tree
            .iter()
            .filter(|rev| rev.available && !tree.is_leaf(&rev.rev_id))
            .map(|rev| rev.sequence)
            .collect();
        for sequence in sequences {
            conn.strip_body(sequence)?;
            compacted += 1;
        }
    }
    debug!(compacted, "compaction done");
    Ok(compacted)
}
