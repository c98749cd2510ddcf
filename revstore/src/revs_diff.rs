//! Finding which of a peer's revisions are missing locally.
use std::collections::{BTreeMap, BTreeSet};

use crate::{
    error::Result,
    revision::RevId,
    store::Connection,
    tree::DocumentRevisionTree,
};

/// Revisions a document is missing, and local revisions a peer may use as a base.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevsDiffEntry {
    /// Requested revisions not present locally.
    pub missing: BTreeSet<RevId>,
    /// Local revisions of lower generation than a missing one.
    ///
    /// These are not necessarily ancestors of the missing revisions.
    pub possible_ancestors: BTreeSet<RevId>,
}

/// Compare the requested revisions against the local trees.
///
/// Documents with nothing missing are left out of the result.
pub fn revs_diff(
    conn: &mut Connection,
    requested: &BTreeMap<String, BTreeSet<RevId>>,
    max_possible_ancestors: usize,
) -> Result<BTreeMap<String, RevsDiffEntry>> {
    let mut diff = BTreeMap::new();
    for (doc_id, revs) in requested {
        let entry = match conn.numeric_id(doc_id)? {
            None => RevsDiffEntry {
                missing: revs.clone(),
                possible_ancestors: BTreeSet::new(),
            },
            Some(doc) => {
                let tree = conn.load_tree(doc, false)?;
                diff_tree(&tree, revs, max_possible_ancestors)
            }
        };
        if !entry.missing.is_empty() {
            diff.insert(doc_id.clone(), entry);
        }
    }
    Ok(diff)
}

/// Compare requested revisions against one document's tree.
pub fn diff_tree(
    tree: &DocumentRevisionTree,
    requested: &BTreeSet<RevId>,
    max_possible_ancestors: usize,
) -> RevsDiffEntry {
    let missing: BTreeSet<RevId> = requested
        .iter()
        .filter(|rev_id| !tree.contains(rev_id))
        .cloned()
        .collect();
    let mut possible_ancestors = BTreeSet::new();
    for rev_id in &missing {
        for candidate in possible_ancestors_of(tree, rev_id, max_possible_ancestors) {
            if possible_ancestors.len() >= max_possible_ancestors {
                break;
            }
            possible_ancestors.insert(candidate);
        }
    }
    RevsDiffEntry {
        missing,
        possible_ancestors,
    }
}

/// Local revisions that could precede `rev_id`, newest first.
///
/// Only live revisions with a body and a lower generation qualify. Generation 1 has no
/// ancestors.
pub fn possible_ancestors_of(
    tree: &DocumentRevisionTree,
    rev_id: &RevId,
    limit: usize,
) -> Vec<RevId> {
    if rev_id.generation() <= 1 {
        return Vec::new();
    }
    let mut candidates: Vec<_> = tree
        .iter()
        .filter(|rev| rev.available && !rev.deleted && rev.generation() < rev_id.generation())
        .collect();
    candidates.sort_by(|a, b| b.sequence.cmp(&a.sequence));
    candidates
        .into_iter()
        .take(limit)
        .map(|rev| rev.rev_id.clone())
        .collect()
}
