//! In-memory revision forest of a single document.
//!
//! Revisions are kept in an arena ordered by insertion, indexed by sequence and by revision id.
//! Parent/child edges are sequence references, mirroring the stored rows.
use std::collections::HashMap;

use crate::{
    error::{Error, Result},
    revision::{RevId, Revision, Sequence},
};

/// The revision forest of one document.
///
/// A document usually has a single root, but histories that diverge all the way down to
/// generation 1 produce additional roots.
#[derive(Debug, Clone, Default)]
pub struct DocumentRevisionTree {
    revisions: Vec<Revision>,
    by_sequence: HashMap<Sequence, usize>,
    by_rev: HashMap<RevId, usize>,
    children: Vec<Vec<usize>>,
    roots: Vec<usize>,
}

impl DocumentRevisionTree {
    /// Build a tree from stored rows, in any order.
    pub fn from_revisions(revisions: impl IntoIterator<Item = Revision>) -> Result<Self> {
        let mut revisions: Vec<_> = revisions.into_iter().collect();
        // parents always have lower sequences than their children
        revisions.sort_by_key(|rev| rev.sequence);
        let mut tree = Self::default();
        for rev in revisions {
            tree.add(rev)?;
        }
        Ok(tree)
    }

    /// Add a revision whose parent, if any, is already part of the tree.
    ///
    /// Returns the arena index of the new node.
    pub fn add(&mut self, revision: Revision) -> Result<usize> {
        if self.by_sequence.contains_key(&revision.sequence) {
            return Err(Error::invariant(format!(
                "sequence {} is already part of the tree",
                revision.sequence
            )));
        }
        if self.by_rev.contains_key(&revision.rev_id) {
            return Err(Error::DuplicateRevision {
                doc_id: revision.doc_id,
                rev: revision.rev_id,
            });
        }
        let parent = match revision.parent {
            None => None,
            Some(parent_seq) => {
                let idx = *self.by_sequence.get(&parent_seq).ok_or_else(|| {
                    Error::invariant(format!("parent sequence {parent_seq} not found"))
                })?;
                let parent = &self.revisions[idx];
                if parent.rev_id.next_generation() != Some(revision.generation()) {
                    return Err(Error::invariant(format!(
                        "{} cannot be a child of {}",
                        revision.rev_id, parent.rev_id
                    )));
                }
                if parent.sequence >= revision.sequence {
                    return Err(Error::invariant(format!(
                        "sequence {} is not after its parent's sequence {}",
                        revision.sequence, parent.sequence
                    )));
                }
                Some(idx)
            }
        };

        let idx = self.revisions.len();
        self.by_sequence.insert(revision.sequence, idx);
        self.by_rev.insert(revision.rev_id.clone(), idx);
        self.revisions.push(revision);
        self.children.push(Vec::new());
        match parent {
            Some(parent) => self.children[parent].push(idx),
            None => self.roots.push(idx),
        }
        Ok(idx)
    }

    /// Number of revisions, stubs included.
    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    /// Whether the tree has no revisions.
    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    /// All revisions in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Revision> {
        self.revisions.iter()
    }

    /// The revision at an arena index.
    pub fn get(&self, idx: usize) -> Option<&Revision> {
        self.revisions.get(idx)
    }

    /// Look up a revision by id.
    pub fn lookup(&self, rev_id: &RevId) -> Option<&Revision> {
        self.by_rev.get(rev_id).map(|idx| &self.revisions[*idx])
    }

    /// Look up a revision by sequence.
    pub fn by_sequence(&self, sequence: Sequence) -> Option<&Revision> {
        self.by_sequence
            .get(&sequence)
            .map(|idx| &self.revisions[*idx])
    }

    /// Whether the revision id is part of the tree.
    pub fn contains(&self, rev_id: &RevId) -> bool {
        self.by_rev.contains_key(rev_id)
    }

    /// The root revisions.
    pub fn roots(&self) -> impl Iterator<Item = &Revision> {
        self.roots.iter().map(|idx| &self.revisions[*idx])
    }

    /// All revisions without children.
    pub fn leaves(&self) -> impl Iterator<Item = &Revision> {
        self.children
            .iter()
            .enumerate()
            .filter(|(_, children)| children.is_empty())
            .map(|(idx, _)| &self.revisions[idx])
    }

    /// Whether the revision with this id has no children.
    pub fn is_leaf(&self, rev_id: &RevId) -> bool {
        self.by_rev
            .get(rev_id)
            .is_some_and(|idx| self.children[*idx].is_empty())
    }

    /// The chain from a revision up to its root, starting with the revision itself.
    pub fn path_to_root(&self, rev_id: &RevId) -> Option<Vec<&Revision>> {
        let mut idx = *self.by_rev.get(rev_id)?;
        let mut path = Vec::new();
        loop {
            let rev = &self.revisions[idx];
            path.push(rev);
            match rev.parent {
                Some(parent) => idx = self.by_sequence[&parent],
                None => break,
            }
        }
        Some(path)
    }

    /// The ids of a revision's ancestors and itself, oldest first.
    pub fn history(&self, rev_id: &RevId) -> Option<Vec<RevId>> {
        let path = self.path_to_root(rev_id)?;
        Some(path.into_iter().rev().map(|rev| rev.rev_id.clone()).collect())
    }

    /// The revision currently flagged as the winner.
    pub fn current(&self) -> Option<&Revision> {
        self.revisions.iter().find(|rev| rev.current)
    }

    /// Apply the winner rule to the leaves of this tree.
    ///
    /// Does not touch any `current` flag, see [`Self::set_current`].
    pub fn compute_winner(&self) -> Result<&Revision> {
        pick_winner(self.leaves())
            .ok_or_else(|| Error::invariant("cannot pick a winner in an empty revision tree"))
    }

    /// Flag the revision with this sequence as the winner and clear every other flag.
    ///
    /// Returns the `(sequence, current)` pairs whose flag changed.
    pub fn set_current(&mut self, sequence: Sequence) -> Vec<(Sequence, bool)> {
        let mut changed = Vec::new();
        for rev in self.revisions.iter_mut() {
            let current = rev.sequence == sequence;
            if rev.current != current {
                rev.current = current;
                changed.push((rev.sequence, current));
            }
        }
        changed
    }

    /// Leaves that are not deleted.
    pub fn live_leaves(&self) -> impl Iterator<Item = &Revision> {
        self.leaves().filter(|rev| !rev.deleted)
    }

    /// Whether more than one non-deleted leaf exists.
    pub fn is_conflicted(&self) -> bool {
        self.live_leaves().nth(1).is_some()
    }

    /// Non-deleted leaves that lost against the winner.
    pub fn conflicts(&self) -> Result<Vec<&Revision>> {
        let winner = self.compute_winner()?;
        Ok(self
            .live_leaves()
            .filter(|rev| rev.sequence != winner.sequence)
            .collect())
    }

    /// Find the deepest entry of `history` (ordered oldest first) present in this tree.
    ///
    /// The history is walked from the tip backwards and the index of the first known entry is
    /// returned.
    pub fn common_ancestor(&self, history: &[RevId]) -> Option<usize> {
        history.iter().rposition(|rev_id| self.contains(rev_id))
    }
}

/// Pick the winning revision among a set of leaves.
///
/// Non-deleted leaves beat deleted ones, then the highest generation wins, and remaining ties
/// go to the lexicographically greatest revision id.
pub fn pick_winner<'a>(leaves: impl IntoIterator<Item = &'a Revision>) -> Option<&'a Revision> {
    leaves
        .into_iter()
        .max_by(|a, b| winner_key(a).cmp(&winner_key(b)))
}

fn winner_key(rev: &Revision) -> (bool, u64, &RevId) {
    (!rev.deleted, rev.generation(), &rev.rev_id)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn rev(rev_id: &str, sequence: Sequence, parent: Option<Sequence>) -> Revision {
        Revision {
            doc_id: "doc".into(),
            rev_id: rev_id.parse().unwrap(),
            sequence,
            parent,
            deleted: false,
            current: false,
            available: true,
            body: None,
        }
    }

    fn deleted(mut rev: Revision) -> Revision {
        rev.deleted = true;
        rev
    }

    fn ids<'a>(revs: impl IntoIterator<Item = &'a Revision>) -> Vec<String> {
        let mut ids: Vec<_> = revs.into_iter().map(|r| r.rev_id.to_string()).collect();
        ids.sort();
        ids
    }

    fn history(ids: &[&str]) -> Vec<RevId> {
        ids.iter().map(|s| s.parse().unwrap()).collect()
    }

    fn branched() -> DocumentRevisionTree {
        DocumentRevisionTree::from_revisions([
            rev("1-a", 1, None),
            rev("2-b", 2, Some(1)),
            rev("3-c", 3, Some(2)),
            rev("2-x", 4, Some(1)),
        ])
        .unwrap()
    }

    #[test]
    fn leaves_and_paths() {
        let tree = branched();
        assert_eq!(tree.len(), 4);
        assert_eq!(ids(tree.leaves()), vec!["2-x", "3-c"]);
        assert_eq!(ids(tree.roots()), vec!["1-a"]);

        let path = tree.path_to_root(&"3-c".parse().unwrap()).unwrap();
        let path: Vec<_> = path.iter().map(|r| r.rev_id.to_string()).collect();
        assert_eq!(path, vec!["3-c", "2-b", "1-a"]);
        assert_eq!(
            tree.history(&"3-c".parse().unwrap()).unwrap(),
            history(&["1-a", "2-b", "3-c"])
        );
        assert!(tree.path_to_root(&"9-z".parse().unwrap()).is_none());
    }

    #[test]
    fn rows_in_any_order() {
        let tree = DocumentRevisionTree::from_revisions([
            rev("2-x", 4, Some(1)),
            rev("3-c", 3, Some(2)),
            rev("1-a", 1, None),
            rev("2-b", 2, Some(1)),
        ])
        .unwrap();
        assert_eq!(ids(tree.leaves()), vec!["2-x", "3-c"]);
    }

    #[test]
    fn rejects_broken_edges() {
        let mut tree = DocumentRevisionTree::default();
        tree.add(rev("1-a", 1, None)).unwrap();
        // unknown parent
        assert!(matches!(
            tree.add(rev("2-b", 2, Some(7))),
            Err(Error::Invariant(_))
        ));
        // generation gap
        assert!(matches!(
            tree.add(rev("3-b", 2, Some(1))),
            Err(Error::Invariant(_))
        ));
        // duplicate revision id
        assert!(matches!(
            tree.add(rev("1-a", 5, None)),
            Err(Error::DuplicateRevision { .. })
        ));
        assert_eq!(tree.len(), 1);
        // nothing follows the last generation
        let last = format!("{}-z", u64::MAX);
        tree.add(rev(&last, 6, None)).unwrap();
        assert!(matches!(
            tree.add(rev("1-b", 7, Some(6))),
            Err(Error::Invariant(_))
        ));
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn winner_rule() {
        // highest generation wins
        let tree = branched();
        assert_eq!(tree.compute_winner().unwrap().rev_id.as_str(), "3-c");

        // equal generation: greatest id wins
        let tree = DocumentRevisionTree::from_revisions([
            rev("1-a", 1, None),
            rev("2-b", 2, Some(1)),
            rev("2-c", 3, Some(1)),
        ])
        .unwrap();
        assert_eq!(tree.compute_winner().unwrap().rev_id.as_str(), "2-c");

        // deleted leaves lose even with a higher generation
        let tree = DocumentRevisionTree::from_revisions([
            rev("1-a", 1, None),
            rev("2-b", 2, Some(1)),
            deleted(rev("3-c", 3, Some(2))),
            rev("2-a", 4, Some(1)),
        ])
        .unwrap();
        assert_eq!(tree.compute_winner().unwrap().rev_id.as_str(), "2-a");

        // all leaves deleted: fall back to the rule among tombstones
        let tree = DocumentRevisionTree::from_revisions([
            rev("1-a", 1, None),
            deleted(rev("2-b", 2, Some(1))),
            deleted(rev("2-c", 3, Some(1))),
        ])
        .unwrap();
        assert_eq!(tree.compute_winner().unwrap().rev_id.as_str(), "2-c");
    }

    #[test]
    fn winner_of_empty_tree() {
        let tree = DocumentRevisionTree::default();
        assert!(matches!(tree.compute_winner(), Err(Error::Invariant(_))));
        assert!(pick_winner(std::iter::empty()).is_none());
    }

    #[test]
    fn set_current_reports_changes() {
        let mut tree = branched();
        let changed = tree.set_current(3);
        assert_eq!(changed, vec![(3, true)]);
        let changed = tree.set_current(4);
        assert_eq!(changed, vec![(3, false), (4, true)]);
        assert_eq!(tree.current().unwrap().rev_id.as_str(), "2-x");
        assert!(tree.set_current(4).is_empty());
    }

    #[test]
    fn conflicts() {
        let tree = branched();
        assert!(tree.is_conflicted());
        assert_eq!(ids(tree.conflicts().unwrap()), vec!["2-x"]);

        let tree = DocumentRevisionTree::from_revisions([
            rev("1-a", 1, None),
            rev("2-b", 2, Some(1)),
            deleted(rev("2-x", 3, Some(1))),
        ])
        .unwrap();
        assert!(!tree.is_conflicted());
        assert!(tree.conflicts().unwrap().is_empty());
    }

    #[test]
    fn multiple_roots() {
        let tree = DocumentRevisionTree::from_revisions([
            rev("1-a", 1, None),
            rev("2-b", 2, Some(1)),
            rev("1-z", 3, None),
            rev("2-y", 4, Some(3)),
        ])
        .unwrap();
        assert_eq!(ids(tree.roots()), vec!["1-a", "1-z"]);
        assert!(tree.is_conflicted());
        assert_eq!(tree.compute_winner().unwrap().rev_id.as_str(), "2-y");
    }

    #[test]
    fn common_ancestor_from_tip() {
        let tree = branched();
        assert_eq!(
            tree.common_ancestor(&history(&["1-a", "2-b", "3-c", "4-d"])),
            Some(2)
        );
        assert_eq!(tree.common_ancestor(&history(&["1-a", "2-q"])), Some(0));
        assert_eq!(tree.common_ancestor(&history(&["1-q", "2-q"])), None);
        // a truncated history only knows its own entries
        assert_eq!(tree.common_ancestor(&history(&["2-x", "3-y"])), Some(0));
    }
}
