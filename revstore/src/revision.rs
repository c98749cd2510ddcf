//! Revision identifiers and revision records.
use std::{cmp::Ordering, fmt, str::FromStr};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Position of a revision in the store-wide change feed.
///
/// Sequences are allocated in insertion order and never reused.
pub type Sequence = u64;

/// A revision id of the form `<generation>-<token>`.
///
/// Only the first `-` separates the generation from the token, so tokens may contain dashes.
/// Revision ids compare by their full string form, which is what the winner rule uses to break
/// ties between leaves of equal generation.
#[derive(Clone, PartialEq, Eq, Hash, derive_more::Display, Serialize, Deserialize)]
#[display("{raw}")]
#[serde(try_from = "String", into = "String")]
pub struct RevId {
    generation: u64,
    raw: String,
}

impl RevId {
    /// Create a revision id from a generation and an opaque token.
    pub fn new(generation: u64, token: &str) -> Result<Self> {
        if generation == 0 || token.is_empty() {
            return Err(Error::InvalidRevisionId(format!("{generation}-{token}")));
        }
        Ok(Self {
            generation,
            raw: format!("{generation}-{token}"),
        })
    }

    /// Create a generation 1 revision id with a random token.
    pub fn first() -> Self {
        Self::random(1)
    }

    /// Create a random revision id for a child of this revision.
    ///
    /// Fails if the generation cannot grow any further.
    pub fn child(&self) -> Result<Self> {
        let generation = self
            .next_generation()
            .ok_or_else(|| Error::InvalidRevisionId(format!("child of {}", self.raw)))?;
        Ok(Self::random(generation))
    }

    /// The generation of a child of this revision, `None` on overflow.
    pub fn next_generation(&self) -> Option<u64> {
        self.generation.checked_add(1)
    }

    fn random(generation: u64) -> Self {
        let token = hex::encode(rand::random::<[u8; 16]>());
        Self {
            generation,
            raw: format!("{generation}-{token}"),
        }
    }

    /// The 1-based depth of this revision in its history.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The opaque part after the generation.
    pub fn token(&self) -> &str {
        self.raw
            .split_once('-')
            .map(|(_, token)| token)
            .unwrap_or_default()
    }

    /// The full string form.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Debug for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RevId({})", self.raw)
    }
}

impl Ord for RevId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl PartialOrd for RevId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for RevId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidRevisionId(s.to_string());
        let (generation, token) = s.split_once('-').ok_or_else(invalid)?;
        if generation.is_empty() || !generation.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        // a single spelling per generation
        if generation.len() > 1 && generation.starts_with('0') {
            return Err(invalid());
        }
        let generation: u64 = generation.parse().map_err(|_| invalid())?;
        if generation == 0 || token.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            generation,
            raw: s.to_string(),
        })
    }
}

impl TryFrom<String> for RevId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<RevId> for String {
    fn from(value: RevId) -> Self {
        value.raw
    }
}

/// Check that a document id may be stored.
///
/// Ids must be non-empty. A leading underscore is reserved for `_design/` and `_local/` ids.
pub fn validate_doc_id(doc_id: &str) -> Result<()> {
    let reserved = doc_id.starts_with('_')
        && !(doc_id.starts_with("_design/") || doc_id.starts_with("_local/"));
    if doc_id.is_empty() || reserved {
        return Err(Error::InvalidDocumentId(doc_id.to_string()));
    }
    Ok(())
}

/// One stored revision of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    /// The document this revision belongs to.
    pub doc_id: String,
    /// The revision id.
    pub rev_id: RevId,
    /// Store-wide sequence assigned on insert.
    pub sequence: Sequence,
    /// Sequence of the parent revision, `None` for a root.
    pub parent: Option<Sequence>,
    /// Whether this revision is a tombstone.
    pub deleted: bool,
    /// Whether this revision is the document's winner.
    pub current: bool,
    /// Whether the body is held locally. Stubs are unavailable.
    pub available: bool,
    /// The body, if loaded and available.
    pub body: Option<Bytes>,
}

impl Revision {
    /// The generation of this revision.
    pub fn generation(&self) -> u64 {
        self.rev_id.generation()
    }

    /// Whether this is a body-less stub kept for ancestry.
    pub fn is_stub(&self) -> bool {
        !self.available
    }
}

/// A revision to be inserted together with its history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRevision {
    /// The id the revision was given by its author.
    pub rev_id: RevId,
    /// Whether the revision is a tombstone.
    pub deleted: bool,
    /// The revision body.
    pub body: Option<Bytes>,
}

impl NewRevision {
    /// A live revision with a body.
    pub fn new(rev_id: RevId, body: impl Into<Bytes>) -> Self {
        Self {
            rev_id,
            deleted: false,
            body: Some(body.into()),
        }
    }

    /// A tombstone.
    pub fn deleted(rev_id: RevId) -> Self {
        Self {
            rev_id,
            deleted: true,
            body: None,
        }
    }
}

/// The `_revisions` object exchanged with replication peers.
///
/// `ids` holds the tokens of a revision and its ancestors, newest first, and `start` is the
/// generation of the newest one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revisions {
    /// Generation of the first entry in `ids`.
    pub start: u64,
    /// Revision tokens, newest first.
    pub ids: Vec<String>,
}

impl Revisions {
    /// Build the wire shape from a path of revisions, tip first.
    pub fn from_path<'a>(path: impl IntoIterator<Item = &'a Revision>) -> Self {
        let mut start = 0;
        let mut ids = Vec::new();
        for rev in path {
            if ids.is_empty() {
                start = rev.generation();
            }
            ids.push(rev.rev_id.token().to_string());
        }
        Self { start, ids }
    }

    /// Convert to a history ordered oldest first, ending in the newest revision.
    pub fn into_history(self) -> Result<Vec<RevId>> {
        let len = self.ids.len() as u64;
        if len == 0 || self.start < len {
            return Err(Error::InvalidHistory(format!(
                "start {} cannot hold {} revisions",
                self.start, len
            )));
        }
        let mut history = self
            .ids
            .iter()
            .zip((0..len).map(|offset| self.start - offset))
            .map(|(token, generation)| RevId::new(generation, token))
            .collect::<Result<Vec<_>>>()?;
        history.reverse();
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rev_id() {
        let rev: RevId = "3-abc-def".parse().unwrap();
        assert_eq!(rev.generation(), 3);
        assert_eq!(rev.token(), "abc-def");
        assert_eq!(rev.to_string(), "3-abc-def");

        for invalid in ["", "abc", "0-a", "1-", "-a", "+1-a", "x-a", "1a-b", "01-a", "00-a"] {
            assert!(
                matches!(invalid.parse::<RevId>(), Err(Error::InvalidRevisionId(_))),
                "{invalid} should not parse"
            );
        }
    }

    #[test]
    fn rev_id_order_is_string_order() {
        let a: RevId = "2-a".parse().unwrap();
        let b: RevId = "2-b".parse().unwrap();
        let ten: RevId = "10-a".parse().unwrap();
        assert!(a < b);
        // the full string decides, generations are compared separately by the winner rule
        assert!(ten < a);
    }

    #[test]
    fn random_children() {
        let first = RevId::first();
        assert_eq!(first.generation(), 1);
        assert_eq!(first.token().len(), 32);
        let child = first.child().unwrap();
        assert_eq!(child.generation(), 2);
        assert_ne!(first.token(), child.token());
    }

    #[test]
    fn last_generation_has_no_child() {
        let last: RevId = format!("{}-a", u64::MAX).parse().unwrap();
        assert_eq!(last.next_generation(), None);
        assert!(matches!(last.child(), Err(Error::InvalidRevisionId(_))));
        assert_eq!("10-a".parse::<RevId>().unwrap().generation(), 10);
    }

    #[test]
    fn serde_as_string() {
        #[derive(Debug, Serialize, Deserialize)]
        struct Wrapper {
            rev: RevId,
        }

        let rev: RevId = "4-beef".parse().unwrap();
        let encoded = toml::to_string(&Wrapper { rev: rev.clone() }).unwrap();
        assert_eq!(encoded.trim(), r#"rev = "4-beef""#);
        let parsed: Wrapper = toml::from_str(&encoded).unwrap();
        assert_eq!(parsed.rev, rev);
        assert!(toml::from_str::<Wrapper>(r#"rev = "nope""#).is_err());
    }

    #[test]
    fn revisions_into_history() {
        let revisions = Revisions {
            start: 3,
            ids: vec!["c".into(), "b".into(), "a".into()],
        };
        let history = revisions.into_history().unwrap();
        let expected: Vec<RevId> = ["1-a", "2-b", "3-c"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        assert_eq!(history, expected);

        let too_short = Revisions {
            start: 1,
            ids: vec!["b".into(), "a".into()],
        };
        assert!(matches!(
            too_short.into_history(),
            Err(Error::InvalidHistory(_))
        ));
    }

    #[test]
    fn doc_ids() {
        assert!(validate_doc_id("doc").is_ok());
        assert!(validate_doc_id("_design/views").is_ok());
        assert!(validate_doc_id("_local/checkpoint").is_ok());
        assert!(validate_doc_id("").is_err());
        assert!(validate_doc_id("_users").is_err());
    }
}
