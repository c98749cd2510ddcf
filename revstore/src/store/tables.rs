#![allow(missing_docs)]
// Table Definitions

use redb::{Table, TableDefinition, WriteTransaction};

/// Table: Documents
/// Key:   `&str` # document id
/// Value: `u64`  # numeric document id
pub const DOCS_TABLE: TableDefinition<&str, u64> = TableDefinition::new("docs-1");

/// Table: Document names
/// Key:   `u64`  # numeric document id
/// Value: `&str` # document id
pub const DOC_NAMES_TABLE: TableDefinition<u64, &str> = TableDefinition::new("doc-names-1");

/// Table: Revisions
/// Key:   `u64` # sequence
/// Value: `(u64, &str, Option<u64>, bool, bool, bool)`
///      # (numeric document id, revision id, parent sequence, deleted, current, available)
pub const REVS_TABLE: TableDefinition<u64, RevsValue> = TableDefinition::new("revs-1");
pub type RevsValue<'a> = (u64, &'a str, Option<u64>, bool, bool, bool);

/// Table: Revision bodies
/// Key:   `u64`   # sequence
/// Value: `&[u8]` # body
pub const BODIES_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("rev-bodies-1");

/// Table: Revisions by document
/// Key:   `(u64, &str)` # (numeric document id, revision id)
/// Value: `u64`         # sequence
pub const REVS_BY_DOC_TABLE: TableDefinition<RevsByDocKey, u64> =
    TableDefinition::new("revs-by-doc-1");
pub type RevsByDocKey<'a> = (u64, &'a str);

/// Table: Current revision per document
/// Key:   `u64` # numeric document id
/// Value: `u64` # sequence of the winner
pub const CURRENT_TABLE: TableDefinition<u64, u64> = TableDefinition::new("current-1");

/// Table: Attachments
/// Key:   `(u64, &str)` # (sequence, attachment name)
/// Value: `(&str, u64, u64, [u8; 32])`
///      # (content type, length, revpos, blake3 hash)
pub const ATTACHMENTS_TABLE: TableDefinition<AttachmentsKey, AttachmentsValue> =
    TableDefinition::new("attachments-1");
pub type AttachmentsKey<'a> = (u64, &'a str);
pub type AttachmentsValue<'a> = (&'a str, u64, u64, &'a [u8; 32]);

/// Table: Metadata
/// Key:   `&str` # name
/// Value: `u64`
pub const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta-1");

pub const SCHEMA_VERSION_KEY: &str = "schema-version";

#[derive(derive_more::Debug)]
pub struct Tables<'tx> {
    pub docs: Table<'tx, &'static str, u64>,
    pub doc_names: Table<'tx, u64, &'static str>,
    pub revs: Table<'tx, u64, RevsValue<'static>>,
    pub bodies: Table<'tx, u64, &'static [u8]>,
    pub revs_by_doc: Table<'tx, RevsByDocKey<'static>, u64>,
    pub current: Table<'tx, u64, u64>,
    pub attachments: Table<'tx, AttachmentsKey<'static>, AttachmentsValue<'static>>,
    pub meta: Table<'tx, &'static str, u64>,
}

impl<'tx> Tables<'tx> {
    pub fn new(tx: &'tx WriteTransaction) -> Result<Self, redb::TableError> {
        let docs = tx.open_table(DOCS_TABLE)?;
        let doc_names = tx.open_table(DOC_NAMES_TABLE)?;
        let revs = tx.open_table(REVS_TABLE)?;
        let bodies = tx.open_table(BODIES_TABLE)?;
        let revs_by_doc = tx.open_table(REVS_BY_DOC_TABLE)?;
        let current = tx.open_table(CURRENT_TABLE)?;
        let attachments = tx.open_table(ATTACHMENTS_TABLE)?;
        let meta = tx.open_table(META_TABLE)?;
        Ok(Self {
            docs,
            doc_names,
            revs,
            bodies,
            revs_by_doc,
            current,
            attachments,
            meta,
        })
    }
}
