//! Storage of documents and revisions in a redb database.
//!
//! A [`Connection`] owns the database. Every statement runs inside the currently open
//! transaction, or in a transaction of its own when none is open.
use std::{collections::BTreeMap, path::Path};

use bytes::Bytes;
use redb::{backends::InMemoryBackend, Database, ReadableTable, WriteTransaction};
use tracing::{debug, info, trace};

use crate::{
    attachments::{Attachment, AttachmentHash},
    config::StoreConfig,
    error::{Error, Result},
    revision::{RevId, Revision, Sequence},
    tree::DocumentRevisionTree,
};

mod migrations;
mod tables;

pub use migrations::MigrateOutcome;
use tables::{RevsValue, Tables, SCHEMA_VERSION_KEY};

/// Schema version written by the built-in migrations.
pub const SCHEMA_VERSION: u64 = migrations::LATEST_VERSION;

/// A revision row to insert.
#[derive(Debug, Clone)]
pub struct RevisionRow {
    /// Numeric id of the owning document.
    pub doc: u64,
    /// The revision id.
    pub rev_id: RevId,
    /// Sequence of the parent revision.
    pub parent: Option<Sequence>,
    /// Tombstone flag.
    pub deleted: bool,
    /// Winner flag.
    pub current: bool,
    /// Whether a body is held.
    pub available: bool,
    /// The body.
    pub body: Option<Bytes>,
}

impl RevisionRow {
    /// A body-less ancestor kept for history continuity.
    pub fn stub(doc: u64, rev_id: RevId, parent: Option<Sequence>) -> Self {
        Self {
            doc,
            rev_id,
            parent,
            deleted: false,
            current: false,
            available: false,
            body: None,
        }
    }

    /// The revision this row becomes once stored under `sequence`.
    pub fn into_revision(self, doc_id: impl Into<String>, sequence: Sequence) -> Revision {
        Revision {
            doc_id: doc_id.into(),
            rev_id: self.rev_id,
            sequence,
            parent: self.parent,
            deleted: self.deleted,
            current: self.current,
            available: self.available,
            body: self.body,
        }
    }
}

/// Decoded value of the revs table.
#[derive(Debug, Clone)]
struct StoredRow {
    doc: u64,
    rev_id: RevId,
    parent: Option<Sequence>,
    deleted: bool,
    current: bool,
    available: bool,
}

impl StoredRow {
    fn decode(value: RevsValue<'_>) -> Result<Self> {
        let (doc, rev_id, parent, deleted, current, available) = value;
        Ok(Self {
            doc,
            rev_id: rev_id.parse()?,
            parent,
            deleted,
            current,
            available,
        })
    }

    fn encode(&self) -> RevsValue<'_> {
        (
            self.doc,
            self.rev_id.as_str(),
            self.parent,
            self.deleted,
            self.current,
            self.available,
        )
    }

    fn into_revision(self, doc_id: String, sequence: Sequence, body: Option<Bytes>) -> Revision {
        Revision {
            doc_id,
            rev_id: self.rev_id,
            sequence,
            parent: self.parent,
            deleted: self.deleted,
            current: self.current,
            available: self.available,
            body,
        }
    }
}

#[derive(derive_more::Debug)]
struct OpenTransaction {
    #[debug("WriteTransaction")]
    tx: WriteTransaction,
    depth: usize,
    poisoned: bool,
}

/// The single connection to the storage engine.
///
/// Only the execution queue's worker holds a connection, see [`crate::queue`].
#[derive(derive_more::Debug)]
pub struct Connection {
    #[debug("Database")]
    db: Database,
    tx: Option<OpenTransaction>,
    enforce_references: bool,
}

impl Connection {
    /// Create an in-memory database.
    pub fn memory() -> Result<Self> {
        Self::open(&StoreConfig::memory())
    }

    /// Create or open a database file.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(&StoreConfig::persistent(path.as_ref()))
    }

    /// Open the database described by `config` and bring its schema up to date.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let db = match &config.path {
            Some(path) => Database::create(path)?,
            None => Database::builder().create_with_backend(InMemoryBackend::new())?,
        };
        let mut conn = Self {
            db,
            tx: None,
            enforce_references: true,
        };
        migrations::run_migrations(&mut conn)?;
        Ok(conn)
    }

    /// Depth of nested transactions, `0` when none is open.
    pub fn transaction_depth(&self) -> usize {
        self.tx.as_ref().map(|open| open.depth).unwrap_or(0)
    }

    /// Run `f` inside a transaction.
    ///
    /// Transactions nest: only the outermost call commits or rolls back. If any nested call
    /// fails, the whole outer transaction is rolled back, and an outer call that otherwise
    /// succeeded returns [`Error::TransactionPoisoned`].
    pub fn transaction<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.begin_transaction()?;
        let res = f(self);
        let end = self.end_transaction(res.is_ok());
        match (res, end) {
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err),
            (Ok(value), Ok(())) => Ok(value),
        }
    }

    fn begin_transaction(&mut self) -> Result<()> {
        if let Some(open) = self.tx.as_mut() {
            open.depth += 1;
            return Ok(());
        }
        let tx = self.db.begin_write()?;
        debug!("begin transaction");
        self.tx = Some(OpenTransaction {
            tx,
            depth: 1,
            poisoned: false,
        });
        Ok(())
    }

    fn end_transaction(&mut self, success: bool) -> Result<()> {
        let Some(open) = self.tx.as_mut() else {
            return Err(Error::invariant("no transaction to end"));
        };
        open.poisoned |= !success;
        open.depth -= 1;
        if open.depth > 0 {
            return Ok(());
        }
        let Some(open) = self.tx.take() else {
            return Err(Error::invariant("no transaction to end"));
        };
        if open.poisoned {
            open.tx.abort()?;
            debug!("rollback transaction");
            if success {
                return Err(Error::TransactionPoisoned);
            }
        } else {
            open.tx.commit()?;
            debug!("commit transaction");
        }
        Ok(())
    }

    /// Run `f` against the tables of the open transaction, or of a transaction of its own.
    fn with_tables<T>(&mut self, f: impl FnOnce(&mut Tables<'_>) -> Result<T>) -> Result<T> {
        if let Some(open) = &self.tx {
            let mut tables = Tables::new(&open.tx)?;
            return f(&mut tables);
        }
        let tx = self.db.begin_write()?;
        let res = {
            let mut tables = Tables::new(&tx)?;
            f(&mut tables)
        };
        match res {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                tx.abort().ok();
                Err(err)
            }
        }
    }

    /// Register a new document id and return its numeric id.
    pub fn insert_document_id(&mut self, doc_id: &str) -> Result<u64> {
        self.with_tables(|t| {
            if t.docs.get(doc_id)?.is_some() {
                return Err(Error::DocumentExists(doc_id.to_string()));
            }
            let numeric = match t.doc_names.last()? {
                Some((key, _)) => key.value() + 1,
                None => 1,
            };
            t.docs.insert(doc_id, numeric)?;
            t.doc_names.insert(numeric, doc_id)?;
            Ok(numeric)
        })
    }

    /// The numeric id of a document.
    pub fn numeric_id(&mut self, doc_id: &str) -> Result<Option<u64>> {
        self.with_tables(|t| Ok(t.docs.get(doc_id)?.map(|v| v.value())))
    }

    /// The document id for a numeric id.
    pub fn doc_id(&mut self, doc: u64) -> Result<Option<String>> {
        self.with_tables(|t| doc_name(t, doc))
    }

    /// All documents as `(numeric id, document id)`, ordered by numeric id.
    pub fn documents(&mut self) -> Result<Vec<(u64, String)>> {
        self.with_tables(|t| {
            let mut docs = Vec::new();
            for item in t.doc_names.iter()? {
                let (key, value) = item?;
                docs.push((key.value(), value.value().to_string()));
            }
            Ok(docs)
        })
    }

    /// Insert a revision row and return its newly allocated sequence.
    ///
    /// Fails with [`Error::DuplicateRevision`] if the document already has this revision.
    pub fn insert_revision_row(&mut self, row: &RevisionRow) -> Result<Sequence> {
        let enforce_references = self.enforce_references;
        self.with_tables(|t| {
            if t.revs_by_doc
                .get((row.doc, row.rev_id.as_str()))?
                .is_some()
            {
                let doc_id = doc_name(t, row.doc)?.unwrap_or_default();
                return Err(Error::DuplicateRevision {
                    doc_id,
                    rev: row.rev_id.clone(),
                });
            }
            if enforce_references {
                check_references(t, row)?;
            }
            let sequence = match t.revs.last()? {
                Some((key, _)) => key.value() + 1,
                None => 1,
            };
            t.revs.insert(
                sequence,
                (
                    row.doc,
                    row.rev_id.as_str(),
                    row.parent,
                    row.deleted,
                    row.current,
                    row.available,
                ),
            )?;
            t.revs_by_doc
                .insert((row.doc, row.rev_id.as_str()), sequence)?;
            if let Some(body) = &row.body {
                t.bodies.insert(sequence, body.as_ref())?;
            }
            if row.current {
                t.current.insert(row.doc, sequence)?;
            }
            trace!(rev = %row.rev_id, sequence, "inserted revision");
            Ok(sequence)
        })
    }

    /// Set or clear the winner flag of a revision.
    pub fn update_current_flag(&mut self, sequence: Sequence, current: bool) -> Result<()> {
        self.with_tables(|t| {
            let mut row = read_row(t, sequence)?;
            row.current = current;
            t.revs.insert(sequence, row.encode())?;
            if current {
                t.current.insert(row.doc, sequence)?;
            } else {
                let indexed = t.current.get(row.doc)?.is_some_and(|v| v.value() == sequence);
                if indexed {
                    t.current.remove(row.doc)?;
                }
            }
            Ok(())
        })
    }

    /// Drop the body of a revision and mark it unavailable.
    pub fn strip_body(&mut self, sequence: Sequence) -> Result<()> {
        self.with_tables(|t| {
            let mut row = read_row(t, sequence)?;
            row.available = false;
            t.revs.insert(sequence, row.encode())?;
            t.bodies.remove(sequence)?;
            Ok(())
        })
    }

    /// All revision rows of a document, ordered by sequence.
    pub fn query_all_revisions_for_doc(&mut self, doc: u64, bodies: bool) -> Result<Vec<Revision>> {
        self.with_tables(|t| {
            let doc_id = doc_name(t, doc)?
                .ok_or_else(|| Error::invariant(format!("unknown numeric document id {doc}")))?;
            let mut sequences = Vec::new();
            for item in t.revs_by_doc.range((doc, "")..(doc + 1, ""))? {
                let (_, sequence) = item?;
                sequences.push(sequence.value());
            }
            sequences.sort_unstable();
            let mut revisions = Vec::with_capacity(sequences.len());
            for sequence in sequences {
                let row = read_row(t, sequence)?;
                let body = if bodies && row.available {
                    t.bodies
                        .get(sequence)?
                        .map(|v| Bytes::copy_from_slice(v.value()))
                } else {
                    None
                };
                revisions.push(row.into_revision(doc_id.clone(), sequence, body));
            }
            Ok(revisions)
        })
    }

    /// The sequence of a revision, if the document has it.
    pub fn query_revision_exists(&mut self, doc: u64, rev_id: &RevId) -> Result<Option<Sequence>> {
        self.with_tables(|t| {
            Ok(t.revs_by_doc
                .get((doc, rev_id.as_str()))?
                .map(|v| v.value()))
        })
    }

    /// The sequence of a document's winner.
    pub fn current_sequence(&mut self, doc: u64) -> Result<Option<Sequence>> {
        self.with_tables(|t| Ok(t.current.get(doc)?.map(|v| v.value())))
    }

    /// The winning revision of a document.
    pub fn current_revision(&mut self, doc: u64, bodies: bool) -> Result<Option<Revision>> {
        self.with_tables(|t| {
            let Some(sequence) = t.current.get(doc)?.map(|v| v.value()) else {
                return Ok(None);
            };
            let doc_id = doc_name(t, doc)?
                .ok_or_else(|| Error::invariant(format!("unknown numeric document id {doc}")))?;
            let row = read_row(t, sequence)?;
            let body = if bodies && row.available {
                t.bodies
                    .get(sequence)?
                    .map(|v| Bytes::copy_from_slice(v.value()))
            } else {
                None
            };
            Ok(Some(row.into_revision(doc_id, sequence, body)))
        })
    }

    /// The highest allocated sequence, `0` for an empty store.
    pub fn last_sequence(&mut self) -> Result<Sequence> {
        self.with_tables(|t| Ok(t.revs.last()?.map(|(key, _)| key.value()).unwrap_or(0)))
    }

    /// Documents with revisions in the sequence window `(since, since + limit]`.
    ///
    /// Returns `(numeric id, highest sequence in the window)` pairs ordered by sequence.
    pub fn changes_since(&mut self, since: Sequence, limit: u64) -> Result<Vec<(u64, Sequence)>> {
        let start = since.saturating_add(1);
        let end = since.saturating_add(limit);
        if limit == 0 || start > end {
            return Ok(Vec::new());
        }
        self.with_tables(|t| {
            let mut latest = BTreeMap::new();
            for item in t.revs.range(start..=end)? {
                let (key, value) = item?;
                let (doc, ..) = value.value();
                latest.insert(doc, key.value());
            }
            let mut changes: Vec<_> = latest.into_iter().collect();
            changes.sort_by_key(|(_, sequence)| *sequence);
            Ok(changes)
        })
    }

    /// Record attachment metadata for a revision.
    pub fn insert_attachment(&mut self, sequence: Sequence, attachment: &Attachment) -> Result<()> {
        self.with_tables(|t| {
            t.attachments.insert(
                (sequence, attachment.name.as_str()),
                (
                    attachment.content_type.as_str(),
                    attachment.length,
                    attachment.revpos,
                    attachment.hash.as_bytes(),
                ),
            )?;
            Ok(())
        })
    }

    /// Attachment metadata of a revision, ordered by name.
    pub fn attachments(&mut self, sequence: Sequence) -> Result<Vec<Attachment>> {
        self.with_tables(|t| {
            let mut attachments = Vec::new();
            for item in t.attachments.range((sequence, "")..(sequence + 1, ""))? {
                let (key, value) = item?;
                let (_, name) = key.value();
                let (content_type, length, revpos, hash) = value.value();
                attachments.push(Attachment {
                    name: name.to_string(),
                    content_type: content_type.to_string(),
                    length,
                    revpos,
                    hash: AttachmentHash::from_bytes(*hash),
                });
            }
            Ok(attachments)
        })
    }

    /// The schema version stamped by the last migration, `0` for a fresh database.
    pub fn schema_version(&mut self) -> Result<u64> {
        self.with_tables(|t| Ok(t.meta.get(SCHEMA_VERSION_KEY)?.map(|v| v.value()).unwrap_or(0)))
    }

    fn set_schema_version(&mut self, version: u64) -> Result<()> {
        self.with_tables(|t| {
            t.meta.insert(SCHEMA_VERSION_KEY, version)?;
            Ok(())
        })
    }

    /// Migrate the schema to `target`, unless it is already there.
    ///
    /// The migration and the new version number are committed in one transaction, with
    /// reference checks disabled. Returns whether the migration ran.
    pub fn migrate_schema<F>(&mut self, migration: F, target: u64) -> Result<bool>
    where
        F: FnOnce(&mut Connection) -> anyhow::Result<MigrateOutcome>,
    {
        let name = std::any::type_name::<F>();
        let name = name.rsplit("::").next().unwrap_or(name);
        let from = self.schema_version()?;
        if from >= target {
            debug!("Skip migration {name}: schema is at version {from}");
            return Ok(false);
        }
        debug!("Start migration {name}");
        let enforce_references = std::mem::replace(&mut self.enforce_references, false);
        let res = self.transaction(|conn| {
            let outcome = migration(conn).map_err(|source| Error::Migration {
                from,
                to: target,
                source,
            })?;
            conn.set_schema_version(target)?;
            Ok(outcome)
        });
        self.enforce_references = enforce_references;
        match res? {
            MigrateOutcome::Execute(len) => {
                info!("Executed migration {name} ({len} rows affected)")
            }
            MigrateOutcome::Skip => debug!("Skip migration {name}: Not needed"),
        }
        Ok(true)
    }

    /// Load the revision tree of a document.
    pub fn load_tree(&mut self, doc: u64, bodies: bool) -> Result<DocumentRevisionTree> {
        DocumentRevisionTree::from_revisions(self.query_all_revisions_for_doc(doc, bodies)?)
    }

    /// Recompute the winner of `tree` and persist the changed `current` flags.
    ///
    /// Returns the winner's sequence.
    pub fn store_winner(&mut self, tree: &mut DocumentRevisionTree) -> Result<Sequence> {
        let winner = tree.compute_winner()?.sequence;
        for (sequence, current) in tree.set_current(winner) {
            self.update_current_flag(sequence, current)?;
        }
        Ok(winner)
    }
}

fn doc_name(t: &Tables<'_>, doc: u64) -> Result<Option<String>> {
    Ok(t.doc_names.get(doc)?.map(|v| v.value().to_string()))
}

fn read_row(t: &Tables<'_>, sequence: Sequence) -> Result<StoredRow> {
    t.revs
        .get(sequence)?
        .map(|v| StoredRow::decode(v.value()))
        .transpose()?
        .ok_or_else(|| Error::invariant(format!("sequence {sequence} not found")))
}

fn check_references(t: &Tables<'_>, row: &RevisionRow) -> Result<()> {
    if t.doc_names.get(row.doc)?.is_none() {
        return Err(Error::invariant(format!(
            "revision {} references unknown document {}",
            row.rev_id, row.doc
        )));
    }
    if let Some(parent) = row.parent {
        let parent = read_row(t, parent)?;
        if parent.doc != row.doc {
            return Err(Error::invariant(format!(
                "revision {} has a parent in another document",
                row.rev_id
            )));
        }
        if parent.rev_id.next_generation() != Some(row.rev_id.generation()) {
            return Err(Error::invariant(format!(
                "{} cannot be a child of {}",
                row.rev_id, parent.rev_id
            )));
        }
    }
    Ok(())
}
