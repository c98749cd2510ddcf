//! Offline-first document store built on per-document revision trees.
//!
//! Every document is versioned as a forest of immutable revisions. Local edits append to a
//! leaf, while revisions arriving from a replication peer are merged together with their
//! ancestor chain via [`Datastore::force_insert_with_history`]. All storage access is funnelled
//! through a single worker thread (see [`queue`]), so merges and local edits never observe
//! each other half-applied.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]
#![cfg_attr(revstore_docsrs, feature(doc_auto_cfg))]

pub mod attachments;
pub mod config;
mod datastore;
pub mod edit;
mod error;
pub mod merge;
pub mod queue;
pub mod revision;
pub mod revs_diff;
pub mod store;
pub mod tree;

pub use attachments::{Attachment, AttachmentHash, AttachmentInput, AttachmentStore};
pub use config::StoreConfig;
pub use datastore::{Changes, Datastore};
pub use edit::Resolution;
pub use error::{Error, Result};
pub use merge::{ForceInsertItem, MergeCase, MergeOutcome};
pub use queue::QueueHandle;
pub use revision::{NewRevision, RevId, Revision, Revisions, Sequence};
pub use revs_diff::RevsDiffEntry;
pub use store::Connection;
pub use tree::DocumentRevisionTree;
