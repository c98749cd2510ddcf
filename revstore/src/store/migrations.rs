use anyhow::Result;
use redb::{ReadableTable, ReadableTableMetadata};

use super::Connection;

/// Schema version after all built-in migrations ran.
pub(super) const LATEST_VERSION: u64 = 1;

/// Run all built-in migrations, if needed.
pub(super) fn run_migrations(conn: &mut Connection) -> crate::Result<()> {
    conn.migrate_schema(migration_001_populate_current_index, 1)?;
    Ok(())
}

/// Outcome of a schema migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateOutcome {
    /// Nothing had to be changed.
    Skip,
    /// The migration changed this many rows.
    Execute(usize),
}

/// migration 001: populate the current index from the `current` flags of the revs table
fn migration_001_populate_current_index(conn: &mut Connection) -> Result<MigrateOutcome> {
    let outcome = conn.with_tables(|t| {
        if !t.current.is_empty()? || t.revs.is_empty()? {
            return Ok(MigrateOutcome::Skip);
        }
        let mut winners = Vec::new();
        for item in t.revs.iter()? {
            let (key, value) = item?;
            let (doc, _rev, _parent, _deleted, current, _available) = value.value();
            if current {
                winners.push((doc, key.value()));
            }
        }
        let len = winners.len();
        for (doc, sequence) in winners {
            t.current.insert(doc, sequence)?;
        }
        Ok(MigrateOutcome::Execute(len))
    })?;
    Ok(outcome)
}
