use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tally_types::{Identity, RecordKey, Timestamp};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::journal::{JournalEntry, WriteAheadLog};
use crate::row::{RecordRow, WriteBatch};
use crate::tables::{Mutation, Staged, Tables};
use crate::traits::{CasOutcome, Insertion, LockOutcome, RecordStore};

/// Where a [`TableStore`] persists committed mutations before they become
/// visible.
pub trait Journal: Send + Sync {
    fn record(&self, mutations: &[Mutation]) -> StoreResult<()>;

    /// Replace everything journaled so far with `snapshot`.
    fn record_snapshot(&self, snapshot: &JournalEntry) -> StoreResult<()>;
}

/// No persistence: mutations live only in memory.
#[derive(Clone, Copy, Debug, Default)]
pub struct Volatile;

impl Journal for Volatile {
    fn record(&self, _mutations: &[Mutation]) -> StoreResult<()> {
        Ok(())
    }

    fn record_snapshot(&self, _snapshot: &JournalEntry) -> StoreResult<()> {
        Ok(())
    }
}

impl Journal for WriteAheadLog {
    fn record(&self, mutations: &[Mutation]) -> StoreResult<()> {
        self.append(&JournalEntry::Mutations(mutations.to_vec()))?;
        Ok(())
    }

    fn record_snapshot(&self, snapshot: &JournalEntry) -> StoreResult<()> {
        self.rewrite(std::slice::from_ref(snapshot))
    }
}

/// Record store over in-memory tables, serialized by a single `RwLock`.
///
/// Every write plans its effect on a staged view, hands the resulting
/// mutations to the journal, and commits them only if journaling succeeded.
/// Writers hold the write lock for the whole sequence, which makes each
/// operation (and each batch) atomic and totally ordered.
pub struct TableStore<J> {
    tables: RwLock<Tables>,
    journal: J,
}

impl<J: Journal> TableStore<J> {
    pub(crate) fn with_tables(tables: Tables, journal: J) -> Self {
        Self {
            tables: RwLock::new(tables),
            journal,
        }
    }

    pub(crate) fn journal(&self) -> &J {
        &self.journal
    }

    pub(crate) fn read(&self) -> StoreResult<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|e| StoreError::Poisoned(format!("record tables: {e}")))
    }

    pub(crate) fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|e| StoreError::Poisoned(format!("record tables: {e}")))
    }

    /// Run `plan` against a staged view and make its mutations durable and
    /// visible, or do nothing if it fails.
    fn mutate<T>(&self, plan: impl FnOnce(&mut Staged<'_>) -> StoreResult<T>) -> StoreResult<T> {
        let mut tables = self.write()?;
        let (value, mutations) = {
            let mut staged = tables.stage();
            let value = plan(&mut staged)?;
            (value, staged.into_mutations())
        };
        if !mutations.is_empty() {
            self.journal.record(&mutations)?;
            tables.commit(&mutations);
        }
        Ok(value)
    }
}

impl<J: Journal> RecordStore for TableStore<J> {
    fn allocate_key(&self) -> StoreResult<RecordKey> {
        self.mutate(|staged| Ok(staged.allocate()))
    }

    fn get(&self, identity: &Identity, now: Timestamp) -> StoreResult<Option<RecordRow>> {
        Ok(self.read()?.live(identity, now).cloned())
    }

    fn get_by_key(&self, key: RecordKey, now: Timestamp) -> StoreResult<Option<RecordRow>> {
        Ok(self.read()?.live_by_key(key, now).cloned())
    }

    fn insert_if_absent(&self, row: &RecordRow, now: Timestamp) -> StoreResult<Insertion> {
        let outcome = self.mutate(|staged| staged.insert_if_absent(row, now))?;
        if let Insertion::Existing(existing) = &outcome {
            debug!(identity = %row.identity, existing = %existing.key, "insert found live row");
        }
        Ok(outcome)
    }

    fn compare_and_set(
        &self,
        expected_revision: u64,
        row: &RecordRow,
        now: Timestamp,
    ) -> StoreResult<CasOutcome> {
        self.mutate(|staged| staged.compare_and_set(expected_revision, row, now))
    }

    fn delete(&self, key: RecordKey) -> StoreResult<bool> {
        self.mutate(|staged| Ok(staged.delete(key)))
    }

    fn lock_to_revoke(
        &self,
        claimant: RecordKey,
        target: &Identity,
        now: Timestamp,
    ) -> StoreResult<LockOutcome> {
        self.mutate(|staged| staged.lock_to_revoke(claimant, target, now))
    }

    fn create_output_lock(
        &self,
        owner: RecordKey,
        identity: &Identity,
        now: Timestamp,
    ) -> StoreResult<Option<RecordRow>> {
        self.mutate(|staged| staged.create_output_lock(owner, identity, now))
    }

    fn locked_by(&self, holder: RecordKey, now: Timestamp) -> StoreResult<Vec<RecordRow>> {
        Ok(self
            .read()?
            .live_rows(now)
            .filter(|row| row.is_locked_by(holder))
            .cloned()
            .collect())
    }

    fn apply(&self, batch: &WriteBatch, now: Timestamp) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.mutate(|staged| staged.apply(batch, now))?;
        debug!(ops = batch.len(), "batch applied");
        Ok(())
    }

    fn purge_expired(&self, now: Timestamp) -> StoreResult<usize> {
        self.mutate(|staged| Ok(staged.purge_expired(now)))
    }

    fn len(&self, now: Timestamp) -> StoreResult<usize> {
        Ok(self.read()?.live_rows(now).count())
    }

    fn compact(&self, now: Timestamp) -> StoreResult<usize> {
        let mut tables = self.write()?;
        let rows: Vec<RecordRow> = tables.live_rows(now).cloned().collect();
        let next_key = tables.next_key();
        let count = rows.len();

        let snapshot = JournalEntry::Snapshot { next_key, rows };
        self.journal.record_snapshot(&snapshot)?;
        if let JournalEntry::Snapshot { rows, .. } = snapshot {
            *tables = Tables::from_rows(rows, next_key);
        }

        info!(rows = count, next_key, "record tables compacted");
        Ok(count)
    }
}
