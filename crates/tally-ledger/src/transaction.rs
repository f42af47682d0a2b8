use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use tally_store::{RecordRow, RecordStore, StoreResult, WriteBatch};
use tally_types::{Identity, RecordKey, Timestamp};

use crate::error::LedgerResult;
use crate::inner::LedgerCore;
use crate::record::StateRecord;

/// What a unit of work asks [`Ledger::transaction`](crate::Ledger::transaction)
/// to do with its buffered mutations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxOutcome<T> {
    /// Apply everything atomically and yield the value.
    Commit(T),
    /// Discard everything; the transaction yields `None`.
    Rollback,
}

/// A row as the open transaction left it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum StagedRow {
    Written(RecordRow),
    Removed(Identity),
}

impl StagedRow {
    fn live(&self, now: Timestamp) -> Option<RecordRow> {
        match self {
            Self::Written(row) if row.is_live(now) => Some(row.clone()),
            _ => None,
        }
    }
}

/// Mutations buffered by one thread's open transaction, with the rows they
/// produce so reads on that thread see their own writes.
///
/// Record handles never hold a buffered row. They read it from here while
/// the transaction is open, and the handles listed in `enlisted` take it
/// in only once the batch is applied.
#[derive(Debug, Default)]
pub(crate) struct TxScope {
    batch: WriteBatch,
    staged: BTreeMap<RecordKey, StagedRow>,
    inserted: HashMap<Identity, RecordKey>,
    /// Unsaved `set_state`/`set_expires_at` edits made on this thread.
    drafts: HashMap<RecordKey, RecordRow>,
    enlisted: BTreeMap<RecordKey, Vec<Weak<StateRecord>>>,
}

/// What is left of a transaction once it is closed.
pub(crate) struct ClosedScope {
    pub(crate) batch: WriteBatch,
    /// Final staged view of every touched key.
    pub(crate) staged: BTreeMap<RecordKey, StagedRow>,
    /// Handles waiting for their staged rows.
    pub(crate) handles: Vec<Weak<StateRecord>>,
}

impl TxScope {
    /// Live row for `identity` as this transaction sees it.
    pub(crate) fn resolve(
        &self,
        store: &dyn RecordStore,
        identity: &Identity,
        now: Timestamp,
    ) -> StoreResult<Option<RecordRow>> {
        if let Some(staged) = self
            .inserted
            .get(identity)
            .and_then(|key| self.staged.get(key))
        {
            return Ok(staged.live(now));
        }
        Ok(match store.get(identity, now)? {
            Some(row) => match self.staged.get(&row.key) {
                Some(staged) => staged.live(now),
                None => Some(row),
            },
            None => None,
        })
    }

    /// Live row with `key` as this transaction sees it.
    pub(crate) fn resolve_key(
        &self,
        store: &dyn RecordStore,
        key: RecordKey,
        now: Timestamp,
    ) -> StoreResult<Option<RecordRow>> {
        match self.staged.get(&key) {
            Some(staged) => Ok(staged.live(now)),
            None => store.get_by_key(key, now),
        }
    }

    /// Rows locked by `holder` as this transaction sees them, in key order.
    pub(crate) fn locked_by(
        &self,
        store: &dyn RecordStore,
        holder: RecordKey,
        now: Timestamp,
    ) -> StoreResult<Vec<RecordRow>> {
        let mut rows: BTreeMap<RecordKey, RecordRow> = store
            .locked_by(holder, now)?
            .into_iter()
            .filter(|row| !self.staged.contains_key(&row.key))
            .map(|row| (row.key, row))
            .collect();
        for (key, staged) in &self.staged {
            if let Some(row) = staged.live(now).filter(|row| row.is_locked_by(holder)) {
                rows.insert(*key, row);
            }
        }
        Ok(rows.into_values().collect())
    }

    /// The row a handle for `key` reads on this thread: its unsaved edits,
    /// else the row staged for it. `None` means the committed row.
    pub(crate) fn view(&self, key: RecordKey) -> Option<RecordRow> {
        if let Some(draft) = self.drafts.get(&key) {
            return Some(draft.clone());
        }
        match self.staged.get(&key) {
            Some(StagedRow::Written(row)) => Some(row.clone()),
            _ => None,
        }
    }

    pub(crate) fn is_staged(&self, key: RecordKey) -> bool {
        self.staged.contains_key(&key)
    }

    /// Apply `edit` to what a handle for `base.key` reads, starting from
    /// `base` when this transaction holds nothing for that key yet.
    pub(crate) fn draft(&mut self, base: RecordRow, edit: &dyn Fn(&mut RecordRow)) {
        let key = base.key;
        let mut row = self.view(key).unwrap_or(base);
        edit(&mut row);
        self.drafts.insert(key, row);
    }

    pub(crate) fn drop_draft(&mut self, key: RecordKey) {
        self.drafts.remove(&key);
    }

    /// Have `handle` take the staged row for `key` once this transaction
    /// commits.
    pub(crate) fn enlist(&mut self, key: RecordKey, handle: Weak<StateRecord>) {
        let handles = self.enlisted.entry(key).or_default();
        if !handles.iter().any(|h| h.ptr_eq(&handle)) {
            handles.push(handle);
        }
    }

    /// A live handle already enlisted for `key`.
    pub(crate) fn enlisted(&self, key: RecordKey) -> Option<Arc<StateRecord>> {
        self.enlisted.get(&key)?.iter().find_map(Weak::upgrade)
    }

    pub(crate) fn stage_insert(&mut self, row: RecordRow) {
        self.drafts.remove(&row.key);
        self.inserted.insert(row.identity, row.key);
        self.staged.insert(row.key, StagedRow::Written(row.clone()));
        self.batch.insert(row);
    }

    /// Buffer a compare-and-set of `row` at its current revision. Returns the
    /// row as it will read after commit, or `None` if this transaction
    /// already removed it.
    pub(crate) fn stage_update(&mut self, row: &RecordRow) -> Option<RecordRow> {
        let created_at = match self.staged.get(&row.key) {
            Some(StagedRow::Removed(_)) => return None,
            Some(StagedRow::Written(prior)) => prior.created_at,
            None => row.created_at,
        };
        let next = RecordRow {
            created_at,
            revision: row.revision + 1,
            ..row.clone()
        };
        self.drafts.remove(&row.key);
        self.batch.update(row.revision, row.clone());
        self.staged.insert(row.key, StagedRow::Written(next.clone()));
        Some(next)
    }

    pub(crate) fn stage_delete(&mut self, row: &RecordRow) {
        self.drafts.remove(&row.key);
        self.batch.delete(row.key);
        self.staged.insert(row.key, StagedRow::Removed(row.identity));
    }

    pub(crate) fn finish(self) -> ClosedScope {
        ClosedScope {
            batch: self.batch,
            staged: self.staged,
            handles: self.enlisted.into_values().flatten().collect(),
        }
    }
}

/// The calling thread's open transaction. Dropping it without
/// [`close`](Self::close) discards the buffered work, so a panicking unit
/// of work cannot leave a scope behind.
pub(crate) struct OpenScope<'a> {
    core: &'a LedgerCore,
    thread: ThreadId,
    closed: bool,
}

impl<'a> OpenScope<'a> {
    pub(crate) fn open(core: &'a LedgerCore) -> LedgerResult<Self> {
        let thread = thread::current().id();
        core.begin(thread)?;
        Ok(Self {
            core,
            thread,
            closed: false,
        })
    }

    pub(crate) fn close(mut self) -> TxScope {
        self.closed = true;
        self.core.end(self.thread).unwrap_or_default()
    }
}

impl Drop for OpenScope<'_> {
    fn drop(&mut self) {
        if !self.closed {
            self.core.end(self.thread);
        }
    }
}
