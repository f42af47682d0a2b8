use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};

use tally_store::{CasOutcome, Insertion, LockOutcome, RecordRow, RecordStore};
use tally_types::{Identity, RecordKey};
use tracing::{debug, warn};

use crate::cache::IdentityCache;
use crate::error::{LedgerError, LedgerResult};
use crate::record::StateRecord;
use crate::transaction::{ClosedScope, StagedRow, TxScope};

/// State shared by a [`Ledger`](crate::Ledger) and every record handle it
/// gives out.
///
/// Each primitive checks for an open transaction on the calling thread and
/// either buffers into it or goes straight to the store.
pub(crate) struct LedgerCore {
    store: Arc<dyn RecordStore>,
    cache: IdentityCache,
    scopes: Mutex<HashMap<ThreadId, TxScope>>,
    /// Open transactions; reads skip the scope table while it is zero.
    open: AtomicUsize,
}

impl LedgerCore {
    pub(crate) fn new(store: Arc<dyn RecordStore>, caching: bool) -> Self {
        Self {
            store,
            cache: IdentityCache::new(caching),
            scopes: Mutex::new(HashMap::new()),
            open: AtomicUsize::new(0),
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub(crate) fn cache(&self) -> &IdentityCache {
        &self.cache
    }

    // A panic while a scope is borrowed unwinds through that thread's
    // OpenScope, which removes it; the other scopes are untouched.
    fn scopes(&self) -> MutexGuard<'_, HashMap<ThreadId, TxScope>> {
        self.scopes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn begin(&self, thread: ThreadId) -> LedgerResult<()> {
        let mut scopes = self.scopes();
        if scopes.contains_key(&thread) {
            return Err(LedgerError::NestedTransaction);
        }
        scopes.insert(thread, TxScope::default());
        self.open.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub(crate) fn end(&self, thread: ThreadId) -> Option<TxScope> {
        let scope = self.scopes().remove(&thread);
        if scope.is_some() {
            self.open.fetch_sub(1, Ordering::AcqRel);
        }
        scope
    }

    /// Run `work` on the calling thread's transaction; `None` without one.
    fn in_scope<T>(&self, work: impl FnOnce(&mut TxScope) -> T) -> Option<T> {
        if self.open.load(Ordering::Acquire) == 0 {
            return None;
        }
        self.scopes().get_mut(&thread::current().id()).map(work)
    }

    /// Run `work` against the calling thread's transaction, if one is open.
    /// Without one the scope table is released before `work` runs.
    fn with_scope<T>(
        &self,
        work: impl FnOnce(&dyn RecordStore, Option<&mut TxScope>) -> LedgerResult<T>,
    ) -> LedgerResult<T> {
        if self.open.load(Ordering::Acquire) == 0 {
            return work(self.store.as_ref(), None);
        }
        let thread = thread::current().id();
        let mut scopes = self.scopes();
        if !scopes.contains_key(&thread) {
            drop(scopes);
            return work(self.store.as_ref(), None);
        }
        work(self.store.as_ref(), scopes.get_mut(&thread))
    }

    /// Apply a closed transaction's buffered writes, then hand the written
    /// rows to the handles that made or read them. Returns the number of
    /// ops applied.
    pub(crate) fn commit(&self, scope: TxScope) -> LedgerResult<usize> {
        let ClosedScope {
            batch,
            staged,
            handles,
        } = scope.finish();
        if batch.is_empty() {
            return Ok(0);
        }
        self.store
            .apply(&batch, tally_types::now())
            .map_err(LedgerError::from_commit)?;
        for (key, row) in &staged {
            match row {
                StagedRow::Written(row) => self.cache.refresh(row),
                StagedRow::Removed(identity) => self.cache.evict(identity, *key),
            }
        }
        for handle in handles.iter().filter_map(Weak::upgrade) {
            if let Some(StagedRow::Written(row)) = staged.get(&handle.record_key()) {
                handle.absorb(row.clone());
                self.cache.adopt(&handle);
            }
        }
        Ok(batch.len())
    }

    /// Drop a closed transaction's buffered writes. No handle ever held
    /// them, so nothing needs resetting. Returns the number of ops dropped.
    pub(crate) fn discard(&self, scope: TxScope) -> usize {
        scope.finish().batch.len()
    }

    /// What a handle for `key` reads on this thread instead of its own row.
    pub(crate) fn staged_row(&self, key: RecordKey) -> Option<RecordRow> {
        self.in_scope(|scope| scope.view(key)).flatten()
    }

    /// Record `edit` in this thread's transaction. `false` when none is
    /// open and the caller edits its own row instead.
    pub(crate) fn edit_draft(&self, base: RecordRow, edit: &dyn Fn(&mut RecordRow)) -> bool {
        self.in_scope(|scope| scope.draft(base, edit)).is_some()
    }

    pub(crate) fn drop_draft(&self, key: RecordKey) {
        self.in_scope(|scope| scope.drop_draft(key));
    }

    /// The committed row for `key`, ignoring any open transaction.
    pub(crate) fn stored_row(&self, key: RecordKey) -> LedgerResult<Option<RecordRow>> {
        Ok(self.store.get_by_key(key, tally_types::now())?)
    }

    pub(crate) fn load(&self, identity: &Identity) -> LedgerResult<Option<RecordRow>> {
        let now = tally_types::now();
        self.with_scope(|store, scope| {
            Ok(match scope {
                Some(scope) => scope.resolve(store, identity, now)?,
                None => store.get(identity, now)?,
            })
        })
    }

    pub(crate) fn load_by_key(&self, key: RecordKey) -> LedgerResult<Option<RecordRow>> {
        let now = tally_types::now();
        self.with_scope(|store, scope| {
            Ok(match scope {
                Some(scope) => scope.resolve_key(store, key, now)?,
                None => store.get_by_key(key, now)?,
            })
        })
    }

    pub(crate) fn find_or_create(&self, identity: &Identity) -> LedgerResult<RecordRow> {
        let now = tally_types::now();
        self.with_scope(|store, scope| match scope {
            None => Ok(store.find_or_insert(identity, now)?),
            Some(scope) => {
                if let Some(row) = scope.resolve(store, identity, now)? {
                    return Ok(row);
                }
                let row = RecordRow::pending(*identity, store.allocate_key()?, now);
                scope.stage_insert(row.clone());
                Ok(row)
            }
        })
    }

    /// A new PENDING row for `identity`; `IdentityExists` if one is live.
    pub(crate) fn create(&self, identity: &Identity) -> LedgerResult<RecordRow> {
        let now = tally_types::now();
        self.with_scope(|store, scope| {
            let row = match scope {
                None => {
                    let row = RecordRow::pending(*identity, store.allocate_key()?, now);
                    match store.insert_if_absent(&row, now)? {
                        Insertion::Inserted(row) => row,
                        Insertion::Existing(_) => {
                            return Err(LedgerError::IdentityExists(*identity))
                        }
                    }
                }
                Some(scope) => {
                    if scope.resolve(store, identity, now)?.is_some() {
                        return Err(LedgerError::IdentityExists(*identity));
                    }
                    let row = RecordRow::pending(*identity, store.allocate_key()?, now);
                    scope.stage_insert(row.clone());
                    row
                }
            };
            Ok(row)
        })
    }

    /// Write `row` over the stored row at `row.revision`. Returns the row as
    /// stored, or `None` when the write is buffered in this thread's
    /// transaction; `handle` then takes the row on commit.
    pub(crate) fn write_row(
        &self,
        row: &RecordRow,
        handle: &Weak<StateRecord>,
    ) -> LedgerResult<Option<RecordRow>> {
        let now = tally_types::now();
        self.with_scope(|store, scope| match scope {
            Some(scope) => {
                scope
                    .stage_update(row)
                    .ok_or(LedgerError::NotFound(row.identity))?;
                scope.enlist(row.key, handle.clone());
                Ok(None)
            }
            None => match store.compare_and_set(row.revision, row, now)? {
                CasOutcome::Applied(saved) => Ok(Some(saved)),
                CasOutcome::Stale(current) => {
                    debug!(
                        record = %row.key,
                        expected = row.revision,
                        actual = current.revision,
                        "lost write race"
                    );
                    Err(LedgerError::Conflict {
                        key: row.key,
                        expected: row.revision,
                        actual: current.revision,
                    })
                }
                CasOutcome::Missing => Err(LedgerError::NotFound(row.identity)),
            },
        })
    }

    pub(crate) fn remove_row(&self, row: &RecordRow) -> LedgerResult<()> {
        let direct = self.with_scope(|store, scope| match scope {
            Some(scope) => {
                scope.stage_delete(row);
                Ok(false)
            }
            None => {
                store.delete(row.key)?;
                Ok(true)
            }
        })?;
        if direct {
            self.cache.evict(&row.identity, row.key);
            debug!(record = %row.key, identity = %row.identity, "record destroyed");
        }
        Ok(())
    }

    fn lock_row(&self, claimant: RecordKey, target: &Identity) -> LedgerResult<LockOutcome> {
        let now = tally_types::now();
        self.with_scope(|store, scope| {
            let Some(scope) = scope else {
                return Ok(store.lock_to_revoke(claimant, target, now)?);
            };
            if scope.resolve_key(store, claimant, now)?.is_none() {
                return Ok(LockOutcome::UnknownClaimant);
            }
            let row = match scope.resolve(store, target, now)? {
                Some(row) => row,
                None => {
                    let row = RecordRow::pending(*target, store.allocate_key()?, now);
                    scope.stage_insert(row.clone());
                    row
                }
            };
            Ok(match LockOutcome::decide(row, claimant) {
                LockOutcome::Locked(locked) => match scope.stage_update(&locked) {
                    Some(staged) => LockOutcome::Locked(staged),
                    None => LockOutcome::NotLockable(locked),
                },
                other => other,
            })
        })
    }

    fn reserve_row(
        &self,
        owner: RecordKey,
        identity: &Identity,
    ) -> LedgerResult<Option<RecordRow>> {
        let now = tally_types::now();
        self.with_scope(|store, scope| {
            let Some(scope) = scope else {
                return Ok(store.create_output_lock(owner, identity, now)?);
            };
            if scope.resolve_key(store, owner, now)?.is_none() {
                return Ok(None);
            }
            if let Some(existing) = scope.resolve(store, identity, now)? {
                let ours = existing.is_reserved_by(owner);
                return Ok(ours.then_some(existing));
            }
            let row = RecordRow::reserved(*identity, store.allocate_key()?, owner, now);
            scope.stage_insert(row.clone());
            Ok(Some(row))
        })
    }

    /// Records locked by `holder`, including this thread's buffered locks.
    pub(crate) fn locked_rows(&self, holder: RecordKey) -> LedgerResult<Vec<RecordRow>> {
        let now = tally_types::now();
        self.with_scope(|store, scope| {
            Ok(match scope {
                Some(scope) => scope.locked_by(store, holder, now)?,
                None => store.locked_by(holder, now)?,
            })
        })
    }

    /// The handle for `row`: the cached instance when caching is on.
    ///
    /// Shared instances only ever hold committed rows. When this thread's
    /// transaction has touched `row`, the handle is built from the stored
    /// row and reads the buffered one through the scope until commit.
    pub(crate) fn materialize(
        self: &Arc<Self>,
        row: RecordRow,
    ) -> LedgerResult<Arc<StateRecord>> {
        let key = row.key;
        if !self.in_scope(|scope| scope.is_staged(key)).unwrap_or(false) {
            return Ok(self.intern(row));
        }
        let record = match self.stored_row(key)? {
            Some(stored) if stored.identity == row.identity => self.intern(stored),
            // Inserted by this transaction: private until commit.
            _ => match self.in_scope(|scope| scope.enlisted(key)).flatten() {
                Some(record) => return Ok(record),
                None => StateRecord::new(Arc::clone(self), row),
            },
        };
        self.in_scope(|scope| scope.enlist(key, Arc::downgrade(&record)));
        Ok(record)
    }

    fn intern(self: &Arc<Self>, row: RecordRow) -> Arc<StateRecord> {
        self.cache
            .intern(row, |row| StateRecord::new(Arc::clone(self), row))
    }

    pub(crate) fn record(
        self: &Arc<Self>,
        identity: &Identity,
    ) -> LedgerResult<Option<Arc<StateRecord>>> {
        match self.load(identity)? {
            Some(row) => Ok(Some(self.materialize(row)?)),
            None => {
                // A buffered delete must not unshare the committed instance.
                if self.in_scope(|_| ()).is_none() {
                    self.cache.forget(identity);
                }
                Ok(None)
            }
        }
    }

    pub(crate) fn record_by_key(
        self: &Arc<Self>,
        key: RecordKey,
    ) -> LedgerResult<Option<Arc<StateRecord>>> {
        self.load_by_key(key)?
            .map(|row| self.materialize(row))
            .transpose()
    }

    pub(crate) fn lock_record(
        self: &Arc<Self>,
        claimant: RecordKey,
        target: &Identity,
    ) -> LedgerResult<Arc<StateRecord>> {
        match self.lock_row(claimant, target)? {
            LockOutcome::Locked(row) => {
                debug!(target = %target, claimant = %claimant, "revocation lock taken");
                self.materialize(row)
            }
            LockOutcome::AlreadyHeld(row) => self.materialize(row),
            LockOutcome::Conflict(row) => {
                warn!(
                    target = %target,
                    claimant = %claimant,
                    holder = ?row.locked_by,
                    "revocation lock already held"
                );
                Err(LedgerError::LockConflict {
                    target: *target,
                    holder: row.locked_by,
                })
            }
            LockOutcome::NotLockable(row) => Err(LedgerError::NotLockable {
                target: *target,
                state: row.state,
            }),
            LockOutcome::UnknownClaimant => Err(LedgerError::KeyNotFound(claimant)),
        }
    }

    pub(crate) fn reserve_record(
        self: &Arc<Self>,
        owner: RecordKey,
        identity: &Identity,
    ) -> LedgerResult<Option<Arc<StateRecord>>> {
        let reserved = self.reserve_row(owner, identity)?;
        if reserved.is_none() {
            debug!(identity = %identity, owner = %owner, "identity reservation refused");
        }
        reserved.map(|row| self.materialize(row)).transpose()
    }
}
