use std::fmt;
use std::sync::Arc;

use tally_store::{DurableRecordStore, MemoryRecordStore, RecordStore};
use tally_types::{Identity, RecordKey};
use tracing::{debug, info};

use crate::config::{BackendConfig, LedgerConfig};
use crate::error::{LedgerError, LedgerResult};
use crate::inner::LedgerCore;
use crate::record::StateRecord;
use crate::transaction::{OpenScope, TxOutcome};

/// Facade over a [`RecordStore`]: finds, creates, locks and reserves
/// records, and groups their mutations into transactions.
///
/// Cloning is cheap; clones share the store, the identity cache and the
/// open transactions.
#[derive(Clone)]
pub struct Ledger {
    core: Arc<LedgerCore>,
}

impl Ledger {
    pub fn with_store(store: Arc<dyn RecordStore>, caching: bool) -> Self {
        Self {
            core: Arc::new(LedgerCore::new(store, caching)),
        }
    }

    /// An uncached ledger over a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::with_store(Arc::new(MemoryRecordStore::new()), false)
    }

    /// Build the backend `config` names and a ledger over it.
    pub fn open(config: &LedgerConfig) -> LedgerResult<Self> {
        let store: Arc<dyn RecordStore> = match &config.backend {
            BackendConfig::Memory => Arc::new(MemoryRecordStore::new()),
            BackendConfig::Durable { path, sync } => {
                Arc::new(DurableRecordStore::open(path, *sync)?)
            }
        };
        info!(
            backend = config.backend.kind(),
            caching = config.caching,
            "ledger opened"
        );
        Ok(Self::with_store(store, config.caching))
    }

    /// The underlying store, for callers that need the raw primitives.
    pub fn store(&self) -> Arc<dyn RecordStore> {
        Arc::clone(self.core.store())
    }

    /// The live record for `id`, created PENDING if there is none.
    ///
    /// Concurrent callers for the same identity get the same record.
    pub fn find_or_create(&self, id: &Identity) -> LedgerResult<Arc<StateRecord>> {
        let row = self.core.find_or_create(id)?;
        self.core.materialize(row)
    }

    /// Create a PENDING record for `id`.
    ///
    /// Fails with [`LedgerError::IdentityExists`] if `id` already has a live
    /// record; of concurrent creators exactly one succeeds.
    pub fn create(&self, id: &Identity) -> LedgerResult<Arc<StateRecord>> {
        let row = self.core.create(id)?;
        self.core.materialize(row)
    }

    /// The live record for `id`, if any.
    pub fn get_record(&self, id: &Identity) -> LedgerResult<Option<Arc<StateRecord>>> {
        self.core.record(id)
    }

    /// Like [`get_record`](Self::get_record), failing with
    /// [`LedgerError::NotFound`] when there is no live record.
    pub fn record(&self, id: &Identity) -> LedgerResult<Arc<StateRecord>> {
        self.get_record(id)?.ok_or(LedgerError::NotFound(*id))
    }

    pub fn get_by_key(&self, key: RecordKey) -> LedgerResult<Option<Arc<StateRecord>>> {
        self.core.record_by_key(key)
    }

    /// Lock `target` for revocation by the record `claimant`, creating the
    /// target PENDING first if it does not exist.
    ///
    /// Repeating the call for the same pair returns the same locked record.
    /// A target locked by anyone else fails fast with
    /// [`LedgerError::LockConflict`]; DECLINED, REVOKED and DISCARDED targets
    /// fail with [`LedgerError::NotLockable`].
    pub fn lock_to_revoke(
        &self,
        claimant: RecordKey,
        target: &Identity,
    ) -> LedgerResult<Arc<StateRecord>> {
        self.core.lock_record(claimant, target)
    }

    /// Reserve `id` as LOCKED_FOR_CREATION for the record `owner`.
    ///
    /// `None` if `id` already has a live record, whatever its state, unless
    /// it is `owner`'s own reservation, which is returned again.
    pub fn create_output_lock_record(
        &self,
        owner: RecordKey,
        id: &Identity,
    ) -> LedgerResult<Option<Arc<StateRecord>>> {
        self.core.reserve_record(owner, id)
    }

    /// Run `work` with every ledger mutation on this thread buffered.
    ///
    /// [`TxOutcome::Commit`] applies the buffer atomically and yields the
    /// value; [`TxOutcome::Rollback`] drops it and yields `None`. An `Err`
    /// from `work` drops the buffer and is returned as is. Reads on this
    /// thread see the buffered writes; no other reader does until commit.
    ///
    /// Transactions do not nest: opening one while another is open on the
    /// same thread fails with [`LedgerError::NestedTransaction`].
    pub fn transaction<T, F>(&self, work: F) -> LedgerResult<Option<T>>
    where
        F: FnOnce() -> LedgerResult<TxOutcome<T>>,
    {
        let scope = OpenScope::open(&self.core)?;
        let outcome = work();
        let buffered = scope.close();

        match outcome {
            Ok(TxOutcome::Commit(value)) => {
                let ops = self.core.commit(buffered)?;
                debug!(ops, "transaction committed");
                Ok(Some(value))
            }
            Ok(TxOutcome::Rollback) => {
                let ops = self.core.discard(buffered);
                debug!(ops, "transaction rolled back");
                Ok(None)
            }
            Err(err) => {
                let ops = self.core.discard(buffered);
                debug!(ops, error = %err, "transaction abandoned");
                Err(err)
            }
        }
    }

    /// Turn the identity map on or off. Handles already given out keep
    /// working either way.
    pub fn enable_caching(&self, enabled: bool) {
        self.core.cache().set_enabled(enabled);
    }

    pub fn is_caching(&self) -> bool {
        self.core.cache().is_enabled()
    }

    /// Number of cached identities whose instance is still in use.
    pub fn cached_records(&self) -> usize {
        self.core.cache().live_entries()
    }

    /// Records currently locked (for revocation or creation) by `holder`.
    /// Inside a transaction this includes the locks it has taken and leaves
    /// out the ones it has released.
    pub fn locks_held_by(&self, holder: RecordKey) -> LedgerResult<Vec<Arc<StateRecord>>> {
        self.core
            .locked_rows(holder)?
            .into_iter()
            .map(|row| self.core.materialize(row))
            .collect()
    }

    /// [`unlock`](StateRecord::unlock) everything `holder` has locked.
    /// Returns how many records were released.
    pub fn release_locks(&self, holder: RecordKey) -> LedgerResult<usize> {
        let held = self.locks_held_by(holder)?;
        for record in &held {
            record.unlock()?;
        }
        if !held.is_empty() {
            debug!(holder = %holder, released = held.len(), "locks released");
        }
        Ok(held.len())
    }

    /// Physically remove expired records. They already read as absent.
    pub fn sweep_expired(&self) -> LedgerResult<usize> {
        let removed = self.core.store().purge_expired(tally_types::now())?;
        info!(removed, "expired records swept");
        Ok(removed)
    }

    /// Drop expired records and compact persistent storage.
    /// Returns the number of live records kept.
    pub fn compact(&self) -> LedgerResult<usize> {
        Ok(self.core.store().compact(tally_types::now())?)
    }

    /// Number of live records.
    pub fn record_count(&self) -> LedgerResult<usize> {
        Ok(self.core.store().len(tally_types::now())?)
    }
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger")
            .field("cache", self.core.cache())
            .finish_non_exhaustive()
    }
}
