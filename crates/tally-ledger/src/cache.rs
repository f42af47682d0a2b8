use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tally_store::RecordRow;
use tally_types::{Identity, RecordKey};

use crate::record::StateRecord;

/// Dead entries are swept whenever the map grows to a power of two at or
/// past this size.
const SWEEP_FLOOR: usize = 1024;

/// Identity map owned by one ledger.
///
/// Holds weak references: an instance stays shared for as long as some
/// caller keeps it alive. Every hit is reconciled against a freshly loaded
/// row, so a cached instance never outlives its row. Only committed rows
/// reach a shared instance, and never an older revision than it holds.
pub(crate) struct IdentityCache {
    enabled: AtomicBool,
    entries: Mutex<HashMap<Identity, Weak<StateRecord>>>,
}

impl IdentityCache {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            entries: Mutex::new(HashMap::new()),
        }
    }

    // Entries are plain weak pointers; a panic mid-update cannot leave them
    // inconsistent.
    fn entries(&self) -> MutexGuard<'_, HashMap<Identity, Weak<StateRecord>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Turning caching off forgets every entry. Instances already handed out
    /// keep working; they are simply no longer shared.
    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        if !enabled {
            self.entries().clear();
        }
    }

    /// The shared instance for `row`, updated to it, or a new one built by
    /// `make`.
    pub(crate) fn intern(
        &self,
        row: RecordRow,
        make: impl FnOnce(RecordRow) -> Arc<StateRecord>,
    ) -> Arc<StateRecord> {
        if !self.is_enabled() {
            return make(row);
        }
        let mut entries = self.entries();
        if let Some(cached) = entries.get(&row.identity).and_then(Weak::upgrade) {
            if cached.record_key() == row.key {
                cached.absorb(row);
                return cached;
            }
        }

        let identity = row.identity;
        let record = make(row);
        entries.insert(identity, Arc::downgrade(&record));
        if entries.len() >= SWEEP_FLOOR && entries.len().is_power_of_two() {
            entries.retain(|_, weak| weak.strong_count() > 0);
        }
        record
    }

    /// Bring a cached instance of `row` up to date, if there is one.
    pub(crate) fn refresh(&self, row: &RecordRow) {
        if let Some(cached) = self.entries().get(&row.identity).and_then(Weak::upgrade) {
            if cached.record_key() == row.key {
                cached.absorb(row.clone());
            }
        }
    }

    /// Share `record` from now on, unless its identity already has a live
    /// instance for the same row.
    pub(crate) fn adopt(&self, record: &Arc<StateRecord>) {
        if !self.is_enabled() {
            return;
        }
        let mut entries = self.entries();
        let taken = entries
            .get(&record.id())
            .and_then(Weak::upgrade)
            .is_some_and(|cached| cached.record_key() == record.record_key());
        if !taken {
            entries.insert(record.id(), Arc::downgrade(record));
        }
    }

    /// Drop the entry for `identity` if it belongs to the row `key`.
    pub(crate) fn evict(&self, identity: &Identity, key: RecordKey) {
        let mut entries = self.entries();
        let stale = match entries.get(identity).and_then(Weak::upgrade) {
            Some(cached) => cached.record_key() == key,
            None => true,
        };
        if stale {
            entries.remove(identity);
        }
    }

    pub(crate) fn forget(&self, identity: &Identity) {
        self.entries().remove(identity);
    }

    /// Number of entries whose instance is still alive.
    pub(crate) fn live_entries(&self) -> usize {
        self.entries()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl std::fmt::Debug for IdentityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityCache")
            .field("enabled", &self.is_enabled())
            .field("live_entries", &self.live_entries())
            .finish()
    }
}
