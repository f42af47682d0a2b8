use crate::engine::{TableStore, Volatile};
use crate::tables::Tables;

/// In-memory record store for tests and embedding. Data is lost on drop.
pub type MemoryRecordStore = TableStore<Volatile>;

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::with_tables(Tables::default(), Volatile)
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rows = self.read().map(|t| t.rows().count()).unwrap_or_default();
        f.debug_struct("MemoryRecordStore")
            .field("row_count", &rows)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use chrono::Duration;
    use tally_types::{Identity, ItemState, RecordKey};

    use super::*;
    use crate::error::StoreError;
    use crate::row::{RecordRow, WriteBatch};
    use crate::traits::{CasOutcome, Insertion, LockOutcome, RecordStore};

    fn pending(store: &MemoryRecordStore, seed: &[u8]) -> RecordRow {
        store
            .find_or_insert(&Identity::of(seed), tally_types::now())
            .unwrap()
    }

    #[test]
    fn keys_are_monotonic() {
        let store = MemoryRecordStore::new();
        let a = store.allocate_key().unwrap();
        let b = store.allocate_key().unwrap();
        assert!(b > a);
    }

    #[test]
    fn insert_if_absent_keeps_first_row() {
        let store = MemoryRecordStore::new();
        let now = tally_types::now();
        let id = Identity::of(b"item");
        let first = RecordRow::pending(id, store.allocate_key().unwrap(), now);
        let second = RecordRow::pending(id, store.allocate_key().unwrap(), now);

        assert_eq!(
            store.insert_if_absent(&first, now).unwrap(),
            Insertion::Inserted(first.clone())
        );
        assert_eq!(
            store.insert_if_absent(&second, now).unwrap(),
            Insertion::Existing(first.clone())
        );
        assert_eq!(store.get(&id, now).unwrap(), Some(first));
    }

    #[test]
    fn insert_replaces_expired_row() {
        let store = MemoryRecordStore::new();
        let now = tally_types::now();
        let id = Identity::of(b"expiring");
        let mut old = RecordRow::pending(id, store.allocate_key().unwrap(), now);
        old.expires_at = Some(now - Duration::hours(1));
        store.insert_if_absent(&old, now).unwrap();
        assert_eq!(store.get(&id, now).unwrap(), None);

        let fresh = RecordRow::pending(id, store.allocate_key().unwrap(), now);
        assert!(matches!(
            store.insert_if_absent(&fresh, now).unwrap(),
            Insertion::Inserted(_)
        ));
        assert_eq!(store.get(&id, now).unwrap().unwrap().key, fresh.key);
        assert_eq!(store.get_by_key(old.key, now).unwrap(), None);
    }

    #[test]
    fn compare_and_set_bumps_revision_and_detects_staleness() {
        let store = MemoryRecordStore::new();
        let now = tally_types::now();
        let row = pending(&store, b"cas");

        let mut approved = row.clone();
        approved.state = ItemState::Approved;
        let CasOutcome::Applied(applied) = store.compare_and_set(0, &approved, now).unwrap() else {
            panic!("expected applied");
        };
        assert_eq!(applied.revision, 1);

        let mut declined = row.clone();
        declined.state = ItemState::Declined;
        assert_eq!(
            store.compare_and_set(0, &declined, now).unwrap(),
            CasOutcome::Stale(applied)
        );
    }

    #[test]
    fn compare_and_set_rejects_dangling_lock_holder() {
        let store = MemoryRecordStore::new();
        let mut row = pending(&store, b"bad-lock");
        row.state = ItemState::Locked;
        let err = store
            .compare_and_set(0, &row, tally_types::now())
            .unwrap_err();
        assert!(matches!(err, StoreError::LockHolderMismatch { .. }));
    }

    #[test]
    fn compare_and_set_rejects_stray_lock_origin() {
        let store = MemoryRecordStore::new();
        let now = tally_types::now();
        let mut row = pending(&store, b"stray-origin");
        row.locked_from = Some(ItemState::Approved);
        let err = store.compare_and_set(0, &row, now).unwrap_err();
        assert!(matches!(err, StoreError::LockHolderMismatch { .. }));

        row.state = ItemState::Locked;
        row.locked_by = Some(RecordKey(99));
        row.locked_from = Some(ItemState::Declined);
        let err = store.compare_and_set(0, &row, now).unwrap_err();
        assert!(matches!(err, StoreError::LockHolderMismatch { .. }));
    }

    #[test]
    fn lock_to_revoke_rules() {
        let store = MemoryRecordStore::new();
        let now = tally_types::now();
        let claimant = pending(&store, b"claimant");
        let rival = pending(&store, b"rival");
        let target = Identity::of(b"target");

        let LockOutcome::Locked(locked) = store.lock_to_revoke(claimant.key, &target, now).unwrap()
        else {
            panic!("expected lock");
        };
        assert_eq!(locked.state, ItemState::Locked);
        assert_eq!(locked.locked_by, Some(claimant.key));

        assert_eq!(
            store.lock_to_revoke(claimant.key, &target, now).unwrap(),
            LockOutcome::AlreadyHeld(locked.clone())
        );
        assert_eq!(
            store.lock_to_revoke(rival.key, &target, now).unwrap(),
            LockOutcome::Conflict(locked)
        );
        assert_eq!(
            store
                .lock_to_revoke(RecordKey(9_999), &target, now)
                .unwrap(),
            LockOutcome::UnknownClaimant
        );
    }

    #[test]
    fn create_output_lock_rejects_any_live_identity() {
        let store = MemoryRecordStore::new();
        let now = tally_types::now();
        let owner = pending(&store, b"owner");
        let other = pending(&store, b"other");
        let id = Identity::of(b"new-item");

        let reserved = store.create_output_lock(owner.key, &id, now).unwrap().unwrap();
        assert_eq!(reserved.state, ItemState::LockedForCreation);
        assert_eq!(reserved.locked_by, Some(owner.key));

        assert_eq!(
            store.create_output_lock(owner.key, &id, now).unwrap(),
            Some(reserved)
        );
        assert_eq!(store.create_output_lock(other.key, &id, now).unwrap(), None);
        assert_eq!(
            store
                .create_output_lock(owner.key, &other.identity, now)
                .unwrap(),
            None
        );
    }

    #[test]
    fn locked_by_lists_holder_rows() {
        let store = MemoryRecordStore::new();
        let now = tally_types::now();
        let holder = pending(&store, b"holder");
        store
            .lock_to_revoke(holder.key, &Identity::of(b"t1"), now)
            .unwrap();
        store
            .create_output_lock(holder.key, &Identity::of(b"t2"), now)
            .unwrap();
        pending(&store, b"unrelated");

        let held = store.locked_by(holder.key, now).unwrap();
        assert_eq!(held.len(), 2);
        assert!(held.iter().all(|row| row.locked_by == Some(holder.key)));
    }

    #[test]
    fn failed_batch_leaves_store_untouched() {
        let store = MemoryRecordStore::new();
        let now = tally_types::now();
        let a = pending(&store, b"a");
        let b = pending(&store, b"b");

        let mut batch = WriteBatch::new();
        batch.update(0, RecordRow { state: ItemState::Approved, ..a.clone() });
        batch.update(7, RecordRow { state: ItemState::Declined, ..b.clone() });

        let err = store.apply(&batch, now).unwrap_err();
        assert!(matches!(err, StoreError::StaleWrite { expected: 7, actual: 0, .. }));
        assert_eq!(store.get(&a.identity, now).unwrap(), Some(a));
        assert_eq!(store.get(&b.identity, now).unwrap(), Some(b));
    }

    #[test]
    fn batch_updates_same_row_twice() {
        let store = MemoryRecordStore::new();
        let now = tally_types::now();
        let a = pending(&store, b"twice");

        let mut batch = WriteBatch::new();
        batch.update(0, RecordRow { state: ItemState::Approved, ..a.clone() });
        batch.update(1, RecordRow { state: ItemState::Revoked, ..a.clone() });
        store.apply(&batch, now).unwrap();

        let row = store.get(&a.identity, now).unwrap().unwrap();
        assert_eq!(row.state, ItemState::Revoked);
        assert_eq!(row.revision, 2);
    }

    #[test]
    fn batch_insert_of_live_identity_fails() {
        let store = MemoryRecordStore::new();
        let now = tally_types::now();
        let a = pending(&store, b"taken");

        let mut batch = WriteBatch::new();
        batch.insert(RecordRow::pending(a.identity, store.allocate_key().unwrap(), now));
        assert!(matches!(
            store.apply(&batch, now),
            Err(StoreError::IdentityExists { identity }) if identity == a.identity
        ));
        assert_eq!(store.len(now).unwrap(), 1);
    }

    #[test]
    fn purge_removes_only_expired_rows() {
        let store = MemoryRecordStore::new();
        let now = tally_types::now();
        let keep = pending(&store, b"keep");
        let gone = pending(&store, b"gone");
        let expiring = RecordRow {
            expires_at: Some(now - Duration::minutes(5)),
            ..gone.clone()
        };
        store.compare_and_set(0, &expiring, now).unwrap();

        assert_eq!(store.purge_expired(now).unwrap(), 1);
        assert_eq!(store.purge_expired(now).unwrap(), 0);
        assert_eq!(store.get(&keep.identity, now).unwrap(), Some(keep));
        assert_eq!(store.len(now).unwrap(), 1);
    }

    #[test]
    fn concurrent_find_or_insert_agrees() {
        let store = Arc::new(MemoryRecordStore::new());
        let barrier = Arc::new(Barrier::new(8));
        let id = Identity::random();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    store.find_or_insert(&id, tally_types::now()).unwrap().key
                })
            })
            .collect();

        let keys: Vec<RecordKey> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(keys.iter().all(|k| *k == keys[0]));
        assert_eq!(store.len(tally_types::now()).unwrap(), 1);
    }

    #[test]
    fn concurrent_locks_have_one_winner() {
        let store = Arc::new(MemoryRecordStore::new());
        let target = Identity::random();
        let claimants: Vec<RecordKey> = (0..8u8)
            .map(|i| pending(&store, &[b'c', i]).key)
            .collect();
        let barrier = Arc::new(Barrier::new(claimants.len()));

        let handles: Vec<_> = claimants
            .into_iter()
            .map(|claimant| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    store
                        .lock_to_revoke(claimant, &target, tally_types::now())
                        .unwrap()
                })
            })
            .collect();

        let outcomes: Vec<LockOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = outcomes
            .iter()
            .filter(|o| matches!(o, LockOutcome::Locked(_)))
            .count();
        let losers = outcomes
            .iter()
            .filter(|o| matches!(o, LockOutcome::Conflict(_)))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(losers, 7);
    }
}
