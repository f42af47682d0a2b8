//! Row tables and the staged view every write is planned against.
//!
//! A write never touches [`Tables`] directly. It runs against a [`Staged`]
//! overlay, which records the resulting [`Mutation`]s; the caller journals
//! them and only then commits them to the tables. A failed plan therefore
//! leaves nothing behind.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tally_types::{Identity, ItemState, RecordKey, Timestamp};

use crate::error::{StoreError, StoreResult};
use crate::row::{RecordRow, WriteBatch, WriteOp};
use crate::traits::{CasOutcome, Insertion, LockOutcome};

/// A committed change to the tables. This is also the journal's unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    Put(RecordRow),
    Remove(RecordKey),
    /// Key allocation high-water mark: the next key to hand out.
    AdvanceKeys(u64),
}

#[derive(Clone, Debug)]
pub(crate) struct Tables {
    rows: BTreeMap<RecordKey, RecordRow>,
    index: HashMap<Identity, RecordKey>,
    next_key: u64,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            index: HashMap::new(),
            next_key: 1,
        }
    }
}

impl Tables {
    pub(crate) fn from_rows(rows: Vec<RecordRow>, next_key: u64) -> Self {
        let mut tables = Self::default();
        tables.next_key = next_key.max(1);
        for row in rows {
            tables.commit_one(&Mutation::Put(row));
        }
        tables
    }

    pub(crate) fn stage(&self) -> Staged<'_> {
        Staged {
            base: self,
            rows: BTreeMap::new(),
            index: HashMap::new(),
            next_key: self.next_key,
            log: Vec::new(),
        }
    }

    pub(crate) fn commit(&mut self, mutations: &[Mutation]) {
        for mutation in mutations {
            self.commit_one(mutation);
        }
    }

    fn commit_one(&mut self, mutation: &Mutation) {
        match mutation {
            Mutation::Put(row) => {
                self.next_key = self.next_key.max(row.key.get() + 1);
                self.rows.insert(row.key, row.clone());
                self.index.insert(row.identity, row.key);
            }
            Mutation::Remove(key) => {
                if let Some(previous) = self.rows.remove(key) {
                    if self.index.get(&previous.identity) == Some(key) {
                        self.index.remove(&previous.identity);
                    }
                }
            }
            Mutation::AdvanceKeys(next) => {
                self.next_key = self.next_key.max(*next);
            }
        }
    }

    pub(crate) fn live(&self, identity: &Identity, now: Timestamp) -> Option<&RecordRow> {
        self.index
            .get(identity)
            .and_then(|key| self.rows.get(key))
            .filter(|row| row.is_live(now))
    }

    pub(crate) fn live_by_key(&self, key: RecordKey, now: Timestamp) -> Option<&RecordRow> {
        self.rows.get(&key).filter(|row| row.is_live(now))
    }

    pub(crate) fn live_rows(&self, now: Timestamp) -> impl Iterator<Item = &RecordRow> {
        self.rows.values().filter(move |row| row.is_live(now))
    }

    pub(crate) fn next_key(&self) -> u64 {
        self.next_key
    }

    pub(crate) fn rows(&self) -> impl Iterator<Item = &RecordRow> {
        self.rows.values()
    }
}

/// Copy-on-write overlay over [`Tables`] that logs what it changes.
pub(crate) struct Staged<'a> {
    base: &'a Tables,
    rows: BTreeMap<RecordKey, Option<RecordRow>>,
    index: HashMap<Identity, Option<RecordKey>>,
    next_key: u64,
    log: Vec<Mutation>,
}

impl<'a> Staged<'a> {
    pub(crate) fn into_mutations(self) -> Vec<Mutation> {
        self.log
    }

    fn row(&self, key: RecordKey) -> Option<&RecordRow> {
        match self.rows.get(&key) {
            Some(staged) => staged.as_ref(),
            None => self.base.rows.get(&key),
        }
    }

    fn key_of(&self, identity: &Identity) -> Option<RecordKey> {
        match self.index.get(identity) {
            Some(staged) => *staged,
            None => self.base.index.get(identity).copied(),
        }
    }

    fn live(&self, identity: &Identity, now: Timestamp) -> Option<RecordRow> {
        self.key_of(identity)
            .and_then(|key| self.row(key))
            .filter(|row| row.is_live(now))
            .cloned()
    }

    fn live_by_key(&self, key: RecordKey, now: Timestamp) -> Option<RecordRow> {
        self.row(key).filter(|row| row.is_live(now)).cloned()
    }

    fn put(&mut self, row: RecordRow) {
        self.next_key = self.next_key.max(row.key.get() + 1);
        self.index.insert(row.identity, Some(row.key));
        self.rows.insert(row.key, Some(row.clone()));
        self.log.push(Mutation::Put(row));
    }

    fn remove(&mut self, key: RecordKey) -> bool {
        let Some(identity) = self.row(key).map(|row| row.identity) else {
            return false;
        };
        if self.key_of(&identity) == Some(key) {
            self.index.insert(identity, None);
        }
        self.rows.insert(key, None);
        self.log.push(Mutation::Remove(key));
        true
    }

    pub(crate) fn allocate(&mut self) -> RecordKey {
        let key = RecordKey(self.next_key);
        self.next_key += 1;
        self.log.push(Mutation::AdvanceKeys(self.next_key));
        key
    }

    pub(crate) fn insert_if_absent(
        &mut self,
        row: &RecordRow,
        now: Timestamp,
    ) -> StoreResult<Insertion> {
        check_lock_holder(row)?;
        if let Some(existing) = self.live(&row.identity, now) {
            return Ok(Insertion::Existing(existing));
        }
        if self.row(row.key).is_some() {
            return Err(StoreError::KeyInUse { key: row.key });
        }
        // An expired row still indexed under this identity gives way.
        if let Some(expired) = self.key_of(&row.identity) {
            self.remove(expired);
        }
        self.put(row.clone());
        Ok(Insertion::Inserted(row.clone()))
    }

    pub(crate) fn compare_and_set(
        &mut self,
        expected_revision: u64,
        row: &RecordRow,
        now: Timestamp,
    ) -> StoreResult<CasOutcome> {
        check_lock_holder(row)?;
        let Some(current) = self.live_by_key(row.key, now) else {
            return Ok(CasOutcome::Missing);
        };
        if current.identity != row.identity {
            return Err(StoreError::IdentityMismatch { key: row.key });
        }
        if current.revision != expected_revision {
            return Ok(CasOutcome::Stale(current));
        }
        let updated = RecordRow {
            created_at: current.created_at,
            revision: expected_revision + 1,
            ..row.clone()
        };
        self.put(updated.clone());
        Ok(CasOutcome::Applied(updated))
    }

    pub(crate) fn delete(&mut self, key: RecordKey) -> bool {
        self.remove(key)
    }

    pub(crate) fn lock_to_revoke(
        &mut self,
        claimant: RecordKey,
        target: &Identity,
        now: Timestamp,
    ) -> StoreResult<LockOutcome> {
        if self.live_by_key(claimant, now).is_none() {
            return Ok(LockOutcome::UnknownClaimant);
        }
        let row = match self.live(target, now) {
            Some(row) => row,
            None => {
                let key = self.allocate();
                let row = RecordRow::pending(*target, key, now);
                self.insert_if_absent(&row, now)?.into_row()
            }
        };

        match LockOutcome::decide(row, claimant) {
            LockOutcome::Locked(locked) => {
                let locked = RecordRow {
                    revision: locked.revision + 1,
                    ..locked
                };
                self.put(locked.clone());
                Ok(LockOutcome::Locked(locked))
            }
            other => Ok(other),
        }
    }

    pub(crate) fn create_output_lock(
        &mut self,
        owner: RecordKey,
        identity: &Identity,
        now: Timestamp,
    ) -> StoreResult<Option<RecordRow>> {
        if self.live_by_key(owner, now).is_none() {
            return Ok(None);
        }
        if let Some(existing) = self.live(identity, now) {
            let ours = existing.is_reserved_by(owner);
            return Ok(ours.then_some(existing));
        }
        let key = self.allocate();
        let row = RecordRow::reserved(*identity, key, owner, now);
        match self.insert_if_absent(&row, now)? {
            Insertion::Inserted(row) => Ok(Some(row)),
            Insertion::Existing(_) => Ok(None),
        }
    }

    /// Apply a batch in order. Any failed precondition aborts the plan.
    pub(crate) fn apply(&mut self, batch: &WriteBatch, now: Timestamp) -> StoreResult<()> {
        for op in batch.ops() {
            match op {
                WriteOp::Insert(row) => {
                    if let Insertion::Existing(existing) = self.insert_if_absent(row, now)? {
                        return Err(StoreError::IdentityExists {
                            identity: existing.identity,
                        });
                    }
                }
                WriteOp::Update {
                    expected_revision,
                    row,
                } => match self.compare_and_set(*expected_revision, row, now)? {
                    CasOutcome::Applied(_) => {}
                    CasOutcome::Stale(current) => {
                        return Err(StoreError::StaleWrite {
                            key: row.key,
                            expected: *expected_revision,
                            actual: current.revision,
                        });
                    }
                    CasOutcome::Missing => return Err(StoreError::Missing { key: row.key }),
                },
                WriteOp::Delete { key } => {
                    self.delete(*key);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn purge_expired(&mut self, now: Timestamp) -> usize {
        let expired: Vec<RecordKey> = self
            .base
            .rows
            .values()
            .filter(|row| !row.is_live(now))
            .map(|row| row.key)
            .collect();
        expired.into_iter().filter(|key| self.remove(*key)).count()
    }
}

/// A row carries a lock holder exactly when its state is a lock state, and
/// a pre-lock state only while LOCKED, naming a lockable state.
fn check_lock_holder(row: &RecordRow) -> StoreResult<()> {
    let origin_ok = match row.locked_from {
        None => true,
        Some(from) => {
            row.state == ItemState::Locked
                && matches!(from, ItemState::Pending | ItemState::Approved)
        }
    };
    if row.state.is_lock() == row.locked_by.is_some() && origin_ok {
        Ok(())
    } else {
        Err(StoreError::LockHolderMismatch {
            key: row.key,
            state: row.state,
        })
    }
}
