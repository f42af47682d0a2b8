use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tally_store::RecordRow;
use tally_types::{Identity, ItemState, RecordKey, Timestamp, Transition};
use tracing::debug;

use crate::error::{LedgerError, LedgerResult};
use crate::inner::LedgerCore;

/// In-process handle to one ledger record.
///
/// Reads come from the handle's copy of the row; `set_state` and
/// `set_expires_at` edit that copy, and `save` writes it back with a
/// compare-and-set on the revision it was loaded at. The transition methods
/// (`approve`, `revoke`, ...) check the move and save in one step.
///
/// Inside [`Ledger::transaction`](crate::Ledger::transaction) every write a
/// handle makes on the transaction's thread is buffered until commit. The
/// handle's own copy keeps the committed row meanwhile: the transaction's
/// thread reads through to the buffer, every other thread reads the copy,
/// and a rollback leaves nothing to undo.
pub struct StateRecord {
    core: Arc<LedgerCore>,
    me: Weak<StateRecord>,
    identity: Identity,
    key: RecordKey,
    row: Mutex<RecordRow>,
}

impl StateRecord {
    pub(crate) fn new(core: Arc<LedgerCore>, row: RecordRow) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            core,
            me: me.clone(),
            identity: row.identity,
            key: row.key,
            row: Mutex::new(row),
        })
    }

    // The row is replaced whole; a poisoned guard still holds a valid row.
    fn row(&self) -> MutexGuard<'_, RecordRow> {
        self.row.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the row as this handle currently sees it, including the
    /// calling thread's buffered writes and edits.
    pub fn snapshot(&self) -> RecordRow {
        self.core
            .staged_row(self.key)
            .unwrap_or_else(|| self.row().clone())
    }

    pub fn id(&self) -> Identity {
        self.identity
    }

    pub fn record_key(&self) -> RecordKey {
        self.key
    }

    pub fn state(&self) -> ItemState {
        self.snapshot().state
    }

    pub fn created_at(&self) -> Timestamp {
        self.snapshot().created_at
    }

    pub fn expires_at(&self) -> Option<Timestamp> {
        self.snapshot().expires_at
    }

    /// Key of the record holding this one's lock.
    pub fn locked_by(&self) -> Option<RecordKey> {
        self.snapshot().locked_by
    }

    pub fn revision(&self) -> u64 {
        self.snapshot().revision
    }

    pub fn is_pending(&self) -> bool {
        self.state().is_pending()
    }

    pub fn is_approved(&self) -> bool {
        self.state().is_approved()
    }

    pub fn is_archived(&self) -> bool {
        self.state().is_archived()
    }

    pub fn is_locked(&self) -> bool {
        self.state().is_lock()
    }

    // Inside a transaction the edit is kept in the scope, out of sight of
    // other threads.
    fn stage_edit(&self, apply: impl Fn(&mut RecordRow)) {
        let base = self.row().clone();
        if !self.core.edit_draft(base, &apply) {
            apply(&mut *self.row());
        }
    }

    /// Stage a state change for the next [`save`](Self::save).
    ///
    /// Lock states are refused: they carry a holder and can only be entered
    /// through [`lock_to_revoke`](Self::lock_to_revoke) or
    /// [`create_output_lock_record`](Self::create_output_lock_record).
    pub fn set_state(&self, state: ItemState) -> LedgerResult<()> {
        if state.is_lock() {
            return Err(LedgerError::InvalidState(state));
        }
        self.stage_edit(|row| {
            row.state = state;
            row.locked_by = None;
            row.locked_from = None;
        });
        Ok(())
    }

    /// Stage an expiry for the next [`save`](Self::save). Once it passes,
    /// the record reads as absent everywhere.
    pub fn set_expires_at(&self, expires_at: Option<Timestamp>) {
        self.stage_edit(|row| row.expires_at = expires_at);
    }

    /// Write the handle's row back to the ledger.
    ///
    /// Fails with [`LedgerError::Conflict`] if the stored row moved past the
    /// revision this handle holds, and with [`LedgerError::NotFound`] if it
    /// is gone.
    pub fn save(&self) -> LedgerResult<()> {
        self.persist(self.snapshot())
    }

    fn persist(&self, row: RecordRow) -> LedgerResult<()> {
        if let Some(saved) = self.core.write_row(&row, &self.me)? {
            self.absorb(saved);
        }
        Ok(())
    }

    /// Drop unsaved edits and re-read the stored row.
    pub fn reload(&self) -> LedgerResult<()> {
        self.core.drop_draft(self.key);
        match self.core.load_by_key(self.key)? {
            Some(row) if row.identity == self.identity => {}
            _ => return Err(LedgerError::NotFound(self.identity)),
        }
        if let Some(stored) = self.core.stored_row(self.key)? {
            *self.row() = stored;
        }
        Ok(())
    }

    fn transition(&self, action: Transition) -> LedgerResult<()> {
        let mut row = self.snapshot();
        let next = row
            .state
            .apply(action)
            .ok_or(LedgerError::AlreadyResolved {
                state: row.state,
                action,
            })?;
        if next == row.state {
            return Ok(());
        }
        debug!(record = %row.key, from = %row.state, to = %next, "record transition");
        row.state = next;
        row.locked_by = None;
        row.locked_from = None;
        self.persist(row)
    }

    /// PENDING → APPROVED.
    pub fn approve(&self) -> LedgerResult<()> {
        self.transition(Transition::Approve)
    }

    /// PENDING, LOCKED or APPROVED → REVOKED; a no-op when already revoked.
    pub fn revoke(&self) -> LedgerResult<()> {
        self.transition(Transition::Revoke)
    }

    /// PENDING → DECLINED.
    pub fn decline(&self) -> LedgerResult<()> {
        self.transition(Transition::Decline)
    }

    /// PENDING, DECLINED or LOCKED_FOR_CREATION → DISCARDED.
    pub fn discard(&self) -> LedgerResult<()> {
        self.transition(Transition::Discard)
    }

    /// Give up whatever lock this record is in.
    ///
    /// A revocation lock falls back to the state the record was locked
    /// from; a creation reservation is destroyed. Unlocked records are left
    /// alone.
    pub fn unlock(&self) -> LedgerResult<()> {
        let row = self.snapshot();
        match row.state {
            ItemState::Locked => self.persist(row.unlocked()),
            ItemState::LockedForCreation => self.core.remove_row(&row),
            _ => Ok(()),
        }
    }

    /// Remove the record. Later lookups of its identity find nothing.
    pub fn destroy(&self) -> LedgerResult<()> {
        self.core.remove_row(&self.snapshot())
    }

    /// Lock `target` for revocation on behalf of this record.
    ///
    /// Idempotent for the same target; fails with
    /// [`LedgerError::LockConflict`] if another record holds it.
    pub fn lock_to_revoke(&self, target: &Identity) -> LedgerResult<Arc<StateRecord>> {
        self.core.lock_record(self.key, target)
    }

    /// Reserve `identity` for a new item owned by this record.
    ///
    /// `None` when the identity already has a live record that is not this
    /// record's own reservation.
    pub fn create_output_lock_record(
        &self,
        identity: &Identity,
    ) -> LedgerResult<Option<Arc<StateRecord>>> {
        self.core.reserve_record(self.key, identity)
    }

    /// The record holding this one's lock, if it is still live.
    pub fn lock_holder(&self) -> LedgerResult<Option<Arc<StateRecord>>> {
        match self.locked_by() {
            Some(holder) => self.core.record_by_key(holder),
            None => Ok(None),
        }
    }

    /// Take `row` if it is a later revision of this handle's row.
    pub(crate) fn absorb(&self, row: RecordRow) {
        let mut current = self.row();
        if current.key == row.key && row.revision > current.revision {
            *current = row;
        }
    }
}

impl fmt::Debug for StateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let row = self.snapshot();
        f.debug_struct("StateRecord")
            .field("id", &row.identity)
            .field("key", &row.key)
            .field("state", &row.state)
            .field("locked_by", &row.locked_by)
            .field("expires_at", &row.expires_at)
            .field("revision", &row.revision)
            .finish()
    }
}
