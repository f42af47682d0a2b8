use tally_types::{Identity, ItemState, RecordKey, Timestamp};

use crate::error::StoreResult;
use crate::row::{RecordRow, WriteBatch};

/// Result of [`RecordStore::insert_if_absent`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Insertion {
    /// The row was created.
    Inserted(RecordRow),
    /// A live row already held the identity; nothing was written.
    Existing(RecordRow),
}

impl Insertion {
    pub fn into_row(self) -> RecordRow {
        match self {
            Self::Inserted(row) | Self::Existing(row) => row,
        }
    }
}

/// Result of [`RecordStore::compare_and_set`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CasOutcome {
    /// Written; carries the row at its new revision.
    Applied(RecordRow),
    /// The row is at another revision; carries the current row.
    Stale(RecordRow),
    /// No live row with this key.
    Missing,
}

/// Result of [`RecordStore::lock_to_revoke`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    /// The target is now locked by the claimant.
    Locked(RecordRow),
    /// The claimant already held the lock; nothing was written.
    AlreadyHeld(RecordRow),
    /// Another record holds a lock on the target.
    Conflict(RecordRow),
    /// The target is in a state that cannot be locked for revocation.
    NotLockable(RecordRow),
    /// The claimant key has no live row.
    UnknownClaimant,
}

impl LockOutcome {
    /// Revocation-lock rule for `row` claimed by `claimant`.
    ///
    /// Unlocked PENDING or APPROVED rows are lockable; a `Locked` result
    /// carries the row in its locked form at the unchanged revision, and the
    /// caller persists it. Never yields `UnknownClaimant`.
    pub fn decide(row: RecordRow, claimant: RecordKey) -> Self {
        if row.key == claimant {
            return Self::NotLockable(row);
        }
        match row.state {
            ItemState::Locked if row.locked_by == Some(claimant) => Self::AlreadyHeld(row),
            ItemState::Locked | ItemState::LockedForCreation => Self::Conflict(row),
            ItemState::Pending | ItemState::Approved => Self::Locked(RecordRow {
                state: ItemState::Locked,
                locked_by: Some(claimant),
                locked_from: Some(row.state),
                ..row
            }),
            ItemState::Declined | ItemState::Revoked | ItemState::Discarded => {
                Self::NotLockable(row)
            }
        }
    }
}

/// Durable keyed storage of record rows.
///
/// Implementations must be thread-safe and make every operation atomic:
/// a concurrent reader sees either all of an operation's effects or none.
/// Uniqueness of identities among live rows and the locking rules are
/// enforced here, not in callers, so the contract holds for anyone calling
/// the store directly.
///
/// Rows whose `expires_at` has passed at `now` are absent for every read
/// and are replaced by inserts, whether or not they were purged yet.
pub trait RecordStore: Send + Sync {
    /// Reserve a new record key. Keys are never handed out twice.
    fn allocate_key(&self) -> StoreResult<RecordKey>;

    /// Live row for `identity`.
    fn get(&self, identity: &Identity, now: Timestamp) -> StoreResult<Option<RecordRow>>;

    /// Live row with `key`.
    fn get_by_key(&self, key: RecordKey, now: Timestamp) -> StoreResult<Option<RecordRow>>;

    /// Insert `row` unless a live row already holds its identity.
    fn insert_if_absent(&self, row: &RecordRow, now: Timestamp) -> StoreResult<Insertion>;

    /// Replace the row with `row.key` if it is still at `expected_revision`.
    /// The stored revision becomes `expected_revision + 1`.
    fn compare_and_set(
        &self,
        expected_revision: u64,
        row: &RecordRow,
        now: Timestamp,
    ) -> StoreResult<CasOutcome>;

    /// Remove a row. Returns `true` if it existed.
    fn delete(&self, key: RecordKey) -> StoreResult<bool>;

    /// Find or create the row for `target` and lock it for revocation by
    /// `claimant`, atomically.
    fn lock_to_revoke(
        &self,
        claimant: RecordKey,
        target: &Identity,
        now: Timestamp,
    ) -> StoreResult<LockOutcome>;

    /// Reserve `identity` for a new item owned by `owner`.
    ///
    /// Creates a LOCKED_FOR_CREATION row when no live row exists. Returns the
    /// existing row if `owner` already reserved it, and `None` for any other
    /// live row or an unknown owner.
    fn create_output_lock(
        &self,
        owner: RecordKey,
        identity: &Identity,
        now: Timestamp,
    ) -> StoreResult<Option<RecordRow>>;

    /// Live rows whose lock is held by `holder`, ordered by key.
    fn locked_by(&self, holder: RecordKey, now: Timestamp) -> StoreResult<Vec<RecordRow>>;

    /// Apply every op in `batch`, or none of them.
    fn apply(&self, batch: &WriteBatch, now: Timestamp) -> StoreResult<()>;

    /// Physically remove expired rows. Returns how many were removed.
    fn purge_expired(&self, now: Timestamp) -> StoreResult<usize>;

    /// Number of live rows.
    fn len(&self, now: Timestamp) -> StoreResult<usize>;

    /// Drop expired rows and rewrite persistent state to the live rows only.
    /// Returns the number of rows kept.
    fn compact(&self, now: Timestamp) -> StoreResult<usize>;

    /// Live row for `identity`, creating a PENDING one if there is none.
    ///
    /// Concurrent callers always agree on the returned row.
    fn find_or_insert(&self, identity: &Identity, now: Timestamp) -> StoreResult<RecordRow> {
        if let Some(row) = self.get(identity, now)? {
            return Ok(row);
        }
        let row = RecordRow::pending(*identity, self.allocate_key()?, now);
        Ok(self.insert_if_absent(&row, now)?.into_row())
    }
}
