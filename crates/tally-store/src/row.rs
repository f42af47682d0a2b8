use serde::{Deserialize, Serialize};
use tally_types::{is_expired, Identity, ItemState, RecordKey, Timestamp};

/// One persisted record row.
///
/// `revision` starts at zero and is bumped by every successful
/// compare-and-set; it is the precondition token for optimistic writes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRow {
    pub identity: Identity,
    pub key: RecordKey,
    pub state: ItemState,
    pub created_at: Timestamp,
    pub expires_at: Option<Timestamp>,
    pub locked_by: Option<RecordKey>,
    /// State a revocation lock was taken from; set only while LOCKED.
    pub locked_from: Option<ItemState>,
    pub revision: u64,
}

impl RecordRow {
    /// A fresh PENDING row.
    pub fn pending(identity: Identity, key: RecordKey, now: Timestamp) -> Self {
        Self {
            identity,
            key,
            state: ItemState::Pending,
            created_at: now,
            expires_at: None,
            locked_by: None,
            locked_from: None,
            revision: 0,
        }
    }

    /// A fresh LOCKED_FOR_CREATION row reserved by `owner`.
    pub fn reserved(identity: Identity, key: RecordKey, owner: RecordKey, now: Timestamp) -> Self {
        Self {
            state: ItemState::LockedForCreation,
            locked_by: Some(owner),
            ..Self::pending(identity, key, now)
        }
    }

    /// `false` once the row's expiry has passed.
    pub fn is_live(&self, now: Timestamp) -> bool {
        !is_expired(self.expires_at, now)
    }

    /// `true` if this row is an identity reservation held by `owner`.
    pub fn is_reserved_by(&self, owner: RecordKey) -> bool {
        self.state == ItemState::LockedForCreation && self.locked_by == Some(owner)
    }

    /// This row with its revocation lock released, back in the state it was
    /// locked from. A lock with no recorded origin falls back to PENDING.
    pub fn unlocked(&self) -> Self {
        Self {
            state: self.locked_from.unwrap_or(ItemState::Pending),
            locked_by: None,
            locked_from: None,
            ..self.clone()
        }
    }

    /// `true` if this row is locked (for revocation or creation) by `holder`.
    pub fn is_locked_by(&self, holder: RecordKey) -> bool {
        self.state.is_lock() && self.locked_by == Some(holder)
    }
}

/// One buffered mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert a new row; fails if a live row holds the identity.
    Insert(RecordRow),
    /// Replace a row if it is still at `expected_revision`.
    Update {
        expected_revision: u64,
        row: RecordRow,
    },
    /// Remove a row; removing an absent row is not an error.
    Delete { key: RecordKey },
}

impl WriteOp {
    pub fn key(&self) -> RecordKey {
        match self {
            Self::Insert(row) | Self::Update { row, .. } => row.key,
            Self::Delete { key } => *key,
        }
    }
}

/// Ordered set of mutations applied all-or-nothing by
/// [`RecordStore::apply`](crate::RecordStore::apply).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    pub fn insert(&mut self, row: RecordRow) {
        self.push(WriteOp::Insert(row));
    }

    pub fn update(&mut self, expected_revision: u64, row: RecordRow) {
        self.push(WriteOp::Update {
            expected_revision,
            row,
        });
    }

    pub fn delete(&mut self, key: RecordKey) {
        self.push(WriteOp::Delete { key });
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn pending_row_defaults() {
        let now = tally_types::now();
        let row = RecordRow::pending(Identity::of(b"x"), RecordKey(1), now);
        assert_eq!(row.state, ItemState::Pending);
        assert_eq!(row.revision, 0);
        assert!(row.locked_by.is_none());
        assert!(row.is_live(now));
    }

    #[test]
    fn reserved_row_is_locked_by_owner() {
        let now = tally_types::now();
        let row = RecordRow::reserved(Identity::of(b"x"), RecordKey(2), RecordKey(1), now);
        assert_eq!(row.state, ItemState::LockedForCreation);
        assert!(row.is_locked_by(RecordKey(1)));
        assert!(!row.is_locked_by(RecordKey(2)));
    }

    #[test]
    fn row_dies_at_expiry() {
        let now = tally_types::now();
        let mut row = RecordRow::pending(Identity::of(b"x"), RecordKey(1), now);
        row.expires_at = Some(now - Duration::seconds(1));
        assert!(!row.is_live(now));
    }

    #[test]
    fn batch_keeps_order() {
        let now = tally_types::now();
        let mut batch = WriteBatch::new();
        batch.insert(RecordRow::pending(Identity::of(b"a"), RecordKey(5), now));
        batch.delete(RecordKey(3));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.ops()[0].key(), RecordKey(5));
        assert_eq!(batch.ops()[1].key(), RecordKey(3));
    }
}
