use tally_types::{Identity, ItemState, RecordKey};

/// Errors from record store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A live row already holds this identity.
    #[error("identity already exists: {identity}")]
    IdentityExists { identity: Identity },

    /// Compare-and-set precondition failed: the row moved on.
    #[error("stale write to {key}: expected revision {expected}, found {actual}")]
    StaleWrite {
        key: RecordKey,
        expected: u64,
        actual: u64,
    },

    /// The row to update is gone (destroyed or expired).
    #[error("record {key} is missing")]
    Missing { key: RecordKey },

    /// A row with this key already exists.
    #[error("record key {key} is already in use")]
    KeyInUse { key: RecordKey },

    /// An update tried to move a row to a different identity.
    #[error("record {key} cannot change identity")]
    IdentityMismatch { key: RecordKey },

    /// Lock holder or pre-lock state disagrees with the row's state.
    #[error("record {key} in state {state} has an inconsistent lock holder")]
    LockHolderMismatch { key: RecordKey, state: ItemState },

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A lock guarding store state was poisoned by a panicking writer.
    #[error("store lock poisoned: {0}")]
    Poisoned(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
