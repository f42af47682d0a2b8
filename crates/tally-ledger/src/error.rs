use std::path::PathBuf;

use tally_store::StoreError;
use tally_types::{Identity, ItemState, RecordKey, Transition};

/// Errors produced by ledger operations.
///
/// `IdentityExists`, `LockConflict`, `AlreadyResolved` and `Conflict` are
/// contention outcomes: callers lost a race or asked for a move the record
/// no longer allows. `Storage` carries the backend failure as it was raised.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("no live record for {0}")]
    NotFound(Identity),

    #[error("no live record with key {0}")]
    KeyNotFound(RecordKey),

    #[error("cannot {action} a record in state {state}")]
    AlreadyResolved { state: ItemState, action: Transition },

    #[error("identity already exists: {0}")]
    IdentityExists(Identity),

    #[error("{target} is locked by another record")]
    LockConflict {
        target: Identity,
        holder: Option<RecordKey>,
    },

    #[error("{target} in state {state} cannot be locked for revocation")]
    NotLockable { target: Identity, state: ItemState },

    #[error("record {key} changed concurrently: expected revision {expected}, found {actual}")]
    Conflict {
        key: RecordKey,
        expected: u64,
        actual: u64,
    },

    #[error("state {0} is only reachable through a lock operation")]
    InvalidState(ItemState),

    #[error("a transaction is already open on this thread")]
    NestedTransaction,

    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

impl LedgerError {
    /// Map a failed batch precondition onto the contention outcome it means.
    pub(crate) fn from_commit(err: StoreError) -> Self {
        match err {
            StoreError::IdentityExists { identity } => Self::IdentityExists(identity),
            StoreError::StaleWrite {
                key,
                expected,
                actual,
            } => Self::Conflict {
                key,
                expected,
                actual,
            },
            StoreError::Missing { key } => Self::KeyNotFound(key),
            other => Self::Storage(other),
        }
    }

    /// `true` when a competing writer, not a fault, caused the error.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            Self::IdentityExists(_)
                | Self::LockConflict { .. }
                | Self::AlreadyResolved { .. }
                | Self::Conflict { .. }
        )
    }
}

/// Result alias for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Errors loading a [`LedgerConfig`](crate::LedgerConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid ledger config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cannot encode ledger config: {0}")]
    Encode(#[from] toml::ser::Error),
}
