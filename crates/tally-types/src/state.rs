use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Lifecycle state of an item in the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Registered, not yet resolved.
    Pending,
    /// Identity reserved for a new item that is not approved yet.
    LockedForCreation,
    /// Existing item exclusively claimed for a pending revocation.
    Locked,
    /// Accepted by consensus.
    Approved,
    /// Rejected by consensus before approval.
    Declined,
    /// Approved item invalidated by a later transaction.
    Revoked,
    /// Abandoned without ever being approved.
    Discarded,
}

/// A consensus-driven state change requested on a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transition {
    Approve,
    Revoke,
    Decline,
    Discard,
}

impl ItemState {
    pub const ALL: [ItemState; 7] = [
        Self::Pending,
        Self::LockedForCreation,
        Self::Locked,
        Self::Approved,
        Self::Declined,
        Self::Revoked,
        Self::Discarded,
    ];

    pub fn is_pending(self) -> bool {
        self == Self::Pending
    }

    pub fn is_approved(self) -> bool {
        self == Self::Approved
    }

    /// Terminal, resolved-but-not-approved states.
    pub fn is_archived(self) -> bool {
        matches!(self, Self::Revoked | Self::Discarded)
    }

    /// States that must carry a lock holder.
    pub fn is_lock(self) -> bool {
        matches!(self, Self::Locked | Self::LockedForCreation)
    }

    /// Target state of `transition`, or `None` if it is not allowed from here.
    ///
    /// Revoking an already revoked item is allowed and leaves it revoked.
    pub fn apply(self, transition: Transition) -> Option<ItemState> {
        use ItemState::*;
        match (transition, self) {
            (Transition::Approve, Pending) => Some(Approved),
            (Transition::Revoke, Pending | Locked | Approved | Revoked) => Some(Revoked),
            (Transition::Decline, Pending) => Some(Declined),
            (Transition::Discard, Pending | Declined | LockedForCreation) => Some(Discarded),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::LockedForCreation => "locked_for_creation",
            Self::Locked => "locked",
            Self::Approved => "approved",
            Self::Declined => "declined",
            Self::Revoked => "revoked",
            Self::Discarded => "discarded",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemState {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| TypeError::UnknownState(s.to_string()))
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approve => write!(f, "approve"),
            Self::Revoke => write!(f, "revoke"),
            Self::Decline => write!(f, "decline"),
            Self::Discard => write!(f, "discard"),
        }
    }
}
