use std::fmt;

use serde::{Deserialize, Serialize};

/// Storage-assigned key of a record row.
///
/// Distinct from the row's [`Identity`](crate::Identity) so that lock
/// references point at "the record claiming this" rather than at an item.
/// Keys are allocated monotonically by the store and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey(pub u64);

impl RecordKey {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r#{}", self.0)
    }
}

impl From<u64> for RecordKey {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
