//! Foundation types for the tally state ledger.
//!
//! Every other tally crate depends on `tally-types`.
//!
//! # Key Types
//!
//! - [`Identity`] -- content digest naming an item
//! - [`ItemState`] -- lifecycle state of an item, with its [`Transition`] rules
//! - [`RecordKey`] -- storage-assigned key of a record row
//! - [`Timestamp`] -- wall-clock instant for creation and expiry
//! - [`Approvable`] -- capability set the consensus layer stages against the ledger

pub mod approvable;
pub mod error;
pub mod identity;
pub mod key;
pub mod state;
pub mod temporal;

pub use approvable::{Approvable, ErrorCode, ErrorRecord};
pub use error::TypeError;
pub use identity::{Identity, IDENTITY_LEN};
pub use key::RecordKey;
pub use state::{ItemState, Transition};
pub use temporal::{is_expired, now, Timestamp};
