//! State ledger for the tally network.
//!
//! Tracks the lifecycle of every item the network votes on: each identity
//! has at most one live record, moving from PENDING to a resolved state,
//! with two kinds of exclusive claim along the way:
//!
//! - a **revocation lock**, taken by a transaction that intends to revoke an
//!   existing item, which keeps two transactions from spending it at once
//! - an **output lock**, reserving a brand-new identity for the transaction
//!   that will create it
//!
//! # Architecture
//!
//! - [`Ledger`] -- facade: find-or-create, lookups, locks, reservations,
//!   transactions, caching
//! - [`StateRecord`] -- shared handle to one record with its state machine
//! - [`LedgerConfig`] -- TOML-loadable backend and cache settings
//! - [`StagedItem`] -- the locks and reservations held for one
//!   [`Approvable`](tally_types::Approvable) during consensus
//!
//! All guarantees are enforced by the underlying
//! [`RecordStore`](tally_store::RecordStore); the identity cache only
//! decides which in-process handle a caller gets.

mod cache;
pub mod config;
mod inner;
pub mod error;
pub mod ledger;
pub mod record;
pub mod staging;
pub mod transaction;

pub use config::{BackendConfig, LedgerConfig};
pub use error::{ConfigError, LedgerError, LedgerResult};
pub use ledger::Ledger;
pub use record::StateRecord;
pub use staging::StagedItem;
pub use transaction::TxOutcome;
