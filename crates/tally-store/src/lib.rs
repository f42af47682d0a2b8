//! Record storage for the tally state ledger.
//!
//! The store maps item identities to record rows and is the only place the
//! ledger's atomicity and mutual-exclusion guarantees are enforced: callers
//! may reach it directly, so uniqueness of live identities, compare-and-set
//! on row revisions, and the lock rules all hold at this boundary.
//!
//! # Backends
//!
//! All backends implement the [`RecordStore`] trait:
//!
//! - [`MemoryRecordStore`] -- in-memory tables for tests and embedding
//! - [`DurableRecordStore`] -- the same tables rebuilt from a CRC-framed
//!   write-ahead journal, with snapshot compaction
//!
//! # Design Rules
//!
//! 1. Every write is planned on a staged view, journaled, then committed.
//!    A failed plan or journal write leaves no trace.
//! 2. Expired rows are absent to every read, purged or not.
//! 3. Record keys are allocated monotonically and never reused.
//! 4. Contention outcomes are values ([`Insertion`], [`CasOutcome`],
//!    [`LockOutcome`]); only batch preconditions and I/O surface as errors.

pub mod durable;
pub mod engine;
pub mod error;
pub mod journal;
pub mod memory;
pub mod row;
pub mod tables;
pub mod traits;

pub use durable::DurableRecordStore;
pub use engine::{Journal, TableStore, Volatile};
pub use error::{StoreError, StoreResult};
pub use journal::{JournalEntry, SyncMode, WriteAheadLog};
pub use memory::MemoryRecordStore;
pub use row::{RecordRow, WriteBatch, WriteOp};
pub use tables::Mutation;
pub use traits::{CasOutcome, Insertion, LockOutcome, RecordStore};
