use std::path::Path;

use tracing::info;

use crate::engine::TableStore;
use crate::error::StoreResult;
use crate::journal::{JournalEntry, SyncMode, WriteAheadLog};
use crate::tables::Tables;

/// Crash-recoverable record store: in-memory tables rebuilt from a
/// write-ahead journal on open.
pub type DurableRecordStore = TableStore<WriteAheadLog>;

impl DurableRecordStore {
    /// Open the journal at `path`, replaying it into memory.
    pub fn open(path: &Path, sync_mode: SyncMode) -> StoreResult<Self> {
        let journal = WriteAheadLog::open(path, sync_mode)?;
        let mut tables = Tables::default();
        let mut replayed = 0usize;

        for entry in journal.recover()? {
            match entry {
                JournalEntry::Mutations(mutations) => tables.commit(&mutations),
                JournalEntry::Snapshot { next_key, rows } => {
                    tables = Tables::from_rows(rows, next_key);
                }
            }
            replayed += 1;
        }

        info!(
            path = %path.display(),
            entries = replayed,
            rows = tables.rows().count(),
            "record journal opened"
        );
        Ok(Self::with_tables(tables, journal))
    }

    pub fn journal_size(&self) -> StoreResult<u64> {
        self.journal().offset()
    }
}
