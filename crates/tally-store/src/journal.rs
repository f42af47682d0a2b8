use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::row::RecordRow;
use crate::tables::Mutation;

/// One journal entry.
///
/// On-disk format:
/// ```text
/// [4 bytes: entry length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload (bincode-serialized JournalEntry)]
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalEntry {
    /// Mutations of one atomic store operation.
    Mutations(Vec<Mutation>),
    /// Full image of the live rows, written by compaction.
    Snapshot { next_key: u64, rows: Vec<RecordRow> },
}

/// Flush/sync strategy for the journal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `fsync` after every write.
    EveryWrite,
    /// Flush to the OS and rely on its page cache.
    #[default]
    OsDefault,
}

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

struct JournalWriter {
    writer: BufWriter<File>,
    offset: u64,
}

impl JournalWriter {
    /// Forget a failed append: its buffered bytes are dropped unwritten and
    /// the file is cut back to `offset`, the end of the last good entry.
    fn discard_tail(&mut self) {
        let file = match self.writer.get_ref().try_clone() {
            Ok(file) => file,
            Err(e) => {
                warn!(error = %e, "cannot reopen journal to discard a failed append");
                return;
            }
        };
        let failed = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let (_, unwritten) = failed.into_parts();
        if let Err(e) = self.writer.get_ref().set_len(self.offset) {
            warn!(offset = self.offset, error = %e, "cannot truncate failed journal append");
            return;
        }
        warn!(
            offset = self.offset,
            dropped = unwritten.map_or(0, |buf| buf.len()),
            "failed journal append discarded"
        );
    }
}

/// Append-only, crash-recoverable journal of store mutations.
///
/// Entries that fail the CRC check on recovery are skipped; a truncated
/// tail (torn write) ends recovery and is cut off.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<JournalWriter>,
    sync_mode: SyncMode,
}

impl WriteAheadLog {
    /// Open (or create) the journal file at `path`.
    pub fn open(path: &Path, sync_mode: SyncMode) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        let offset = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(JournalWriter {
                writer: BufWriter::new(file),
                offset,
            }),
            sync_mode,
        })
    }

    /// Append one entry. Returns the byte offset it was written at.
    pub fn append(&self, entry: &JournalEntry) -> StoreResult<u64> {
        let payload = encode(entry)?;
        let mut w = self.lock_writer()?;
        let entry_offset = w.offset;

        if let Err(e) = self.write_entry(&mut w.writer, &payload) {
            w.discard_tail();
            return Err(e.into());
        }
        w.offset += (HEADER_SIZE + payload.len()) as u64;

        debug!(offset = entry_offset, len = payload.len(), "journal append");
        Ok(entry_offset)
    }

    fn write_entry(&self, writer: &mut BufWriter<File>, payload: &[u8]) -> io::Result<()> {
        write_frame(writer, payload)?;
        writer.flush()?;
        if self.sync_mode == SyncMode::EveryWrite {
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Read back every intact entry, front to back.
    pub fn recover(&self) -> StoreResult<Vec<JournalEntry>> {
        let mut file = BufReader::new(File::open(&self.path)?);
        let file_len = file.get_ref().metadata()?.len();
        let mut entries = Vec::new();
        let mut offset: u64 = 0;

        while offset + HEADER_SIZE as u64 <= file_len {
            file.seek(SeekFrom::Start(offset))?;

            let mut header = [0u8; HEADER_SIZE];
            match file.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

            if length == 0 || offset + HEADER_SIZE as u64 + length as u64 > file_len {
                warn!(offset, length, file_len, "torn journal entry; stopping recovery");
                break;
            }

            let mut payload = vec![0u8; length as usize];
            file.read_exact(&mut payload)?;
            offset += HEADER_SIZE as u64 + length as u64;

            let actual_crc = crc32fast::hash(&payload);
            if actual_crc != expected_crc {
                warn!(
                    offset,
                    expected = expected_crc,
                    actual = actual_crc,
                    "journal CRC mismatch; skipping entry"
                );
                continue;
            }

            match bincode::deserialize::<JournalEntry>(&payload) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(offset, error = %e, "undecodable journal entry; skipping"),
            }
        }

        if offset < file_len {
            self.truncate(offset)?;
        }

        debug!(recovered = entries.len(), "journal recovery complete");
        Ok(entries)
    }

    /// Cut the journal back to `len` bytes so appends land after the last
    /// intact entry.
    fn truncate(&self, len: u64) -> StoreResult<()> {
        let mut w = self.lock_writer()?;
        w.writer.flush()?;
        w.writer.get_ref().set_len(len)?;
        warn!(from = w.offset, to = len, "journal truncated to last intact entry");
        w.offset = len;
        Ok(())
    }

    /// Atomically replace the whole journal with `entries`.
    ///
    /// The new content is written to a sibling file, synced, and renamed
    /// over the journal, so a crash leaves either the old or the new file.
    pub fn rewrite(&self, entries: &[JournalEntry]) -> StoreResult<()> {
        let mut w = self.lock_writer()?;
        let tmp_path = self.path.with_extension("compact");

        let mut offset = 0u64;
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for entry in entries {
                let payload = encode(entry)?;
                write_frame(&mut tmp, &payload)?;
                offset += (HEADER_SIZE + payload.len()) as u64;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        w.writer = BufWriter::new(file);
        w.offset = offset;

        debug!(entries = entries.len(), bytes = offset, "journal rewritten");
        Ok(())
    }

    /// Current write offset (journal size in bytes).
    pub fn offset(&self) -> StoreResult<u64> {
        Ok(self.lock_writer()?.offset)
    }

    fn lock_writer(&self) -> StoreResult<std::sync::MutexGuard<'_, JournalWriter>> {
        self.writer
            .lock()
            .map_err(|e| StoreError::Poisoned(format!("journal writer: {e}")))
    }
}

fn encode(entry: &JournalEntry) -> StoreResult<Vec<u8>> {
    bincode::serialize(entry).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn write_frame(out: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    let length = payload.len() as u32;
    let crc = crc32fast::hash(payload);
    out.write_all(&length.to_le_bytes())?;
    out.write_all(&crc.to_le_bytes())?;
    out.write_all(payload)
}
