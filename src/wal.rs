//! The per-partition write-ahead log (spec §4.2): an append-only log of
//! `(tempName, finalName)` rename intents, replayed on recovery before any
//! new writes are accepted.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, WalError};
use crate::storage::Storage;

/// A single rename intent: promote `temp_name` to `final_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    pub temp_name: String,
    pub final_name: String,
}

#[derive(Serialize, Deserialize)]
struct Framed {
    entry: WalEntry,
    checksum: u32,
}

/// Operations a partition's write-ahead log must support (spec §4.2).
pub trait Wal: Send {
    fn append(&mut self, temp_name: &str, final_name: &str) -> Result<(), WalError>;

    /// Replay entries in order, committing each via `storage`. Idempotent:
    /// running this twice produces the same committed set (spec §8).
    fn apply(&mut self, storage: &dyn Storage) -> Result<(), WalError>;

    /// Empty the log. Must be durable before return, and must only be
    /// called after `apply` has succeeded (spec §8, invariant 6).
    fn truncate(&mut self) -> Result<(), WalError>;

    /// Release the exclusive writer lease.
    fn close(&mut self) -> Result<(), WalError>;

    /// Path for diagnostics.
    fn log_file(&self) -> &Path;
}

/// A [`Wal`] backed by a local, length-prefixed, checksummed append-only
/// file, in the same style as the teacher's WAL record framing: a `u32`
/// little-endian length prefix followed by a bincode-encoded, CRC32C
/// checksummed record. A truncated trailing record (a crash mid-`append`)
/// is detected and dropped rather than replayed.
pub struct FileWal {
    log_path: PathBuf,
    lock_path: PathBuf,
    file: File,
}

impl FileWal {
    pub(crate) fn open(log_path: PathBuf, lock_path: PathBuf) -> Result<Self, WalError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(StorageError::from)?;
        Ok(Self {
            log_path,
            lock_path,
            file,
        })
    }

    fn read_entries(&self) -> Result<Vec<WalEntry>, WalError> {
        let mut reader = match File::open(&self.log_path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(WalError::Storage(StorageError::from(e))),
        };
        let mut entries = Vec::new();
        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(WalError::Storage(StorageError::from(e))),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut buf = vec![0u8; len];
            match reader.read_exact(&mut buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    tracing::warn!(
                        path = %self.log_path.display(),
                        "discarding truncated trailing WAL record"
                    );
                    break;
                }
                Err(e) => return Err(WalError::Storage(StorageError::from(e))),
            }
            let framed: Framed = match bincode::deserialize(&buf) {
                Ok(f) => f,
                Err(_) => {
                    tracing::warn!(
                        path = %self.log_path.display(),
                        "discarding unparseable WAL record"
                    );
                    break;
                }
            };
            let encoded = bincode::serialize(&framed.entry).map_err(WalError::Serialization)?;
            if crc32fast::hash(&encoded) != framed.checksum {
                tracing::warn!(
                    path = %self.log_path.display(),
                    "discarding WAL record that failed checksum verification"
                );
                break;
            }
            entries.push(framed.entry);
        }
        Ok(entries)
    }
}

impl Wal for FileWal {
    fn append(&mut self, temp_name: &str, final_name: &str) -> Result<(), WalError> {
        let entry = WalEntry {
            temp_name: temp_name.to_string(),
            final_name: final_name.to_string(),
        };
        let encoded = bincode::serialize(&entry).map_err(WalError::Serialization)?;
        let checksum = crc32fast::hash(&encoded);
        let framed = bincode::serialize(&Framed { entry, checksum }).map_err(WalError::Serialization)?;

        self.file
            .write_all(&(framed.len() as u32).to_le_bytes())
            .map_err(StorageError::from)?;
        self.file.write_all(&framed).map_err(StorageError::from)?;
        self.file.sync_data().map_err(StorageError::from)?;
        Ok(())
    }

    fn apply(&mut self, storage: &dyn Storage) -> Result<(), WalError> {
        for entry in self.read_entries()? {
            let temp = Path::new(&entry.temp_name);
            let final_path = Path::new(&entry.final_name);
            if storage.exists(final_path)? {
                // Already committed by a previous (possibly crashed) apply;
                // the temp is garbage left behind (spec §4.2).
                storage.delete(temp)?;
            } else {
                storage.commit(temp, final_path)?;
            }
        }
        Ok(())
    }

    fn truncate(&mut self) -> Result<(), WalError> {
        self.file.set_len(0).map_err(StorageError::from)?;
        self.file.sync_all().map_err(StorageError::from)?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), WalError> {
        let _ = fs::remove_file(&self.lock_path);
        Ok(())
    }

    fn log_file(&self) -> &Path {
        &self.log_path
    }
}
