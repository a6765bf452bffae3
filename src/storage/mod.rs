//! The `Storage` abstraction: the narrow interface this crate needs from a
//! distributed file store (spec §4.1). `local` ships the one concrete
//! implementation this core carries, standing in for the real distributed
//! backend treated as an external collaborator.

pub mod local;

use std::io::{Read, Write};
use std::path::Path;

pub use local::LocalFsStorage;

use crate::error::{StorageError, WalError};
use crate::naming::Partition;
use crate::wal::Wal;

/// Low-level distributed-FS operations (spec §4.1).
///
/// `commit` must be atomic with respect to crashes: after a crash, either
/// `temp` exists and `final_path` does not, or `final_path` exists (and
/// `temp` may or may not exist; if both exist, `temp` is garbage and may be
/// deleted).
pub trait Storage: Send + Sync {
    fn exists(&self, path: &Path) -> Result<bool, StorageError>;

    fn mkdirs(&self, path: &Path) -> Result<(), StorageError>;

    /// List the names of entries directly under `dir` for which `filter`
    /// returns true. Returns an empty vector if `dir` does not exist.
    fn list_status(
        &self,
        dir: &Path,
        filter: &dyn Fn(&str) -> bool,
    ) -> Result<Vec<String>, StorageError>;

    /// Open `path` for writing, creating parent directories as needed.
    fn create(&self, path: &Path) -> Result<Box<dyn Write + Send>, StorageError>;

    /// Open `path` for reading.
    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + Send>, StorageError>;

    /// Atomically rename `temp` to `final_path`. A no-op if `final_path`
    /// already exists (idempotent commit, spec §4.2).
    fn commit(&self, temp: &Path, final_path: &Path) -> Result<(), StorageError>;

    fn delete(&self, path: &Path) -> Result<(), StorageError>;

    /// Open (creating if absent) the WAL for `partition`, fencing any other
    /// writer for the same partition.
    fn open_wal(&self, partition: &Partition) -> Result<Box<dyn Wal>, WalError>;

    /// Release any resources held by this adapter. Called once at task
    /// shutdown (spec §5, resource ownership).
    fn close(&self) -> Result<(), StorageError>;
}
