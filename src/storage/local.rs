//! A local-filesystem [`Storage`] implementation.
//!
//! This plays the role the teacher's LSM storage layer plays for on-disk
//! durability: plain `std::fs`, an atomic rename for commit, and a lock file
//! for WAL write-lease fencing. It is not distributed, but it satisfies the
//! same contract (spec §4.1) the core is written against, so the state
//! machine and its tests exercise a real backend rather than a mock.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{StorageError, WalError};
use crate::naming::Partition;
use crate::wal::{FileWal, Wal};

use super::Storage;

#[derive(Debug)]
pub struct LocalFsStorage {
    root: PathBuf,
    topics_dir: String,
}

impl LocalFsStorage {
    pub fn new(root: impl Into<PathBuf>, topics_dir: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            topics_dir: topics_dir.into(),
        }
    }

    fn partition_dir(&self, partition: &Partition) -> PathBuf {
        partition.dir(&self.root, &self.topics_dir)
    }
}

impl Storage for LocalFsStorage {
    fn exists(&self, path: &Path) -> Result<bool, StorageError> {
        Ok(path.exists())
    }

    fn mkdirs(&self, path: &Path) -> Result<(), StorageError> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn list_status(
        &self,
        dir: &Path,
        filter: &dyn Fn(&str) -> bool,
    ) -> Result<Vec<String>, StorageError> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if filter(name) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    fn create(&self, path: &Path) -> Result<Box<dyn Write + Send>, StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Ok(Box::new(file))
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + Send>, StorageError> {
        if !path.exists() {
            return Err(StorageError::NotFound(path.to_path_buf()));
        }
        Ok(Box::new(File::open(path)?))
    }

    fn commit(&self, temp: &Path, final_path: &Path) -> Result<(), StorageError> {
        if final_path.exists() {
            // Idempotent: already committed by a previous attempt (spec §4.2).
            return Ok(());
        }
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(temp, final_path)?;
        Ok(())
    }

    fn delete(&self, path: &Path) -> Result<(), StorageError> {
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn open_wal(&self, partition: &Partition) -> Result<Box<dyn Wal>, WalError> {
        let dir = self.partition_dir(partition);
        fs::create_dir_all(&dir).map_err(StorageError::from)?;
        let lock_path = dir.join("wal.lock");
        acquire_lease(&lock_path)?;
        let log_path = dir.join("wal.log");
        let wal = FileWal::open(log_path, lock_path)?;
        Ok(Box::new(wal))
    }

    fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Rename-based exclusive lease: `open(create_new)` fails if another writer
/// already holds the lock file, which is how the spec expects the fencing
/// requirement (§4.2) to be satisfied without a server-side lease.
fn acquire_lease(lock_path: &Path) -> Result<(), WalError> {
    match OpenOptions::new().write(true).create_new(true).open(lock_path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(WalError::Fenced(lock_path.to_path_buf()))
        }
        Err(e) => Err(WalError::Storage(StorageError::from(e))),
    }
}
