//! Error types for the sink connector core.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SinkError>;

/// Failures from the distributed file store (or its stand-in, [`crate::storage::LocalFsStorage`]).
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path not found: {0}")]
    NotFound(PathBuf),

    #[error("commit target already has a different source: {0}")]
    CommitConflict(PathBuf),
}

/// Failures reading, appending, truncating, or fencing a partition's WAL.
#[derive(Error, Debug)]
pub enum WalError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] Box<bincode::ErrorKind>),

    #[error("WAL entry failed checksum verification")]
    Checksum,

    #[error("another writer holds the WAL for this partition: {0}")]
    Fenced(PathBuf),
}

/// Codec-level failure from a [`crate::record_writer::RecordWriter`].
#[derive(Error, Debug)]
pub enum RecordWriterError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The upstream framework signalled the worker is in an invalid state (e.g.
/// pausing a partition this task does not own). Non-retryable.
#[derive(Error, Debug)]
#[error("illegal worker state: {0}")]
pub struct IllegalWorkerStateError(pub String);

/// Surfaces at startup only, never from the hot path.
#[derive(Error, Debug)]
#[error("configuration error: {0}")]
pub struct ConfigurationError(pub String);

/// Another writer holds the partition's WAL lease.
#[derive(Error, Debug)]
#[error("coordination error: {0}")]
pub struct CoordinationError(pub String);

/// The umbrella error type threaded through the drain loop and `close()`.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    RecordWriter(#[from] RecordWriterError),

    #[error(transparent)]
    IllegalWorkerState(#[from] IllegalWorkerStateError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    /// Multiple partitions failed teardown during `close()`; each one is
    /// reported rather than only the first.
    #[error("{0} partition(s) failed during close: {1:?}")]
    Aggregate(usize, Vec<String>),
}

impl SinkError {
    /// True for failures the drain loop should retry after backoff rather
    /// than surface to the caller (§7 propagation policy).
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SinkError::IllegalWorkerState(_) | SinkError::Configuration(_) | SinkError::Coordination(_)
        )
    }
}
