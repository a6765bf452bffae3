//! A sink connector core: buffers an ordered, partitioned log into
//! offset-named artifacts on a distributed file store, recovering from a
//! crash at any point via a per-partition write-ahead log.
//!
//! [`Coordinator`] is the entry point: it owns the assignment set and,
//! per partition, a [`partition::PartitionRuntime`] state machine that
//! recovers from a prior run's WAL before accepting new records, then
//! buffers, rotates, and atomically commits new temp artifacts as records
//! arrive. [`storage::Storage`] and [`upstream::Upstream`] are the two
//! seams where a real deployment plugs in a distributed file store client
//! and the upstream log framework; this crate ships one concrete
//! [`storage::LocalFsStorage`] backend and a [`record_writer::JsonLinesWriterProvider`]
//! record format, both resolved through [`registry::StorageRegistry`] and
//! [`registry::RecordWriterProviderRegistry`] from a validated [`Config`].

pub mod config;
pub mod coordinator;
pub mod error;
pub mod naming;
pub mod partition;
pub mod record_writer;
pub mod registry;
pub mod storage;
pub mod upstream;
pub mod wal;

pub use config::Config;
pub use coordinator::Coordinator;
pub use error::{
    ConfigurationError, CoordinationError, IllegalWorkerStateError, RecordWriterError, Result,
    SinkError, StorageError, WalError,
};
pub use naming::Partition;
pub use partition::{PartitionRuntime, PartitionSettings, State as PartitionState};
pub use record_writer::{JsonLinesWriterProvider, Record, RecordWriter, RecordWriterProvider};
pub use registry::{RecordWriterProviderRegistry, StorageRegistry};
pub use storage::{LocalFsStorage, Storage};
pub use upstream::Upstream;
pub use wal::{FileWal, Wal, WalEntry};
