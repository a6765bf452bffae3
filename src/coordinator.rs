//! The `Coordinator`: owns the assignment set and drives each assigned
//! partition's state machine (spec §4.6). This plays the role the
//! teacher's `TransactionCoordinator` plays for transactions — a single
//! owner of per-key state, guarded by one lock, handing work out to
//! independent per-key state machines.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::error::SinkError;
use crate::naming::Partition;
use crate::partition::{PartitionRuntime, PartitionSettings};
use crate::record_writer::{Record, RecordWriterProvider};
use crate::storage::Storage;
use crate::upstream::Upstream;

/// Owns every partition currently assigned to this task and the shared
/// collaborators (storage, record writer provider, upstream) each
/// partition's state machine is built against.
pub struct Coordinator {
    storage: Arc<dyn Storage>,
    writer_provider: Arc<dyn RecordWriterProvider>,
    upstream: Arc<dyn Upstream>,
    settings: PartitionSettings,
    partitions: RwLock<HashMap<Partition, PartitionRuntime>>,
}

impl Coordinator {
    pub fn new(
        storage: Arc<dyn Storage>,
        writer_provider: Arc<dyn RecordWriterProvider>,
        upstream: Arc<dyn Upstream>,
        settings: PartitionSettings,
    ) -> Self {
        Self {
            storage,
            writer_provider,
            upstream,
            settings,
            partitions: RwLock::new(HashMap::new()),
        }
    }

    /// Begin tracking newly assigned partitions and drive each one's
    /// recovery sub-machine to completion immediately, rather than waiting
    /// for the first record (spec §4.5): recovery does not depend on the
    /// buffer having anything in it.
    pub fn on_assigned(
        &self,
        assigned: impl IntoIterator<Item = Partition>,
    ) -> Result<(), SinkError> {
        let mut failures = Vec::new();
        for partition in assigned {
            if self.partitions.read().contains_key(&partition) {
                continue;
            }
            let mut runtime = PartitionRuntime::new(
                partition.clone(),
                self.storage.clone(),
                self.writer_provider.clone(),
                self.upstream.clone(),
                self.settings.clone(),
            );
            let result = runtime.execute();
            self.partitions.write().insert(partition.clone(), runtime);
            if let Err(e) = result {
                tracing::warn!(?partition, error = %e, "recovery did not complete on assignment, will retry on next write");
                failures.push(format!("{partition:?}: {e}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SinkError::Aggregate(failures.len(), failures))
        }
    }

    /// Stop tracking revoked partitions, best-effort committing whatever
    /// was open (spec §4.6): errors are logged, not propagated, since a
    /// revocation is not something the caller can act on.
    pub fn on_revoked(&self, revoked: impl IntoIterator<Item = Partition>) {
        for partition in revoked {
            let runtime = self.partitions.write().remove(&partition);
            if let Some(mut runtime) = runtime {
                if let Err(e) = runtime.finalize() {
                    tracing::error!(?partition, error = %e, "best-effort finalize on revocation failed");
                }
            }
        }
    }

    /// Buffer `records` onto their owning partitions and drive every
    /// touched partition that is not currently in its backoff window.
    /// Partitions for which this task holds no assignment are dropped with
    /// a warning, matching the upstream framework's own behavior of never
    /// delivering records for partitions it has not assigned.
    pub fn write(&self, records: impl IntoIterator<Item = (Partition, Record)>) -> Result<(), SinkError> {
        let mut touched: HashSet<Partition> = HashSet::new();
        {
            let mut partitions = self.partitions.write();
            for (partition, record) in records {
                match partitions.get_mut(&partition) {
                    Some(runtime) => {
                        runtime.push(record);
                        touched.insert(partition);
                    }
                    None => {
                        tracing::warn!(?partition, "dropping record for an unassigned partition");
                    }
                }
            }
        }

        let now = Instant::now();
        let mut failures = Vec::new();
        let mut partitions = self.partitions.write();
        for partition in touched {
            if let Some(runtime) = partitions.get_mut(&partition) {
                if runtime.in_backoff(now) {
                    continue;
                }
                if let Err(e) = runtime.execute() {
                    failures.push(format!("{partition:?}: {e}"));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SinkError::Aggregate(failures.len(), failures))
        }
    }

    /// The offset this task considers safe for the upstream to commit per
    /// partition: one past the last committed file's end (spec §8,
    /// invariant 4). Partitions with no commits yet are omitted.
    pub fn committed_offsets(&self) -> HashMap<Partition, u64> {
        self.partitions
            .read()
            .iter()
            .filter_map(|(p, runtime)| runtime.committed_offset().map(|o| (p.clone(), o)))
            .collect()
    }

    /// Shut down: best-effort rotate-and-commit every open temp, close
    /// every WAL lease, and release the storage adapter. Every partition's
    /// failure is collected rather than aborting at the first one (spec
    /// §5, resource ownership).
    pub fn close(&self) -> Result<(), SinkError> {
        let mut failures = Vec::new();
        {
            let mut partitions = self.partitions.write();
            for (partition, runtime) in partitions.iter_mut() {
                if let Err(e) = runtime.finalize() {
                    failures.push(format!("{partition:?}: {e}"));
                }
            }
            partitions.clear();
        }

        if let Err(e) = self.storage.close() {
            failures.push(format!("storage close: {e}"));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SinkError::Aggregate(failures.len(), failures))
        }
    }
}
