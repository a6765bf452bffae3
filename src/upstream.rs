//! The control surface this crate needs from the upstream log client (spec
//! §1, §6). Polling, offset commit, and rebalance callbacks themselves are
//! external collaborators and out of scope; only this narrow surface is
//! specified here.

use crate::error::IllegalWorkerStateError;
use crate::naming::Partition;

/// Delivery control the state machine exercises against the upstream
/// client. Implementations must make `pause`/`resume` idempotent.
pub trait Upstream: Send + Sync {
    fn assignment(&self) -> Vec<Partition>;

    /// Pause delivery for `partition`. Fails with
    /// [`IllegalWorkerStateError`] if the framework does not consider this
    /// task to own `partition` — a programmer-state violation, not a
    /// transient failure (spec §7).
    fn pause(&self, partition: &Partition) -> Result<(), IllegalWorkerStateError>;

    fn resume(&self, partition: &Partition) -> Result<(), IllegalWorkerStateError>;

    /// Set the next delivery position for `partition`.
    fn seek(&self, partition: &Partition, offset: u64);

    /// Advisory delay before the next poll.
    fn request_backoff(&self, ms: u64);
}
