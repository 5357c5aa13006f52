//! Eventline Checkpoint Store
//!
//! The durable surface that cooperating processor instances coordinate
//! through. It holds two kinds of records per (namespace, event hub,
//! consumer group, partition):
//!
//! - **Ownership**: a time-bounded lease naming the processor instance that
//!   currently pumps the partition, guarded by an opaque version token.
//! - **Checkpoint**: the (offset, sequence number) of the last event the
//!   application acknowledged, written last-writer-wins.
//!
//! ## Optimistic concurrency
//!
//! Processors never take a distributed lock. Every ownership mutation is a
//! compare-and-set: the caller presents the version token it last observed
//! (or none, for a first claim) and the store accepts the write only if the
//! stored token still matches. Competing claims therefore resolve to exactly
//! one winner, and the losers learn about it by their entry being omitted
//! from the claim result.
//!
//! ## Implementations
//!
//! - [`BlobCheckpointStore`]: the reference implementation over any
//!   [`object_store::ObjectStore`]; records are empty-bodied objects whose
//!   metadata carries the fields and whose e-tag is the version token.
//! - [`InMemoryCheckpointStore`]: in-process store with identical semantics
//!   for tests and single-node setups.

pub mod blob;
pub mod error;
pub mod memory;
pub mod types;

pub use blob::BlobCheckpointStore;
pub use error::{Result, StoreError};
pub use memory::InMemoryCheckpointStore;
pub use types::{Checkpoint, PartitionOwnership};

use async_trait::async_trait;

/// Durable ownership and checkpoint storage shared by processor instances.
///
/// All implementations must be `Send + Sync` so they can be shared across
/// tasks as `Arc<dyn CheckpointStore>`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// List every ownership record for the given scope, including expired
    /// ones. The caller decides which records are still active.
    async fn list_ownership(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<PartitionOwnership>>;

    /// Attempt to claim or renew a batch of ownership records.
    ///
    /// Each element carries the version token the caller last observed
    /// (`None` for a first claim). For each element the store performs an
    /// atomic compare-and-set and the successful entries are returned with
    /// their new token and a freshly stamped `last_modified`. Entries that
    /// lost the race are omitted from the result; partial success is the
    /// normal case and is not an error.
    async fn claim_ownership(
        &self,
        requested: Vec<PartitionOwnership>,
    ) -> Result<Vec<PartitionOwnership>>;

    /// List every checkpoint for the given scope.
    async fn list_checkpoints(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<Checkpoint>>;

    /// Persist a checkpoint, unconditionally (last writer wins).
    async fn update_checkpoint(&self, checkpoint: Checkpoint) -> Result<()>;
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time before Unix epoch")
        .as_millis() as i64
}
