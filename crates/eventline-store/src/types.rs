//! Ownership and checkpoint records.
//!
//! Both record kinds are scoped by (namespace, event hub, consumer group,
//! partition): at most one ownership record and one checkpoint exist per
//! scope. Ownership records carry a store-assigned `last_modified`
//! timestamp and an opaque `version` token used for optimistic
//! concurrency; checkpoints are last-writer-wins and carry no token.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A lease record: which processor instance currently owns a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOwnership {
    /// Fully qualified namespace of the event hub.
    pub fully_qualified_namespace: String,

    /// Event hub name.
    pub event_hub_name: String,

    /// Consumer group the ownership is scoped to.
    pub consumer_group: String,

    /// Partition identifier.
    pub partition_id: String,

    /// Identifier of the owning processor instance. Empty for records
    /// whose owner has relinquished the partition.
    pub owner_id: String,

    /// Store-assigned timestamp of the last claim or renewal (ms since
    /// epoch). Zero until the record has round-tripped through the store.
    pub last_modified: i64,

    /// Opaque revision token assigned by the store. `None` for a record
    /// that has never been written (first claim).
    pub version: Option<String>,
}

impl PartitionOwnership {
    /// A fresh claim request for `partition_id`, carrying no version token.
    pub fn first_claim(
        fully_qualified_namespace: impl Into<String>,
        event_hub_name: impl Into<String>,
        consumer_group: impl Into<String>,
        partition_id: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            fully_qualified_namespace: fully_qualified_namespace.into(),
            event_hub_name: event_hub_name.into(),
            consumer_group: consumer_group.into(),
            partition_id: partition_id.into(),
            owner_id: owner_id.into(),
            last_modified: 0,
            version: None,
        }
    }

    /// Whether this lease is still active at `now_ms` given the expiration
    /// interval. A record with an empty owner is never active.
    pub fn is_active(&self, expiration: Duration, now_ms: i64) -> bool {
        !self.owner_id.is_empty()
            && now_ms.saturating_sub(self.last_modified) < expiration.as_millis() as i64
    }
}

/// A durable position within one partition's stream.
///
/// Offset and sequence number come from an event that was delivered to the
/// user handler and subsequently checkpointed. The store does not enforce
/// monotonicity; late writes win.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Fully qualified namespace of the event hub.
    pub fully_qualified_namespace: String,

    /// Event hub name.
    pub event_hub_name: String,

    /// Consumer group the checkpoint is scoped to.
    pub consumer_group: String,

    /// Partition identifier.
    pub partition_id: String,

    /// Byte offset of the checkpointed event.
    pub offset: i64,

    /// Sequence number of the checkpointed event.
    pub sequence_number: i64,
}
