//! Per-partition context handed to user callbacks.

use crate::error::{ProcessorError, Result};
use eventline_core::{LastEnqueuedEventProperties, ReceivedEvent};
use eventline_store::{Checkpoint, CheckpointStore};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Why a partition pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The processor is shutting down, or the pump is being replaced.
    Shutdown,
    /// Another processor claimed the partition.
    OwnershipLost,
    /// The event handler or the partition reader failed; the partition is
    /// restarted on the next load-balancer cycle.
    ProcessingError,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Shutdown => f.write_str("shutdown"),
            CloseReason::OwnershipLost => f.write_str("ownership lost"),
            CloseReason::ProcessingError => f.write_str("processing error"),
        }
    }
}

struct ContextInner {
    fully_qualified_namespace: String,
    event_hub_name: String,
    consumer_group: String,
    partition_id: String,
    store: Arc<dyn CheckpointStore>,
    last_enqueued: RwLock<Option<LastEnqueuedEventProperties>>,
}

/// Identifies the partition a callback is running for and carries the
/// checkpoint capability. Cheap to clone.
#[derive(Clone)]
pub struct PartitionContext {
    inner: Arc<ContextInner>,
}

impl PartitionContext {
    pub(crate) fn new(
        fully_qualified_namespace: String,
        event_hub_name: String,
        consumer_group: String,
        partition_id: String,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                fully_qualified_namespace,
                event_hub_name,
                consumer_group,
                partition_id,
                store,
                last_enqueued: RwLock::new(None),
            }),
        }
    }

    pub fn fully_qualified_namespace(&self) -> &str {
        &self.inner.fully_qualified_namespace
    }

    pub fn event_hub_name(&self) -> &str {
        &self.inner.event_hub_name
    }

    pub fn consumer_group(&self) -> &str {
        &self.inner.consumer_group
    }

    pub fn partition_id(&self) -> &str {
        &self.inner.partition_id
    }

    /// Persist the position of `event` as this partition's checkpoint.
    ///
    /// After a restart or ownership change, delivery resumes with the event
    /// after this one. Fails with [`ProcessorError::MissingPosition`] if the
    /// event carries no offset or sequence number.
    pub async fn update_checkpoint(&self, event: &ReceivedEvent) -> Result<()> {
        let (Some(offset), Some(sequence_number)) = (event.offset, event.sequence_number) else {
            return Err(ProcessorError::MissingPosition);
        };

        self.inner
            .store
            .update_checkpoint(Checkpoint {
                fully_qualified_namespace: self.inner.fully_qualified_namespace.clone(),
                event_hub_name: self.inner.event_hub_name.clone(),
                consumer_group: self.inner.consumer_group.clone(),
                partition_id: self.inner.partition_id.clone(),
                offset,
                sequence_number,
            })
            .await?;

        debug!(
            partition_id = %self.inner.partition_id,
            offset,
            sequence_number,
            "checkpoint written"
        );
        Ok(())
    }

    /// Metadata about the partition's newest event, when tail tracking is
    /// enabled in the processor options.
    pub async fn last_enqueued_event_properties(&self) -> Option<LastEnqueuedEventProperties> {
        self.inner.last_enqueued.read().await.clone()
    }

    pub(crate) async fn set_last_enqueued(&self, properties: Option<LastEnqueuedEventProperties>) {
        *self.inner.last_enqueued.write().await = properties;
    }
}

impl std::fmt::Debug for PartitionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionContext")
            .field("fully_qualified_namespace", &self.inner.fully_qualified_namespace)
            .field("event_hub_name", &self.inner.event_hub_name)
            .field("consumer_group", &self.inner.consumer_group)
            .field("partition_id", &self.inner.partition_id)
            .finish()
    }
}
