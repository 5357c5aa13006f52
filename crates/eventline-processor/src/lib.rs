//! Eventline Processor
//!
//! A cooperative, durable event-stream processor for a partitioned event
//! hub. Processor instances configured with the same consumer group
//! coordinate through a shared [`CheckpointStore`] to spread the hub's
//! partitions across themselves, pump each owned partition's events into
//! user callbacks, and persist per-partition checkpoints so that work
//! resumes without loss (and with bounded duplication) after restarts and
//! ownership changes.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐        ┌────────────────────┐
//! │  EventProcessor    │        │  EventProcessor    │   ... peers
//! │  ┌──────────────┐  │        │  ┌──────────────┐  │
//! │  │ LoadBalancer │──┼────┐   │  │ LoadBalancer │  │
//! │  └──────┬───────┘  │    │   │  └──────────────┘  │
//! │    pump │ pump ... │    │   └─────────┬──────────┘
//! └─────────┼──────────┘    │             │
//!           │               ▼             ▼
//!           │        ┌─────────────────────────┐
//!           │        │     CheckpointStore     │  leases + checkpoints
//!           │        └─────────────────────────┘
//!           ▼
//!   ┌───────────────────┐
//!   │ EventHubTransport │  partition streams
//!   └───────────────────┘
//! ```
//!
//! Each instance runs one load-balancer task that renews its leases,
//! observes its peers through the store, and claims at most one partition
//! per cycle; each owned partition runs its own pump task. Delivery is
//! at-least-once: per-partition order is preserved, and events after the
//! last checkpoint may be redelivered after a failure.
//!
//! ## Quick start
//!
//! See [`EventProcessor`] for a complete example against the in-process
//! [`InMemoryHub`].

mod balancer;
mod handlers;
mod pump;
mod reader;

pub mod context;
pub mod error;
pub mod memory_hub;
pub mod processor;
pub mod transport;

pub use context::{CloseReason, PartitionContext};
pub use error::{ErrorOperation, HandlerError, ProcessorError, Result};
pub use memory_hub::InMemoryHub;
pub use processor::{EventProcessor, EventProcessorBuilder, ProcessorOptions};
pub use transport::{
    ConsumerOptions, EventHubTransport, PartitionConsumer, TransportError, TransportResult,
};

pub use eventline_core::{
    EventPosition, LastEnqueuedEventProperties, ReceivedEvent, RetryMode, RetryPolicy,
};
pub use eventline_store::{
    BlobCheckpointStore, Checkpoint, CheckpointStore, InMemoryCheckpointStore, PartitionOwnership,
    StoreError,
};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time before Unix epoch")
        .as_millis() as i64
}
