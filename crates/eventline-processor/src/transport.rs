//! Event hub transport interface.
//!
//! The processor consumes the broker client through these traits rather
//! than implementing it: [`EventHubTransport`] enumerates partitions and
//! opens per-partition consumers, and a [`PartitionConsumer`] yields events
//! from one partition starting at a requested [`EventPosition`].
//!
//! Connection-level settings (TLS, proxy, protocol version) belong to the
//! concrete transport's constructor; the processor receives transports
//! pre-built as `Arc<dyn EventHubTransport>`.

use async_trait::async_trait;
use eventline_core::{EventPosition, LastEnqueuedEventProperties, ReceivedEvent};
use std::time::Duration;
use thiserror::Error;

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Errors surfaced by transports and consumers.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The link or connection dropped. Retryable; the reader reopens at
    /// its current position.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A transport operation exceeded its per-try timeout.
    #[error("transport operation timed out")]
    Timeout,

    /// The service asked the client to back off.
    #[error("service throttled the request: {0}")]
    Throttled(String),

    /// The namespace, hub, or partition does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Credentials were rejected.
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// The consumer was closed and cannot be read from.
    #[error("consumer is closed")]
    Closed,
}

impl TransportError {
    /// Whether the reader should back off and reopen its link.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionLost(_)
                | TransportError::Timeout
                | TransportError::Throttled(_)
        )
    }
}

/// Options applied when opening a partition consumer.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// How many events the consumer should buffer ahead of reads.
    pub prefetch_count: u32,

    /// Whether the consumer should track the partition's newest event
    /// metadata alongside each read.
    pub track_last_enqueued_event_properties: bool,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            prefetch_count: 300,
            track_last_enqueued_event_properties: false,
        }
    }
}

/// Client for one event hub: partition discovery plus consumer creation.
#[async_trait]
pub trait EventHubTransport: Send + Sync {
    /// The hub's current partition identifiers.
    async fn partition_ids(&self) -> TransportResult<Vec<String>>;

    /// Open a consumer over one partition, positioned at `position`.
    async fn open_consumer(
        &self,
        consumer_group: &str,
        partition_id: &str,
        position: EventPosition,
        options: ConsumerOptions,
    ) -> TransportResult<Box<dyn PartitionConsumer>>;
}

/// A reader over a single partition's event stream.
#[async_trait]
pub trait PartitionConsumer: Send + Sync {
    /// Read up to `max_batch` events, waiting at most `max_wait` before
    /// returning an empty batch. An empty batch means "no events yet" and
    /// is not an error.
    async fn read_events(
        &mut self,
        max_batch: usize,
        max_wait: Duration,
    ) -> TransportResult<Vec<ReceivedEvent>>;

    /// Metadata about the partition's newest event, when tracking was
    /// requested in [`ConsumerOptions`].
    fn last_enqueued_event_properties(&self) -> Option<LastEnqueuedEventProperties>;

    /// Release the link. Reads after close fail with [`TransportError::Closed`].
    async fn close(&mut self) -> TransportResult<()>;
}
