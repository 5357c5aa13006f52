//! Event Data Structures
//!
//! A [`ReceivedEvent`] is the unit of data delivered to the user's event
//! handler: an opaque body plus the position metadata the hub assigned when
//! the event was enqueued.
//!
//! ## Structure
//!
//! - **body**: the payload (arbitrary bytes, zero-copy via `bytes::Bytes`)
//! - **offset**: byte position of the event within its partition
//! - **sequence_number**: monotonically increasing per-partition counter
//! - **enqueued_time**: broker-assigned timestamp (milliseconds since epoch)
//! - **partition_key**: optional routing key supplied by the publisher
//! - **properties**: free-form application metadata
//!
//! Offset and sequence number are `Option` because an event constructed
//! locally (rather than read from a partition) carries no position; asking
//! to checkpoint such an event is a logic error surfaced by the processor.
//! Events delivered by a partition reader always carry both.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single event read from a partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedEvent {
    /// Event payload.
    pub body: Bytes,

    /// Byte offset within the partition, if the event was read from one.
    pub offset: Option<i64>,

    /// Per-partition sequence number, if the event was read from one.
    pub sequence_number: Option<i64>,

    /// Broker-assigned enqueue timestamp (ms since epoch).
    pub enqueued_time: i64,

    /// Partition key supplied at publish time.
    pub partition_key: Option<String>,

    /// Application-defined properties.
    pub properties: HashMap<String, String>,
}

impl ReceivedEvent {
    /// Create an event as read from a partition, with full position metadata.
    pub fn new(body: Bytes, offset: i64, sequence_number: i64, enqueued_time: i64) -> Self {
        Self {
            body,
            offset: Some(offset),
            sequence_number: Some(sequence_number),
            enqueued_time,
            partition_key: None,
            properties: HashMap::new(),
        }
    }

    /// Create an event from a bare body, with no position metadata.
    ///
    /// Such an event cannot be checkpointed.
    pub fn from_body(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            offset: None,
            sequence_number: None,
            enqueued_time: 0,
            partition_key: None,
            properties: HashMap::new(),
        }
    }

    /// Attach a partition key.
    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// Attach an application property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Whether the event carries a position that can be checkpointed.
    pub fn has_position(&self) -> bool {
        self.offset.is_some() && self.sequence_number.is_some()
    }

    /// Estimate the wire size of this event in bytes.
    pub fn estimated_size(&self) -> usize {
        8 + // offset
        8 + // sequence number
        8 + // enqueued time
        self.partition_key.as_ref().map(|k| k.len()).unwrap_or(0) +
        self.properties.iter().map(|(k, v)| k.len() + v.len()).sum::<usize>() +
        self.body.len()
    }
}

/// Metadata about the last event enqueued to a partition.
///
/// Populated by the transport when tail tracking is requested via
/// `ConsumerOptions`; observed through the partition context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastEnqueuedEventProperties {
    /// Sequence number of the partition's newest event.
    pub sequence_number: Option<i64>,

    /// Offset of the partition's newest event.
    pub offset: Option<i64>,

    /// Enqueue timestamp of the partition's newest event (ms since epoch).
    pub enqueued_time: Option<i64>,

    /// When this information was observed (ms since epoch).
    pub retrieved_at: Option<i64>,
}
