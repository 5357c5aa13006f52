//! In-process event hub.
//!
//! A complete [`EventHubTransport`] backed by per-partition in-memory logs.
//! Events appended with [`InMemoryHub::send`] are stamped with an offset,
//! sequence number, and enqueue time the way a broker would stamp them, and
//! consumers opened at any [`EventPosition`] observe them in order. Used by
//! the test suites and the examples; also usable as a single-process bus.

use crate::transport::{
    ConsumerOptions, EventHubTransport, PartitionConsumer, TransportError, TransportResult,
};
use crate::now_ms;
use async_trait::async_trait;
use bytes::Bytes;
use eventline_core::{EventPosition, LastEnqueuedEventProperties, ReceivedEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Wire overhead added to each event's body when advancing offsets.
const EVENT_HEADER_SIZE: i64 = 64;

/// How often a waiting consumer re-checks its partition log.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct PartitionLog {
    events: Vec<ReceivedEvent>,
    next_offset: i64,
}

/// An in-memory, partitioned event hub.
pub struct InMemoryHub {
    partition_ids: Vec<String>,
    logs: HashMap<String, Arc<RwLock<PartitionLog>>>,
}

impl InMemoryHub {
    /// Create a hub with partitions `"0"` through `"partition_count - 1"`.
    pub fn new(partition_count: usize) -> Self {
        let partition_ids: Vec<String> = (0..partition_count).map(|p| p.to_string()).collect();
        let logs = partition_ids
            .iter()
            .map(|id| (id.clone(), Arc::new(RwLock::new(PartitionLog::default()))))
            .collect();
        Self {
            partition_ids,
            logs,
        }
    }

    /// Append an event body to a partition, returning the stamped event.
    pub async fn send(
        &self,
        partition_id: &str,
        body: impl Into<Bytes>,
    ) -> TransportResult<ReceivedEvent> {
        let log = self
            .logs
            .get(partition_id)
            .ok_or_else(|| TransportError::NotFound(format!("partition {}", partition_id)))?;

        let mut log = log.write().await;
        let sequence_number = log.events.len() as i64;
        let event = ReceivedEvent::new(body.into(), log.next_offset, sequence_number, now_ms());
        log.next_offset += event.body.len() as i64 + EVENT_HEADER_SIZE;
        log.events.push(event.clone());
        Ok(event)
    }

    /// Append a batch of event bodies to a partition.
    pub async fn send_batch(
        &self,
        partition_id: &str,
        bodies: impl IntoIterator<Item = impl Into<Bytes>>,
    ) -> TransportResult<()> {
        for body in bodies {
            self.send(partition_id, body).await?;
        }
        Ok(())
    }

    /// Number of events ever appended to a partition.
    pub async fn partition_length(&self, partition_id: &str) -> TransportResult<usize> {
        let log = self
            .logs
            .get(partition_id)
            .ok_or_else(|| TransportError::NotFound(format!("partition {}", partition_id)))?;
        Ok(log.read().await.events.len())
    }
}

#[async_trait]
impl EventHubTransport for InMemoryHub {
    async fn partition_ids(&self) -> TransportResult<Vec<String>> {
        Ok(self.partition_ids.clone())
    }

    async fn open_consumer(
        &self,
        _consumer_group: &str,
        partition_id: &str,
        position: EventPosition,
        options: ConsumerOptions,
    ) -> TransportResult<Box<dyn PartitionConsumer>> {
        let log = self
            .logs
            .get(partition_id)
            .ok_or_else(|| TransportError::NotFound(format!("partition {}", partition_id)))?
            .clone();

        let cursor = {
            let log = log.read().await;
            resolve_position(&log.events, &position)
        };

        Ok(Box::new(MemoryConsumer {
            log,
            cursor,
            track_last_enqueued: options.track_last_enqueued_event_properties,
            last_enqueued: None,
            closed: false,
        }))
    }
}

/// Index of the first event at or after `position`.
fn resolve_position(events: &[ReceivedEvent], position: &EventPosition) -> usize {
    match position {
        EventPosition::Earliest => 0,
        EventPosition::Latest => events.len(),
        EventPosition::Offset(offset) => events
            .iter()
            .position(|e| e.offset.unwrap_or(i64::MIN) > *offset)
            .unwrap_or(events.len()),
        EventPosition::Sequence {
            sequence_number,
            inclusive,
        } => events
            .iter()
            .position(|e| {
                let seq = e.sequence_number.unwrap_or(i64::MIN);
                if *inclusive {
                    seq >= *sequence_number
                } else {
                    seq > *sequence_number
                }
            })
            .unwrap_or(events.len()),
        EventPosition::EnqueuedTime(timestamp) => events
            .iter()
            .position(|e| e.enqueued_time >= *timestamp)
            .unwrap_or(events.len()),
    }
}

struct MemoryConsumer {
    log: Arc<RwLock<PartitionLog>>,
    cursor: usize,
    track_last_enqueued: bool,
    last_enqueued: Option<LastEnqueuedEventProperties>,
    closed: bool,
}

/// Snapshot of a partition's newest event for tail tracking.
fn tail_properties(events: &[ReceivedEvent]) -> LastEnqueuedEventProperties {
    let tail = events.last();
    LastEnqueuedEventProperties {
        sequence_number: tail.and_then(|e| e.sequence_number),
        offset: tail.and_then(|e| e.offset),
        enqueued_time: tail.map(|e| e.enqueued_time),
        retrieved_at: Some(now_ms()),
    }
}

#[async_trait]
impl PartitionConsumer for MemoryConsumer {
    async fn read_events(
        &mut self,
        max_batch: usize,
        max_wait: Duration,
    ) -> TransportResult<Vec<ReceivedEvent>> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        let deadline = Instant::now() + max_wait;
        loop {
            {
                let log = self.log.read().await;
                if self.track_last_enqueued {
                    self.last_enqueued = Some(tail_properties(&log.events));
                }
                if self.cursor < log.events.len() {
                    let end = (self.cursor + max_batch.max(1)).min(log.events.len());
                    let batch = log.events[self.cursor..end].to_vec();
                    self.cursor = end;
                    return Ok(batch);
                }
            }

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn last_enqueued_event_properties(&self) -> Option<LastEnqueuedEventProperties> {
        self.last_enqueued.clone()
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.closed = true;
        Ok(())
    }
}
