//! Resumable partition reader.
//!
//! Wraps a transport consumer and keeps it positioned: every delivered
//! batch advances the reader's position to just past the last event, so
//! when a retryable transport failure forces the link to be reopened the
//! new consumer resumes exactly where the old one stopped and callers
//! observe no gap. Non-retryable errors are surfaced to the caller.

use crate::transport::{
    ConsumerOptions, EventHubTransport, PartitionConsumer, TransportError, TransportResult,
};
use eventline_core::{EventPosition, LastEnqueuedEventProperties, ReceivedEvent, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub(crate) struct PartitionReader {
    transport: Arc<dyn EventHubTransport>,
    consumer_group: String,
    partition_id: String,
    options: ConsumerOptions,
    max_wait: Duration,
    retry: RetryPolicy,

    /// Where the next consumer should start; tracks the last delivered event.
    position: EventPosition,
    consumer: Option<Box<dyn PartitionConsumer>>,
}

impl PartitionReader {
    pub(crate) fn new(
        transport: Arc<dyn EventHubTransport>,
        consumer_group: String,
        partition_id: String,
        starting_position: EventPosition,
        options: ConsumerOptions,
        max_wait: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            consumer_group,
            partition_id,
            options,
            max_wait,
            retry,
            position: starting_position,
            consumer: None,
        }
    }

    /// Read the next batch of events.
    ///
    /// Returns an empty batch when the partition had nothing to deliver
    /// within the configured wait. Retryable transport errors are absorbed
    /// up to the retry budget by backing off and reopening the link at the
    /// current position.
    pub(crate) async fn next_batch(&mut self) -> TransportResult<Vec<ReceivedEvent>> {
        let mut attempt: u32 = 0;

        loop {
            if self.consumer.is_none() {
                match self.open().await {
                    Ok(consumer) => self.consumer = Some(consumer),
                    Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                        let backoff = self.retry.backoff(attempt);
                        debug!(
                            partition_id = %self.partition_id,
                            attempt = attempt + 1,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "consumer open failed, backing off"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            let Some(consumer) = self.consumer.as_mut() else {
                continue;
            };

            match consumer
                .read_events(self.options.prefetch_count as usize, self.max_wait)
                .await
            {
                Ok(events) => {
                    if let Some(offset) = events.last().and_then(|e| e.offset) {
                        self.position = EventPosition::from_offset(offset);
                    }
                    return Ok(events);
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let backoff = self.retry.backoff(attempt);
                    warn!(
                        partition_id = %self.partition_id,
                        position = %self.position,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "read failed, reopening consumer at current position"
                    );
                    self.consumer = None;
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) fn last_enqueued_event_properties(&self) -> Option<LastEnqueuedEventProperties> {
        self.consumer
            .as_ref()
            .and_then(|c| c.last_enqueued_event_properties())
    }

    /// Release the transport link.
    pub(crate) async fn close(&mut self) {
        if let Some(mut consumer) = self.consumer.take() {
            if let Err(e) = consumer.close().await {
                debug!(
                    partition_id = %self.partition_id,
                    error = %e,
                    "consumer close failed"
                );
            }
        }
    }

    async fn open(&self) -> TransportResult<Box<dyn PartitionConsumer>> {
        match tokio::time::timeout(
            self.retry.try_timeout,
            self.transport.open_consumer(
                &self.consumer_group,
                &self.partition_id,
                self.position.clone(),
                self.options.clone(),
            ),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }
}
