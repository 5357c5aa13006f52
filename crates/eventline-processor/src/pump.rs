//! Partition pump.
//!
//! One pump runs per owned partition, on its own task. It resolves the
//! partition's starting position (initializing handler first, then any
//! existing checkpoint, which wins), drives a [`PartitionReader`], and
//! invokes the event handler once per event in storage order.
//!
//! Failure containment: an error from the event handler or a permanent
//! reader error terminates only this pump; the load balancer observes the
//! finished task on its next cycle and starts a replacement, which resumes
//! from the last checkpoint. Events delivered after that checkpoint but
//! before the failure are delivered again (at-least-once).
//!
//! Cancellation is advisory: a stop request is observed between handler
//! invocations, so in-flight work drains before the reader is released.

use crate::context::{CloseReason, PartitionContext};
use crate::error::{ErrorOperation, ProcessorError};
use crate::handlers::ActiveHandlers;
use crate::processor::ProcessorOptions;
use crate::reader::PartitionReader;
use crate::transport::{ConsumerOptions, EventHubTransport};
use eventline_core::{retry_with_backoff, EventPosition, ReceivedEvent};
use eventline_store::{Checkpoint, CheckpointStore, StoreError};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Owner-side handle to a running pump.
pub(crate) struct PumpHandle {
    shutdown: watch::Sender<Option<CloseReason>>,
    task: JoinHandle<()>,
}

impl PumpHandle {
    /// Whether the pump task has completed (finished or crashed).
    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the pump to stop with `reason` and wait for it to drain.
    pub(crate) async fn stop(self, reason: CloseReason) {
        let _ = self.shutdown.send(Some(reason));
        if let Err(e) = self.task.await {
            if e.is_panic() {
                warn!(error = %e, "partition pump panicked");
            }
        }
    }
}

pub(crate) struct PartitionPump {
    context: PartitionContext,
    store: Arc<dyn CheckpointStore>,
    transport: Arc<dyn EventHubTransport>,
    handlers: Arc<ActiveHandlers>,
    options: ProcessorOptions,
    shutdown: watch::Receiver<Option<CloseReason>>,
}

impl PartitionPump {
    /// Launch a pump for `context`'s partition on its own task.
    pub(crate) fn spawn(
        context: PartitionContext,
        store: Arc<dyn CheckpointStore>,
        transport: Arc<dyn EventHubTransport>,
        handlers: Arc<ActiveHandlers>,
        options: ProcessorOptions,
    ) -> PumpHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        let pump = PartitionPump {
            context,
            store,
            transport,
            handlers,
            options,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(pump.run());
        PumpHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(mut self) {
        info!(partition_id = %self.context.partition_id(), "partition pump started");

        let reason = self.process().await;

        if let Some(on_close) = &self.handlers.on_close {
            on_close(self.context.clone(), reason).await;
        }

        info!(
            partition_id = %self.context.partition_id(),
            reason = %reason,
            "partition pump stopped"
        );
    }

    async fn process(&mut self) -> CloseReason {
        // The initializing handler sees Earliest and may substitute its own
        // default; an existing checkpoint overrides both.
        let mut position = EventPosition::Earliest;
        if let Some(on_initialize) = &self.handlers.on_initialize {
            position = on_initialize(self.context.clone(), position).await;
        }

        match self.starting_checkpoint().await {
            Ok(Some(checkpoint)) => {
                debug!(
                    partition_id = %self.context.partition_id(),
                    offset = checkpoint.offset,
                    sequence_number = checkpoint.sequence_number,
                    "resuming from checkpoint"
                );
                position = EventPosition::from_offset(checkpoint.offset);
            }
            Ok(None) => {}
            Err(e) => {
                self.handlers.notify_error(
                    Some(self.context.clone()),
                    ErrorOperation::ListCheckpoints,
                    e.into(),
                );
                return CloseReason::ProcessingError;
            }
        }

        let consumer_options = ConsumerOptions {
            prefetch_count: self.options.prefetch_count,
            track_last_enqueued_event_properties: self.options.track_last_enqueued_event_properties,
        };
        let mut reader = PartitionReader::new(
            Arc::clone(&self.transport),
            self.context.consumer_group().to_string(),
            self.context.partition_id().to_string(),
            position,
            consumer_options,
            self.options.maximum_wait_time,
            self.options.retry.clone(),
        );

        let reason = loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    break match changed {
                        Ok(()) => (*self.shutdown.borrow()).unwrap_or(CloseReason::Shutdown),
                        Err(_) => CloseReason::Shutdown,
                    };
                }
                batch = reader.next_batch() => match batch {
                    Ok(events) => {
                        if self.options.track_last_enqueued_event_properties {
                            self.context
                                .set_last_enqueued(reader.last_enqueued_event_properties())
                                .await;
                        }
                        if let Some(reason) = self.dispatch(events).await {
                            break reason;
                        }
                    }
                    Err(e) => {
                        self.handlers.notify_error(
                            Some(self.context.clone()),
                            ErrorOperation::ReadEvents,
                            e.into(),
                        );
                        break CloseReason::ProcessingError;
                    }
                }
            }
        };

        reader.close().await;
        reason
    }

    /// Deliver a batch to the event handler, one event at a time, in order.
    /// Returns the close reason if the pump must stop.
    async fn dispatch(&mut self, events: Vec<ReceivedEvent>) -> Option<CloseReason> {
        for event in events {
            if let Err(error) = (self.handlers.on_event)(self.context.clone(), event).await {
                warn!(
                    partition_id = %self.context.partition_id(),
                    error = %error,
                    "event handler failed, stopping pump"
                );
                self.handlers.notify_error(
                    Some(self.context.clone()),
                    ErrorOperation::ReadEvents,
                    ProcessorError::Processing(error),
                );
                return Some(CloseReason::ProcessingError);
            }

            // Drain point: stop requests take effect between invocations.
            if let Some(reason) = *self.shutdown.borrow() {
                return Some(reason);
            }
        }
        None
    }

    /// This partition's checkpoint, if one has been persisted.
    async fn starting_checkpoint(&self) -> Result<Option<Checkpoint>, StoreError> {
        let store = Arc::clone(&self.store);
        let namespace = self.context.fully_qualified_namespace().to_string();
        let event_hub = self.context.event_hub_name().to_string();
        let group = self.context.consumer_group().to_string();
        let try_timeout = self.options.retry.try_timeout;

        let checkpoints =
            retry_with_backoff(&self.options.retry, StoreError::is_transient, || {
                let store = Arc::clone(&store);
                let namespace = namespace.clone();
                let event_hub = event_hub.clone();
                let group = group.clone();
                async move {
                    match tokio::time::timeout(
                        try_timeout,
                        store.list_checkpoints(&namespace, &event_hub, &group),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(StoreError::Timeout),
                    }
                }
            })
            .await?;

        Ok(checkpoints
            .into_iter()
            .find(|c| c.partition_id == self.context.partition_id()))
    }
}
