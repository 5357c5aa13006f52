//! Event processor façade.
//!
//! [`EventProcessor`] is the object applications hold: it owns the
//! load-balancer loop, the handler registration surface, and the
//! start/stop lifecycle.
//!
//! ## Lifecycle
//!
//! `Idle → Running → Idle`. `start` is a no-op when already running and
//! `stop` is a no-op when already idle; starting while a stop is still in
//! progress is a configuration error. Handlers can only be changed while
//! idle, and the event and error handlers must both be registered before
//! the first start.
//!
//! Stopping cancels the load-balancer loop, waits for it, then stops every
//! pump in parallel with reason `Shutdown`. Leases are not surrendered;
//! they expire, so peers recover the partitions even if a stop is
//! abandoned halfway. Cancelling the stop itself (dropping its future)
//! returns the processor to running.
//!
//! ## Example
//!
//! ```rust,no_run
//! use eventline_processor::{EventProcessor, InMemoryHub};
//! use eventline_store::InMemoryCheckpointStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> eventline_processor::Result<()> {
//! let hub = Arc::new(InMemoryHub::new(4));
//! let store = Arc::new(InMemoryCheckpointStore::new());
//!
//! let processor = EventProcessor::builder()
//!     .fully_qualified_namespace("memory")
//!     .event_hub_name("telemetry")
//!     .consumer_group("$default")
//!     .transport(hub)
//!     .checkpoint_store(store)
//!     .build()?;
//!
//! processor.set_event_handler(|context, event| async move {
//!     context.update_checkpoint(&event).await?;
//!     Ok(())
//! })?;
//! processor.set_error_handler(|_context, operation, error| async move {
//!     eprintln!("{operation} failed: {error}");
//! })?;
//!
//! processor.start().await?;
//! // ... run ...
//! processor.stop().await?;
//! # Ok(())
//! # }
//! ```

use crate::balancer::{ActivePumps, LoadBalancer};
use crate::context::{CloseReason, PartitionContext};
use crate::error::{ErrorOperation, HandlerError, ProcessorError, Result};
use crate::handlers::HandlerSet;
use crate::pump::PumpHandle;
use crate::transport::EventHubTransport;
use eventline_core::{EventPosition, ReceivedEvent, RetryPolicy};
use eventline_store::CheckpointStore;
use futures::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Identity recorded in ownership records. Random when `None`.
    pub identifier: Option<String>,

    /// Cadence of the load-balancer loop.
    pub load_balance_interval: Duration,

    /// How long an unrenewed lease stays active. Clamped to at least twice
    /// `load_balance_interval` at start, so a single missed cycle does not
    /// drop leases.
    pub ownership_expiration: Duration,

    /// Longest a read waits for events before returning an empty batch.
    pub maximum_wait_time: Duration,

    /// How many events a partition consumer buffers ahead of reads.
    pub prefetch_count: u32,

    /// Ask the transport to track partition-tail metadata, exposed through
    /// [`PartitionContext::last_enqueued_event_properties`].
    pub track_last_enqueued_event_properties: bool,

    /// Retry policy for store and transport calls.
    pub retry: RetryPolicy,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            identifier: None,
            load_balance_interval: Duration::from_secs(10),
            ownership_expiration: Duration::from_secs(30),
            maximum_wait_time: Duration::from_secs(10),
            prefetch_count: 300,
            track_last_enqueued_event_properties: false,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessorState {
    Idle,
    Running,
    Stopping,
}

struct RuntimeHandles {
    shutdown: watch::Sender<bool>,
    loop_task: Option<JoinHandle<()>>,
    pumps: ActivePumps,
}

/// Cancellation guard for an in-flight `stop()`.
///
/// The caller cancels a stop by dropping its future. Unless teardown ran to
/// completion, this guard puts the remaining runtime handles back and
/// returns the lifecycle state to `Running`, so a cancelled stop never
/// strands the processor in `Stopping`.
struct StopTeardown<'a> {
    processor: &'a EventProcessor,
    runtime: Option<RuntimeHandles>,
    completed: bool,
}

impl Drop for StopTeardown<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if let Some(runtime) = self.runtime.take() {
            *self
                .processor
                .runtime
                .lock()
                .expect("runtime lock poisoned") = Some(runtime);
        }
        *self.processor.state.lock().expect("state lock poisoned") = ProcessorState::Running;
        warn!(
            identifier = %self.processor.identifier,
            "stop was cancelled, processor returns to running"
        );
    }
}

/// A cooperative, durable event-stream processor instance.
pub struct EventProcessor {
    fully_qualified_namespace: String,
    event_hub_name: String,
    consumer_group: String,
    identifier: String,
    options: ProcessorOptions,
    store: Arc<dyn CheckpointStore>,
    transport: Arc<dyn EventHubTransport>,

    handlers: Mutex<HandlerSet>,
    state: Mutex<ProcessorState>,
    runtime: Mutex<Option<RuntimeHandles>>,
}

impl EventProcessor {
    /// Create a builder.
    pub fn builder() -> EventProcessorBuilder {
        EventProcessorBuilder::new()
    }

    pub fn fully_qualified_namespace(&self) -> &str {
        &self.fully_qualified_namespace
    }

    pub fn event_hub_name(&self) -> &str {
        &self.event_hub_name
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    /// This instance's identity in the checkpoint store.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock().expect("state lock poisoned") == ProcessorState::Running
    }

    /// Register the mandatory event handler.
    ///
    /// Invoked once per event, in storage order within each partition. The
    /// context carries the checkpoint capability; returning an error stops
    /// the partition's pump until the next load-balancer cycle restarts it
    /// from the last checkpoint.
    pub fn set_event_handler<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(PartitionContext, ReceivedEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.with_handlers(|handlers| {
            if handlers.on_event.is_some() {
                return Err(ProcessorError::DuplicateHandler("event"));
            }
            handlers.on_event = Some(Arc::new(move |ctx, event| Box::pin(handler(ctx, event))));
            Ok(())
        })
    }

    /// Register the mandatory error handler.
    ///
    /// Invoked fire-and-forget whenever a store, transport, or event-handler
    /// failure surfaces; the partition context is present when the error is
    /// scoped to one partition.
    pub fn set_error_handler<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(Option<PartitionContext>, ErrorOperation, ProcessorError) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.with_handlers(|handlers| {
            if handlers.on_error.is_some() {
                return Err(ProcessorError::DuplicateHandler("error"));
            }
            handlers.on_error = Some(Arc::new(move |ctx, operation, error| {
                Box::pin(handler(ctx, operation, error))
            }));
            Ok(())
        })
    }

    /// Register the optional partition-initializing handler.
    ///
    /// Receives the default starting position (`Earliest`) and returns the
    /// position to use for partitions with no checkpoint; an existing
    /// checkpoint always wins.
    pub fn set_partition_initializing_handler<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(PartitionContext, EventPosition) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EventPosition> + Send + 'static,
    {
        self.with_handlers(|handlers| {
            if handlers.on_initialize.is_some() {
                return Err(ProcessorError::DuplicateHandler("partition initializing"));
            }
            handlers.on_initialize =
                Some(Arc::new(move |ctx, position| Box::pin(handler(ctx, position))));
            Ok(())
        })
    }

    /// Register the optional partition-closing handler, invoked exactly once
    /// after a pump's last event with the reason it stopped.
    pub fn set_partition_closing_handler<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(PartitionContext, CloseReason) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.with_handlers(|handlers| {
            if handlers.on_close.is_some() {
                return Err(ProcessorError::DuplicateHandler("partition closing"));
            }
            handlers.on_close = Some(Arc::new(move |ctx, reason| Box::pin(handler(ctx, reason))));
            Ok(())
        })
    }

    pub fn clear_event_handler(&self) -> Result<()> {
        self.with_handlers(|handlers| {
            handlers.on_event = None;
            Ok(())
        })
    }

    pub fn clear_error_handler(&self) -> Result<()> {
        self.with_handlers(|handlers| {
            handlers.on_error = None;
            Ok(())
        })
    }

    pub fn clear_partition_initializing_handler(&self) -> Result<()> {
        self.with_handlers(|handlers| {
            handlers.on_initialize = None;
            Ok(())
        })
    }

    pub fn clear_partition_closing_handler(&self) -> Result<()> {
        self.with_handlers(|handlers| {
            handlers.on_close = None;
            Ok(())
        })
    }

    /// Start processing. No-op when already running.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().expect("state lock poisoned");
        match *state {
            ProcessorState::Running => return Ok(()),
            ProcessorState::Stopping => {
                return Err(ProcessorError::Config(
                    "cannot start while a stop is in progress".into(),
                ))
            }
            ProcessorState::Idle => {}
        }

        let handlers = self
            .handlers
            .lock()
            .expect("handler lock poisoned")
            .activate()?;

        let mut options = self.options.clone();
        let expiration_floor = options.load_balance_interval * 2;
        if options.ownership_expiration < expiration_floor {
            warn!(
                configured_ms = options.ownership_expiration.as_millis() as u64,
                clamped_ms = expiration_floor.as_millis() as u64,
                "ownership expiration is shorter than twice the load balance interval, clamping"
            );
            options.ownership_expiration = expiration_floor;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pumps: ActivePumps = Arc::new(RwLock::new(HashMap::new()));
        let balancer = LoadBalancer::new(
            self.fully_qualified_namespace.clone(),
            self.event_hub_name.clone(),
            self.consumer_group.clone(),
            self.identifier.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.transport),
            handlers,
            options,
            Arc::clone(&pumps),
            shutdown_rx,
        );
        let loop_task = tokio::spawn(balancer.run());

        *self.runtime.lock().expect("runtime lock poisoned") = Some(RuntimeHandles {
            shutdown: shutdown_tx,
            loop_task: Some(loop_task),
            pumps,
        });
        *state = ProcessorState::Running;

        info!(
            identifier = %self.identifier,
            event_hub = %self.event_hub_name,
            consumer_group = %self.consumer_group,
            "event processor started"
        );
        Ok(())
    }

    /// Stop processing. No-op when already idle.
    ///
    /// Cancels the load-balancer loop, waits for it, then stops every pump
    /// in parallel with reason [`CloseReason::Shutdown`]. Held leases are
    /// left to expire rather than surrendered, so peers can recover the
    /// partitions even if a stop is abandoned partway.
    ///
    /// Cancelling this call (dropping its future) mid-teardown returns the
    /// processor to running; a later stop completes the teardown.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            match *state {
                ProcessorState::Idle | ProcessorState::Stopping => return Ok(()),
                ProcessorState::Running => *state = ProcessorState::Stopping,
            }
        }

        let mut teardown = StopTeardown {
            processor: self,
            runtime: self.runtime.lock().expect("runtime lock poisoned").take(),
            completed: false,
        };

        if let Some(runtime) = teardown.runtime.as_mut() {
            let _ = runtime.shutdown.send(true);
            if let Some(loop_task) = runtime.loop_task.take() {
                if let Err(e) = loop_task.await {
                    if e.is_panic() {
                        warn!(error = %e, "load balancer task panicked");
                    }
                }
            }

            let handles: Vec<PumpHandle> = runtime
                .pumps
                .write()
                .await
                .drain()
                .map(|(_, handle)| handle)
                .collect();
            join_all(
                handles
                    .into_iter()
                    .map(|handle| handle.stop(CloseReason::Shutdown)),
            )
            .await;
        }

        teardown.completed = true;
        drop(teardown);

        *self.state.lock().expect("state lock poisoned") = ProcessorState::Idle;
        info!(identifier = %self.identifier, "event processor stopped");
        Ok(())
    }

    /// Run `mutate` against the handler slots, enforcing the idle-only rule.
    fn with_handlers<R>(&self, mutate: impl FnOnce(&mut HandlerSet) -> Result<R>) -> Result<R> {
        let state = self.state.lock().expect("state lock poisoned");
        if *state != ProcessorState::Idle {
            return Err(ProcessorError::Config(
                "handlers can only be changed while the processor is stopped".into(),
            ));
        }
        let mut handlers = self.handlers.lock().expect("handler lock poisoned");
        mutate(&mut handlers)
    }
}

/// Builder for [`EventProcessor`].
pub struct EventProcessorBuilder {
    fully_qualified_namespace: String,
    event_hub_name: String,
    consumer_group: String,
    store: Option<Arc<dyn CheckpointStore>>,
    transport: Option<Arc<dyn EventHubTransport>>,
    options: ProcessorOptions,
}

impl EventProcessorBuilder {
    pub fn new() -> Self {
        Self {
            fully_qualified_namespace: String::new(),
            event_hub_name: String::new(),
            consumer_group: String::new(),
            store: None,
            transport: None,
            options: ProcessorOptions::default(),
        }
    }

    pub fn fully_qualified_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.fully_qualified_namespace = namespace.into();
        self
    }

    pub fn event_hub_name(mut self, event_hub_name: impl Into<String>) -> Self {
        self.event_hub_name = event_hub_name.into();
        self
    }

    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = consumer_group.into();
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn EventHubTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replace the whole options block.
    pub fn options(mut self, options: ProcessorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.options.identifier = Some(identifier.into());
        self
    }

    pub fn load_balance_interval(mut self, interval: Duration) -> Self {
        self.options.load_balance_interval = interval;
        self
    }

    pub fn ownership_expiration(mut self, expiration: Duration) -> Self {
        self.options.ownership_expiration = expiration;
        self
    }

    pub fn maximum_wait_time(mut self, wait: Duration) -> Self {
        self.options.maximum_wait_time = wait;
        self
    }

    pub fn prefetch_count(mut self, prefetch_count: u32) -> Self {
        self.options.prefetch_count = prefetch_count;
        self
    }

    pub fn track_last_enqueued_event_properties(mut self, track: bool) -> Self {
        self.options.track_last_enqueued_event_properties = track;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.options.retry = retry;
        self
    }

    /// Build the processor.
    pub fn build(self) -> Result<EventProcessor> {
        if self.fully_qualified_namespace.is_empty() {
            return Err(ProcessorError::Config(
                "fully qualified namespace is required".into(),
            ));
        }
        if self.event_hub_name.is_empty() {
            return Err(ProcessorError::Config("event hub name is required".into()));
        }
        if self.consumer_group.is_empty() {
            return Err(ProcessorError::Config("consumer group is required".into()));
        }
        let store = self
            .store
            .ok_or_else(|| ProcessorError::Config("checkpoint store is required".into()))?;
        let transport = self
            .transport
            .ok_or_else(|| ProcessorError::Config("transport is required".into()))?;

        let identifier = self
            .options
            .identifier
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(EventProcessor {
            fully_qualified_namespace: self.fully_qualified_namespace,
            event_hub_name: self.event_hub_name,
            consumer_group: self.consumer_group,
            identifier,
            options: self.options,
            store,
            transport,
            handlers: Mutex::new(HandlerSet::default()),
            state: Mutex::new(ProcessorState::Idle),
            runtime: Mutex::new(None),
        })
    }
}

impl Default for EventProcessorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
