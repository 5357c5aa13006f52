//! Handler registration slots.
//!
//! The processor surface is a record of four optional async function values
//! set while the processor is idle: the event and error handlers are
//! mandatory before start, the partition lifecycle handlers optional. Each
//! slot holds at most one subscriber; setting an occupied slot is an error.

use crate::context::{CloseReason, PartitionContext};
use crate::error::{ErrorOperation, HandlerError, ProcessorError, Result};
use eventline_core::{EventPosition, ReceivedEvent};
use futures::future::BoxFuture;
use std::sync::Arc;

pub(crate) type EventHandlerFn = Arc<
    dyn Fn(PartitionContext, ReceivedEvent) -> BoxFuture<'static, std::result::Result<(), HandlerError>>
        + Send
        + Sync,
>;

pub(crate) type ErrorHandlerFn = Arc<
    dyn Fn(Option<PartitionContext>, ErrorOperation, ProcessorError) -> BoxFuture<'static, ()>
        + Send
        + Sync,
>;

pub(crate) type InitHandlerFn =
    Arc<dyn Fn(PartitionContext, EventPosition) -> BoxFuture<'static, EventPosition> + Send + Sync>;

pub(crate) type CloseHandlerFn =
    Arc<dyn Fn(PartitionContext, CloseReason) -> BoxFuture<'static, ()> + Send + Sync>;

/// Mutable registration state, guarded by the processor's handler mutex.
#[derive(Default)]
pub(crate) struct HandlerSet {
    pub(crate) on_event: Option<EventHandlerFn>,
    pub(crate) on_error: Option<ErrorHandlerFn>,
    pub(crate) on_initialize: Option<InitHandlerFn>,
    pub(crate) on_close: Option<CloseHandlerFn>,
}

impl HandlerSet {
    /// Snapshot the registered handlers for a processor run, enforcing the
    /// mandatory event and error handlers.
    pub(crate) fn activate(&self) -> Result<Arc<ActiveHandlers>> {
        let on_event = self
            .on_event
            .clone()
            .ok_or(ProcessorError::MissingHandler("event"))?;
        let on_error = self
            .on_error
            .clone()
            .ok_or(ProcessorError::MissingHandler("error"))?;

        Ok(Arc::new(ActiveHandlers {
            on_event,
            on_error,
            on_initialize: self.on_initialize.clone(),
            on_close: self.on_close.clone(),
        }))
    }
}

/// Immutable handler snapshot shared by the load balancer and the pumps.
pub(crate) struct ActiveHandlers {
    pub(crate) on_event: EventHandlerFn,
    pub(crate) on_error: ErrorHandlerFn,
    pub(crate) on_initialize: Option<InitHandlerFn>,
    pub(crate) on_close: Option<CloseHandlerFn>,
}

impl ActiveHandlers {
    /// Deliver an error to the error handler, fire-and-forget. Panics inside
    /// the handler stay inside the spawned task.
    pub(crate) fn notify_error(
        &self,
        context: Option<PartitionContext>,
        operation: ErrorOperation,
        error: ProcessorError,
    ) {
        let on_error = self.on_error.clone();
        tokio::spawn(async move {
            on_error(context, operation, error).await;
        });
    }
}
