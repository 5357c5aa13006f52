//! Eventline Core Types
//!
//! This crate holds the types shared by every Eventline crate:
//!
//! - [`ReceivedEvent`]: a single event read from a partition
//! - [`EventPosition`]: a starting position within a partition's stream
//! - [`RetryPolicy`]: backoff configuration used for store and transport calls
//!
//! Everything here is plain data; the processing machinery lives in
//! `eventline-processor` and the durable store in `eventline-store`.

pub mod event;
pub mod position;
pub mod retry;

pub use event::{LastEnqueuedEventProperties, ReceivedEvent};
pub use position::EventPosition;
pub use retry::{retry_with_backoff, RetryMode, RetryPolicy};
