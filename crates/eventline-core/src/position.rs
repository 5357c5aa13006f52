//! Starting positions within a partition's event stream.

use serde::{Deserialize, Serialize};

/// Where a partition reader should begin consuming.
///
/// Positions are value types compared by tag and payload: two
/// `Offset(x)` positions are equal iff their offsets are, and
/// `Earliest != Latest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPosition {
    /// The first event retained by the partition.
    Earliest,

    /// Only events enqueued after the reader is opened.
    Latest,

    /// The event immediately after the given byte offset (exclusive).
    Offset(i64),

    /// Events at or after the given sequence number. When `inclusive` is
    /// false, reading starts at the next sequence number.
    Sequence {
        sequence_number: i64,
        inclusive: bool,
    },

    /// The first event enqueued at or after the given timestamp
    /// (ms since epoch).
    EnqueuedTime(i64),
}

impl EventPosition {
    /// Position just after `offset`; the event at `offset` is not redelivered.
    pub fn from_offset(offset: i64) -> Self {
        EventPosition::Offset(offset)
    }

    /// Position just after `sequence_number`.
    pub fn from_sequence_number(sequence_number: i64) -> Self {
        EventPosition::Sequence {
            sequence_number,
            inclusive: false,
        }
    }

    /// Position at `sequence_number` itself.
    pub fn from_sequence_number_inclusive(sequence_number: i64) -> Self {
        EventPosition::Sequence {
            sequence_number,
            inclusive: true,
        }
    }

    /// Position at the first event enqueued at or after `timestamp_ms`.
    pub fn from_enqueued_time(timestamp_ms: i64) -> Self {
        EventPosition::EnqueuedTime(timestamp_ms)
    }
}

impl Default for EventPosition {
    fn default() -> Self {
        EventPosition::Earliest
    }
}

impl std::fmt::Display for EventPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventPosition::Earliest => write!(f, "earliest"),
            EventPosition::Latest => write!(f, "latest"),
            EventPosition::Offset(offset) => write!(f, "offset:{}", offset),
            EventPosition::Sequence {
                sequence_number,
                inclusive,
            } => write!(f, "sequence:{}(inclusive={})", sequence_number, inclusive),
            EventPosition::EnqueuedTime(ts) => write!(f, "enqueued-time:{}", ts),
        }
    }
}
