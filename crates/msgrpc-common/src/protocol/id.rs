//! Message id generation.

use std::sync::atomic::{AtomicU32, Ordering};

use super::message::MessageId;

static NEXT_MESSAGE_ID: AtomicU32 = AtomicU32::new(1);

/// Returns the next id from the process-wide counter.
///
/// The counter wraps around at `u32::MAX`. Ids only need to be unique among
/// a client's outstanding calls, which the pending table checks.
pub fn next_message_id() -> MessageId {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A wraparound-tolerant id source with its own counter.
///
/// Useful in tests that need deterministic ids.
#[derive(Debug)]
pub struct MessageIdGenerator {
    next: AtomicU32,
}

impl MessageIdGenerator {
    pub fn starting_at(first: MessageId) -> Self {
        MessageIdGenerator {
            next: AtomicU32::new(first),
        }
    }

    pub fn next_id(&self) -> MessageId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::starting_at(1)
    }
}
