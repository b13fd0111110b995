//! Pooled per-exchange contexts.
//!
//! - [`SendContext`] holds the encode buffer of one outbound frame.
//! - [`SessionContext`] holds the receive buffer of one connection.
//! - Request contexts are [`FrameParser`](crate::codec::FrameParser)s, which
//!   carry the parser cursor state of one inbound exchange.

use bytes::BytesMut;
use rmpv::Value;

use crate::codec;
use crate::pool::Poolable;
use crate::protocol::{MessageId, MessageType, Result, RpcError};

/// Buffers above this size are released instead of kept for reuse.
const RETAINED_CAPACITY: usize = 64 * 1024;

const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// Encode buffer for one outbound frame.
#[derive(Debug, Default)]
pub struct SendContext {
    buffer: Vec<u8>,
    message_id: Option<MessageId>,
    message_type: Option<MessageType>,
}

impl SendContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode_request(&mut self, id: MessageId, method: &str, params: &[Value]) -> Result<()> {
        self.begin(MessageType::Request, Some(id));
        codec::encode_request_into(&mut self.buffer, id, method, params)
    }

    pub fn encode_notification(&mut self, method: &str, params: &[Value]) -> Result<()> {
        self.begin(MessageType::Notification, None);
        codec::encode_notification_into(&mut self.buffer, method, params)
    }

    pub fn encode_success(&mut self, id: MessageId, result: &Value) -> Result<()> {
        self.begin(MessageType::Response, Some(id));
        codec::encode_response_into(&mut self.buffer, id, &Value::Nil, result)
    }

    /// Encodes an error response; debug detail is only written in debug mode.
    pub fn encode_failure(&mut self, id: MessageId, error: &RpcError, debug_mode: bool) -> Result<()> {
        self.begin(MessageType::Response, Some(id));
        let (error, detail) = error.to_wire(debug_mode);
        codec::encode_response_into(&mut self.buffer, id, &error, &detail)
    }

    fn begin(&mut self, message_type: MessageType, id: Option<MessageId>) {
        self.buffer.clear();
        self.message_type = Some(message_type);
        self.message_id = id;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn message_id(&self) -> Option<MessageId> {
        self.message_id
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.message_type
    }
}

impl Poolable for SendContext {
    fn clear(&mut self) {
        if self.buffer.capacity() > RETAINED_CAPACITY {
            self.buffer = Vec::new();
        } else {
            self.buffer.clear();
        }
        self.message_id = None;
        self.message_type = None;
    }
}

/// Receive-side state of one connection.
///
/// The server manager also uses the pool of session contexts as its
/// connection limit: a listener must borrow one before accepting.
#[derive(Debug)]
pub struct SessionContext {
    pub read_buffer: BytesMut,
}

impl SessionContext {
    pub fn new() -> Self {
        SessionContext {
            read_buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
        }
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Poolable for SessionContext {
    fn clear(&mut self) {
        if self.read_buffer.capacity() > RETAINED_CAPACITY {
            self.read_buffer = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
        } else {
            self.read_buffer.clear();
        }
    }
}
