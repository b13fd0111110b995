//! MessagePack-RPC Message Types
//!
//! This module defines the three wire shapes exchanged by MessagePack-RPC
//! peers. Every frame is a top-level fixed-size array whose first element is
//! the [`MessageType`] discriminator:
//!
//! ```text
//! Request      [0, msgid: u32, method: str, params: array]
//! Response     [1, msgid: u32, error: nil | any, result: any]
//! Notification [2, method: str, params: array]
//! ```

use std::fmt;

use rmpv::Value;

use super::error::RpcError;

/// 32-bit correlation token linking a request to its response.
pub type MessageId = u32;

/// Wire discriminator stored in field 0 of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    Response = 1,
    Notification = 2,
}

impl MessageType {
    /// Maps a wire code to a message type.
    ///
    /// # Returns
    ///
    /// `None` for any code outside `{0, 1, 2}`.
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(MessageType::Request),
            1 => Some(MessageType::Response),
            2 => Some(MessageType::Notification),
            _ => None,
        }
    }

    /// The wire code of this message type.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Number of elements in the top-level array for this message type.
    pub fn field_count(self) -> u32 {
        match self {
            MessageType::Request | MessageType::Response => 4,
            MessageType::Notification => 3,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Notification => "notification",
        };
        f.write_str(name)
    }
}

/// A call expecting a correlated [`Response`].
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: MessageId,
    pub method: String,
    pub params: Vec<Value>,
}

impl Request {
    pub fn new(id: MessageId, method: impl Into<String>, params: Vec<Value>) -> Self {
        Request {
            id,
            method: method.into(),
            params,
        }
    }
}

/// The reply to a [`Request`].
///
/// The fields are kept exactly as they appear on the wire so a decoded
/// response re-encodes to the same bytes. Use [`Response::into_result`] to
/// interpret them.
///
/// # Example
///
/// ```
/// use msgrpc_common::protocol::{Response, RpcError};
/// use rmpv::Value;
///
/// let ok = Response::success(1, Value::from("hi"));
/// assert_eq!(ok.clone().into_result().unwrap(), Value::from("hi"));
///
/// let failed = Response::failure(7, &RpcError::call_error("boom"), false);
/// assert!(failed.is_error());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: MessageId,
    pub error: Value,
    pub result: Value,
}

impl Response {
    /// Creates a successful response carrying `result`.
    pub fn success(id: MessageId, result: Value) -> Self {
        Response {
            id,
            error: Value::Nil,
            result,
        }
    }

    /// Creates an error response.
    ///
    /// The error field carries the stable identifier and the result field
    /// carries the detail map. Debug information is only included when
    /// `debug_mode` is set.
    pub fn failure(id: MessageId, error: &RpcError, debug_mode: bool) -> Self {
        let (error, result) = error.to_wire(debug_mode);
        Response { id, error, result }
    }

    /// Whether the error field is set.
    pub fn is_error(&self) -> bool {
        !self.error.is_nil()
    }

    /// Interprets the response, translating a non-nil error field into an
    /// [`RpcError`].
    pub fn into_result(self) -> Result<Value, RpcError> {
        if self.error.is_nil() {
            Ok(self.result)
        } else {
            Err(RpcError::from_wire(self.error, self.result))
        }
    }
}

/// A one-way call; no response is ever produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Vec<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Notification {
            method: method.into(),
            params,
        }
    }
}

/// Any complete frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Request(_) => MessageType::Request,
            Message::Response(_) => MessageType::Response,
            Message::Notification(_) => MessageType::Notification,
        }
    }

    /// The correlation id, absent for notifications.
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::Request(r) => Some(r.id),
            Message::Response(r) => Some(r.id),
            Message::Notification(_) => None,
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

impl From<Notification> for Message {
    fn from(notification: Notification) -> Self {
        Message::Notification(notification)
    }
}
