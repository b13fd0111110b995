//! Protocol definitions for msgrpc.
//!
//! - [`message`] - the three MessagePack-RPC frame shapes
//! - [`error`] - wire error identifiers and the crate error type
//! - [`id`] - message id generation

pub mod error;
pub mod id;
pub mod message;

pub use error::{ErrorCategory, MsgRpcError, Result, RpcError, RpcErrorKind};
pub use id::{next_message_id, MessageIdGenerator};
pub use message::{Message, MessageId, MessageType, Notification, Request, Response};
