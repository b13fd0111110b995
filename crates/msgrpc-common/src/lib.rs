//! msgrpc Common Types and Protocol Engine
//!
//! This crate provides the wire protocol and the transport building blocks
//! shared by the msgrpc client and server.
//!
//! # Overview
//!
//! msgrpc is a MessagePack-RPC transport. Frames are MessagePack arrays
//! exchanged over a byte stream; replies are correlated to calls by a 32-bit
//! message id. This crate contains everything that does not own a socket:
//!
//! - **Protocol Layer**: message shapes, message ids and the error taxonomy
//! - **Codec Layer**: the resumable frame parser, encoders and the argument
//!   cursor
//! - **Lifecycle Primitives**: object pools, pooled contexts, completion
//!   handles, shutdown coordination and the timeout watchdog
//!
//! # Architecture
//!
//! - **Transport**: TCP, one session per connection
//! - **Serialization**: MessagePack (`rmp` / `rmpv`)
//! - **Message Format**: `[type, msgid?, method | error, params | result]`,
//!   no additional length prefix
//!
//! # Components
//!
//! - [`protocol`] - message types and errors
//! - [`codec`] - framing
//! - [`pool`] / [`context`] - pooled per-exchange state
//! - [`completion`] - completion handles
//! - [`shutdown`] - two-halved shutdown state
//! - [`watchdog`] - timeout watchdog
//! - [`config`] - transport configuration
//!
//! # Example
//!
//! ```
//! use msgrpc_common::codec::{decode_message, encode_request};
//! use msgrpc_common::{Message, Request};
//! use rmpv::Value;
//!
//! let bytes = encode_request(1, "echo", &[Value::from("hi")]).unwrap();
//! let message = decode_message(&bytes).unwrap();
//! assert_eq!(message, Message::Request(Request::new(1, "echo", vec![Value::from("hi")])));
//! ```

pub mod codec;
pub mod completion;
pub mod config;
pub mod context;
pub mod pool;
pub mod protocol;
pub mod shutdown;
pub mod watchdog;

pub use protocol::*;
