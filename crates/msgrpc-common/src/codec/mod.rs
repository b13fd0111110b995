//! MessagePack-RPC framing.
//!
//! # Components
//!
//! - [`scan`] - allocation-free measurement of MessagePack values
//! - [`parser`] - the resumable per-session frame parser
//! - [`arguments`] - the cursor handed to dispatchers
//! - [`encode`] - frame encoders and one-shot decoding
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use msgrpc_common::codec::{FrameParser, InboundFrame, ParserLimits, ParserRole};
//!
//! // [0, 1, "sum", [1, 2]]
//! let frame = [0x94, 0x00, 0x01, 0xa3, b's', b'u', b'm', 0x92, 0x01, 0x02];
//! let mut parser = FrameParser::new(ParserRole::Server, ParserLimits::default());
//! let mut buf = BytesMut::new();
//!
//! buf.extend_from_slice(&frame[..6]);
//! assert!(parser.parse(&mut buf).unwrap().is_none());
//!
//! buf.extend_from_slice(&frame[6..]);
//! match parser.parse(&mut buf).unwrap() {
//!     Some(InboundFrame::Request { id, method, args }) => {
//!         assert_eq!(id, 1);
//!         assert_eq!(method, "sum");
//!         assert_eq!(args.len(), 2);
//!     }
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

pub mod arguments;
pub mod encode;
mod error;
pub mod parser;
pub mod scan;

pub use arguments::Arguments;
pub use encode::{
    decode_message, encode_message, encode_notification, encode_notification_into,
    encode_request, encode_request_args_into, encode_request_into, encode_response,
    encode_response_into,
};
pub use error::FrameError;
pub use parser::{FrameParser, InboundFrame, ParseStage, ParserLimits, ParserRole};
