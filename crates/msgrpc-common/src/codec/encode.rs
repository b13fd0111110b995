//! Frame encoders.
//!
//! Encoders append to a caller-owned `Vec<u8>` so pooled send contexts can
//! reuse their buffers across exchanges. The `encode_*` convenience forms
//! allocate a fresh buffer.

use std::fmt::Display;

use bytes::BytesMut;
use rmpv::Value;

use super::{Arguments, FrameError, FrameParser, ParserLimits, ParserRole};
use crate::protocol::{Message, MessageId, MessageType, MsgRpcError, Result};

fn encode_error<E: Display>(e: E) -> MsgRpcError {
    MsgRpcError::Encode(e.to_string())
}

fn write_header(buf: &mut Vec<u8>, message_type: MessageType) -> Result<()> {
    rmp::encode::write_array_len(buf, message_type.field_count()).map_err(encode_error)?;
    rmp::encode::write_uint(buf, message_type.code() as u64).map_err(encode_error)?;
    Ok(())
}

fn write_params(buf: &mut Vec<u8>, params: &[Value]) -> Result<()> {
    rmp::encode::write_array_len(buf, params.len() as u32).map_err(encode_error)?;
    for param in params {
        rmpv::encode::write_value(buf, param).map_err(encode_error)?;
    }
    Ok(())
}

/// Appends `[0, id, method, params]`.
pub fn encode_request_into(
    buf: &mut Vec<u8>,
    id: MessageId,
    method: &str,
    params: &[Value],
) -> Result<()> {
    write_header(buf, MessageType::Request)?;
    rmp::encode::write_uint(buf, id as u64).map_err(encode_error)?;
    rmp::encode::write_str(buf, method).map_err(encode_error)?;
    write_params(buf, params)
}

/// Appends a request whose params are already encoded.
///
/// Lets a caller forward an [`Arguments`] cursor without decoding it.
pub fn encode_request_args_into(
    buf: &mut Vec<u8>,
    id: MessageId,
    method: &str,
    args: &Arguments,
) -> Result<()> {
    write_header(buf, MessageType::Request)?;
    rmp::encode::write_uint(buf, id as u64).map_err(encode_error)?;
    rmp::encode::write_str(buf, method).map_err(encode_error)?;
    rmp::encode::write_array_len(buf, args.len() as u32).map_err(encode_error)?;
    buf.extend_from_slice(args.as_bytes());
    Ok(())
}

/// Appends `[2, method, params]`.
pub fn encode_notification_into(buf: &mut Vec<u8>, method: &str, params: &[Value]) -> Result<()> {
    write_header(buf, MessageType::Notification)?;
    rmp::encode::write_str(buf, method).map_err(encode_error)?;
    write_params(buf, params)
}

/// Appends `[1, id, error, result]`.
pub fn encode_response_into(
    buf: &mut Vec<u8>,
    id: MessageId,
    error: &Value,
    result: &Value,
) -> Result<()> {
    write_header(buf, MessageType::Response)?;
    rmp::encode::write_uint(buf, id as u64).map_err(encode_error)?;
    rmpv::encode::write_value(buf, error).map_err(encode_error)?;
    rmpv::encode::write_value(buf, result).map_err(encode_error)?;
    Ok(())
}

pub fn encode_request(id: MessageId, method: &str, params: &[Value]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_request_into(&mut buf, id, method, params)?;
    Ok(buf)
}

pub fn encode_notification(method: &str, params: &[Value]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_notification_into(&mut buf, method, params)?;
    Ok(buf)
}

pub fn encode_response(id: MessageId, error: &Value, result: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_response_into(&mut buf, id, error, result)?;
    Ok(buf)
}

/// Encodes any message.
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    match message {
        Message::Request(r) => encode_request(r.id, &r.method, &r.params),
        Message::Response(r) => encode_response(r.id, &r.error, &r.result),
        Message::Notification(n) => encode_notification(&n.method, &n.params),
    }
}

/// Decodes exactly one complete frame.
///
/// # Errors
///
/// - [`FrameError::Truncated`] if `bytes` ends mid-frame
/// - [`FrameError::TrailingBytes`] if anything follows the frame
/// - any framing error the parser reports
pub fn decode_message(bytes: &[u8]) -> std::result::Result<Message, FrameError> {
    let mut parser = FrameParser::new(ParserRole::Any, ParserLimits::unbounded());
    let mut buf = BytesMut::from(bytes);
    match parser.parse(&mut buf)? {
        Some(frame) if buf.is_empty() => frame.into_message(),
        Some(_) => Err(FrameError::TrailingBytes(buf.len())),
        None => Err(FrameError::Truncated),
    }
}
