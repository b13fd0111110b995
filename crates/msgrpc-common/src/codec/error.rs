use thiserror::Error;

use crate::protocol::{ErrorCategory, MessageType};

/// Failures detected while framing an inbound byte stream.
///
/// Once one of these is raised the stream cannot be resynchronized; the
/// owning session reports it best-effort and shuts down.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("expected a top-level array, found marker 0x{0:02x}")]
    NotAnArray(u8),

    #[error("top-level array must have 3 or 4 elements, got {0}")]
    InvalidArrayLength(u32),

    #[error("invalid message type: {0}")]
    InvalidMessageType(String),

    #[error("{message_type} frame must have {expected} elements, got {actual}")]
    LengthMismatch {
        message_type: MessageType,
        expected: u32,
        actual: u32,
    },

    #[error("unexpected {0} frame")]
    UnexpectedMessageType(MessageType),

    #[error("message id must be an unsigned 32-bit integer: {0}")]
    InvalidMessageId(String),

    #[error("method name must be a UTF-8 string: {0}")]
    InvalidMethodName(String),

    #[error("params must be an array, found marker 0x{0:02x}")]
    InvalidArguments(u8),

    #[error("reserved marker 0x{0:02x}")]
    ReservedMarker(u8),

    #[error("malformed value: {0}")]
    MalformedValue(String),

    #[error("arguments array declares {declared} elements, maximum is {max}")]
    TooManyArguments { declared: u32, max: u32 },

    #[error("frame exceeds the maximum message length of {max} bytes")]
    MessageTooLarge { max: usize },

    #[error("frame is truncated")]
    Truncated,

    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
}

impl FrameError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            FrameError::TooManyArguments { .. } | FrameError::MessageTooLarge { .. } => {
                ErrorCategory::Quota
            }
            _ => ErrorCategory::ProtocolFraming,
        }
    }
}
