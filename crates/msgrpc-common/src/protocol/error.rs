//! Error taxonomy for msgrpc.
//!
//! Two layers of errors exist:
//!
//! - [`RpcError`] is the value that travels on the wire inside a response's
//!   error field. It carries a stable string identifier ([`RpcErrorKind`])
//!   plus an optional detail map.
//! - [`MsgRpcError`] is the crate-wide error returned by local operations.
//!   Remote failures are wrapped as [`MsgRpcError::Remote`].
//!
//! Both map onto the coarse [`ErrorCategory`] used for propagation policy:
//! framing and quota errors abort a session, application errors stay scoped
//! to one exchange, timeouts reset the connection.

use std::fmt;

use rmpv::Value;
use thiserror::Error;

use crate::codec::FrameError;
use crate::completion::HandleError;

/// Coarse classification used for propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed array shape or field types.
    ProtocolFraming,
    /// Arguments, message or server capacity exceeded.
    Quota,
    /// Receive, send or execution budget exceeded.
    Timeout,
    /// Socket-level failure.
    Transport,
    /// The dispatcher reported a failure.
    Application,
    /// Unrecognized error identifier from a remote peer.
    Unknown,
}

/// Wire error identifiers.
///
/// A received identifier is mapped with [`RpcErrorKind::classify`]: an exact
/// match against the known identifiers yields that kind, anything else is
/// kept verbatim as [`RpcErrorKind::Unknown`] so it can be forwarded
/// unchanged. `UnexpectedError` is a known identifier like any other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RpcErrorKind {
    MessageRefused,
    MessageTooLarge,
    Timeout,
    Transport,
    Call,
    NoMethod,
    Argument,
    ServerBusy,
    Unexpected,
    Unknown(String),
}

impl RpcErrorKind {
    /// Classifies a received identifier.
    ///
    /// # Example
    ///
    /// ```
    /// use msgrpc_common::protocol::RpcErrorKind;
    ///
    /// assert_eq!(RpcErrorKind::classify("NoMethodError"), RpcErrorKind::NoMethod);
    /// assert_eq!(RpcErrorKind::classify("UnexpectedError"), RpcErrorKind::Unexpected);
    /// assert_eq!(
    ///     RpcErrorKind::classify("Vendor.Quirk"),
    ///     RpcErrorKind::Unknown("Vendor.Quirk".to_string())
    /// );
    /// ```
    pub fn classify(identifier: &str) -> Self {
        match identifier {
            "MessageRefusedError" => RpcErrorKind::MessageRefused,
            "MessageTooLargeError" => RpcErrorKind::MessageTooLarge,
            "TimeoutError" => RpcErrorKind::Timeout,
            "TransportError" => RpcErrorKind::Transport,
            "CallError" => RpcErrorKind::Call,
            "NoMethodError" => RpcErrorKind::NoMethod,
            "ArgumentError" => RpcErrorKind::Argument,
            "ServerBusyError" => RpcErrorKind::ServerBusy,
            "UnexpectedError" => RpcErrorKind::Unexpected,
            other => RpcErrorKind::Unknown(other.to_owned()),
        }
    }

    /// The identifier transmitted on the wire.
    pub fn identifier(&self) -> &str {
        match self {
            RpcErrorKind::MessageRefused => "MessageRefusedError",
            RpcErrorKind::MessageTooLarge => "MessageTooLargeError",
            RpcErrorKind::Timeout => "TimeoutError",
            RpcErrorKind::Transport => "TransportError",
            RpcErrorKind::Call => "CallError",
            RpcErrorKind::NoMethod => "NoMethodError",
            RpcErrorKind::Argument => "ArgumentError",
            RpcErrorKind::ServerBusy => "ServerBusyError",
            RpcErrorKind::Unexpected => "UnexpectedError",
            RpcErrorKind::Unknown(identifier) => identifier,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            RpcErrorKind::MessageRefused => ErrorCategory::ProtocolFraming,
            RpcErrorKind::MessageTooLarge | RpcErrorKind::ServerBusy => ErrorCategory::Quota,
            RpcErrorKind::Timeout => ErrorCategory::Timeout,
            RpcErrorKind::Transport => ErrorCategory::Transport,
            RpcErrorKind::Call
            | RpcErrorKind::NoMethod
            | RpcErrorKind::Argument
            | RpcErrorKind::Unexpected => ErrorCategory::Application,
            RpcErrorKind::Unknown(_) => ErrorCategory::Unknown,
        }
    }
}

impl fmt::Display for RpcErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

const MESSAGE_KEY: &str = "message";
const DATA_KEY: &str = "data";
const DEBUG_KEY: &str = "debug";
const ERROR_KEY: &str = "error";

/// An error as transmitted in a response frame.
///
/// On the wire the error field holds the identifier string and the result
/// field holds a detail map:
///
/// ```text
/// [1, msgid, "CallError", {"message": "...", "data": ..., "debug": "..."}]
/// ```
///
/// `debug` is only written when the sender runs in debug mode.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    kind: RpcErrorKind,
    message: String,
    data: Option<Value>,
    debug: Option<String>,
}

impl RpcError {
    pub fn new(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        RpcError {
            kind,
            message: message.into(),
            data: None,
            debug: None,
        }
    }

    /// Generic application fault raised by a dispatched method.
    pub fn call_error(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Call, message)
    }

    pub fn no_method(method: &str) -> Self {
        Self::new(RpcErrorKind::NoMethod, format!("method '{}' is not registered", method))
    }

    pub fn argument(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Argument, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Timeout, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Transport, message)
    }

    pub fn message_refused(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::MessageRefused, message)
    }

    pub fn message_too_large(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::MessageTooLarge, message)
    }

    pub fn server_busy(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::ServerBusy, message)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Unexpected, message)
    }

    /// Attaches an application-defined detail value.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attaches diagnostic text that is only transmitted in debug mode.
    pub fn with_debug(mut self, debug: impl Into<String>) -> Self {
        self.debug = Some(debug.into());
        self
    }

    pub fn kind(&self) -> &RpcErrorKind {
        &self.kind
    }

    pub fn identifier(&self) -> &str {
        self.kind.identifier()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    pub fn debug_info(&self) -> Option<&str> {
        self.debug.as_deref()
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Encodes the error as the `(error, result)` field pair of a response.
    pub fn to_wire(&self, debug_mode: bool) -> (Value, Value) {
        let mut detail = Vec::with_capacity(3);
        detail.push((Value::from(MESSAGE_KEY), Value::from(self.message.as_str())));
        if let Some(data) = &self.data {
            detail.push((Value::from(DATA_KEY), data.clone()));
        }
        if debug_mode {
            if let Some(debug) = &self.debug {
                detail.push((Value::from(DEBUG_KEY), Value::from(debug.as_str())));
            }
        }
        (Value::from(self.identifier()), Value::Map(detail))
    }

    /// Rebuilds an error from the `(error, result)` fields of a response.
    ///
    /// A non-string error field cannot carry an identifier; it is reported
    /// as `UnexpectedError` with the original value kept under the `error`
    /// key of the data map.
    pub fn from_wire(error: Value, detail: Value) -> Self {
        let identifier = match error {
            Value::String(ref s) => s.as_str().map(ToOwned::to_owned),
            _ => None,
        };
        let Some(identifier) = identifier else {
            let data = Value::Map(vec![
                (Value::from(ERROR_KEY), error),
                (Value::from(DATA_KEY), detail),
            ]);
            return RpcError::unexpected("remote returned a non-string error identifier")
                .with_data(data);
        };

        let mut rpc = RpcError::new(RpcErrorKind::classify(&identifier), String::new());
        match detail {
            Value::Nil => {}
            Value::Map(entries) => {
                for (key, value) in entries {
                    match key.as_str() {
                        Some(MESSAGE_KEY) => {
                            rpc.message = match value.as_str() {
                                Some(text) => text.to_owned(),
                                None => value.to_string(),
                            }
                        }
                        Some(DATA_KEY) => rpc.data = Some(value),
                        Some(DEBUG_KEY) => rpc.debug = value.as_str().map(ToOwned::to_owned),
                        _ => {}
                    }
                }
            }
            Value::String(ref text) if text.as_str().is_some() => {
                rpc.message = text.as_str().unwrap_or_default().to_owned();
            }
            other => rpc.data = Some(other),
        }
        rpc
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for RpcError {}

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum MsgRpcError {
    #[error("Remote error: {0}")]
    Remote(#[from] RpcError),

    #[error("Protocol error: {0}")]
    Framing(#[from] FrameError),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encode(String),

    #[error("Completion handle error: {0}")]
    Handle(#[from] HandleError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Transport is shutting down")]
    ShuttingDown,

    #[error("Pool is closed")]
    PoolClosed,

    #[error("Pool acquisition timed out after {0}ms")]
    PoolTimeout(u64),
}

impl MsgRpcError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            MsgRpcError::Remote(e) => e.category(),
            MsgRpcError::Framing(e) => e.category(),
            MsgRpcError::Timeout(_) => ErrorCategory::Timeout,
            MsgRpcError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                ErrorCategory::Timeout
            }
            MsgRpcError::Transport(_)
            | MsgRpcError::Io(_)
            | MsgRpcError::ShuttingDown
            | MsgRpcError::PoolClosed => ErrorCategory::Transport,
            MsgRpcError::PoolTimeout(_) => ErrorCategory::Quota,
            MsgRpcError::Encode(_) | MsgRpcError::Handle(_) | MsgRpcError::Config(_) => {
                ErrorCategory::Application
            }
        }
    }

    /// Converts a local failure into the error reported to a remote peer.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            MsgRpcError::Remote(e) => e.clone(),
            MsgRpcError::Framing(e) if e.category() == ErrorCategory::Quota => {
                RpcError::message_too_large(e.to_string())
            }
            MsgRpcError::Framing(e) => RpcError::message_refused(e.to_string()),
            MsgRpcError::Timeout(message) => RpcError::timeout(message.clone()),
            MsgRpcError::PoolTimeout(_) => RpcError::server_busy(self.to_string()),
            MsgRpcError::Transport(_)
            | MsgRpcError::Io(_)
            | MsgRpcError::ShuttingDown
            | MsgRpcError::PoolClosed => RpcError::transport(self.to_string()),
            MsgRpcError::Encode(_) | MsgRpcError::Handle(_) | MsgRpcError::Config(_) => {
                RpcError::unexpected(self.to_string())
            }
        }
    }

    /// The remote error, when this failure came from the peer.
    pub fn as_remote(&self) -> Option<&RpcError> {
        match self {
            MsgRpcError::Remote(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, MsgRpcError>;
