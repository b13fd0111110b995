//! The argument cursor handed to dispatchers.

use bytes::Bytes;
use rmpv::Value;
use serde::de::DeserializeOwned;

use crate::protocol::{MsgRpcError, Result, RpcError};

/// Cursor over the arguments of one inbound call.
///
/// The parser re-packs each argument into an isolated buffer, so an
/// `Arguments` value is independent of the socket buffer it came from and is
/// cheap to clone. Values are decoded lazily as the cursor advances.
///
/// # Example
///
/// ```
/// use msgrpc_common::codec::Arguments;
/// use rmpv::Value;
///
/// let mut args = Arguments::from_values(&[Value::from(2), Value::from("x")]).unwrap();
/// let n: u32 = args.next().unwrap();
/// let s: String = args.next().unwrap();
/// assert_eq!((n, s.as_str()), (2, "x"));
/// assert_eq!(args.remaining(), 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Arguments {
    bytes: Bytes,
    len: u32,
    position: u32,
    offset: usize,
}

impl Arguments {
    /// Wraps `len` concatenated MessagePack values.
    pub fn new(bytes: Bytes, len: u32) -> Self {
        Arguments {
            bytes,
            len,
            position: 0,
            offset: 0,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Packs already-decoded values into a cursor.
    ///
    /// # Errors
    ///
    /// Returns `MsgRpcError::Encode` if a value cannot be encoded.
    pub fn from_values(values: &[Value]) -> Result<Self> {
        let mut buf = Vec::new();
        for value in values {
            rmpv::encode::write_value(&mut buf, value)
                .map_err(|e| MsgRpcError::Encode(e.to_string()))?;
        }
        Ok(Self::new(Bytes::from(buf), values.len() as u32))
    }

    /// Total number of arguments.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Arguments not yet consumed by the cursor.
    pub fn remaining(&self) -> usize {
        (self.len - self.position) as usize
    }

    /// Decodes the next argument.
    ///
    /// # Errors
    ///
    /// `ArgumentError` when the arguments are exhausted or malformed.
    pub fn next_value(&mut self) -> std::result::Result<Value, RpcError> {
        if self.position >= self.len {
            return Err(RpcError::argument(format!(
                "expected at least {} arguments, got {}",
                self.position + 1,
                self.len
            )));
        }
        let mut slice = &self.bytes[self.offset..];
        let before = slice.len();
        let value = rmpv::decode::read_value(&mut slice).map_err(|e| {
            RpcError::argument(format!("argument {} is malformed: {}", self.position, e))
        })?;
        self.offset += before - slice.len();
        self.position += 1;
        Ok(value)
    }

    /// Decodes the next argument into `T`.
    ///
    /// # Errors
    ///
    /// `ArgumentError` when the arguments are exhausted or the value does
    /// not deserialize into `T`.
    pub fn next<T: DeserializeOwned>(&mut self) -> std::result::Result<T, RpcError> {
        let index = self.position;
        let value = self.next_value()?;
        rmpv::ext::from_value(value)
            .map_err(|e| RpcError::argument(format!("argument {}: {}", index, e)))
    }

    /// Decodes every argument, independent of the cursor position.
    pub fn to_values(&self) -> std::result::Result<Vec<Value>, RpcError> {
        let mut cursor = Arguments::new(self.bytes.clone(), self.len);
        let mut values = Vec::with_capacity(self.len());
        while cursor.remaining() > 0 {
            values.push(cursor.next_value()?);
        }
        Ok(values)
    }

    /// Moves the cursor back to the first argument.
    pub fn rewind(&mut self) {
        self.position = 0;
        self.offset = 0;
    }

    /// The concatenated encoded arguments, without the array header.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}
