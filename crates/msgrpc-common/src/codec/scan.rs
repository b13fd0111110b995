//! Allocation-free scanning of MessagePack values.
//!
//! The parser never decodes a value until all of its bytes are buffered.
//! [`value_extent`] walks markers over the buffered bytes and reports how
//! long the next value is, or that more bytes are needed. Declared lengths
//! are only compared against what has arrived, so a peer announcing a huge
//! string or array it never sends costs nothing but the bytes it did send.
//! [`ValueScan`] keeps that walk across reads, so a value split over many
//! reads is still walked once.

use rmp::Marker;
use rmpv::Value;

use super::FrameError;

/// Reads a big-endian length of `width` bytes at `pos`.
fn be_len(buf: &[u8], pos: usize, width: usize) -> Option<usize> {
    let bytes = buf.get(pos..pos + width)?;
    Some(bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize))
}

/// Resumable walk over one MessagePack value.
///
/// The cursor survives [`ValueScan::resume`] returning `None`, so a value
/// arriving over many reads is walked once in total rather than once per
/// read. The buffer handed to each call must start at the same byte and
/// may only have grown at the end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueScan {
    // offset of the next marker, or the end of the last payload
    pos: usize,
    // values still to be walked, including nested container elements
    pending: u64,
    examined: usize,
}

impl Default for ValueScan {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueScan {
    pub fn new() -> Self {
        ValueScan {
            pos: 0,
            pending: 1,
            examined: 0,
        }
    }

    /// Starts over for the next value.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Marker and length bytes inspected since the last reset.
    pub fn examined(&self) -> usize {
        self.examined
    }

    /// Continues the walk over `buf`.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(n))` when the first `n` bytes hold a complete value; the
    ///   scan is reset for the next one
    /// - `Ok(None)` when the value is not fully buffered yet
    ///
    /// # Errors
    ///
    /// [`FrameError::ReservedMarker`] when the stream contains the reserved
    /// marker `0xc1`.
    pub fn resume(&mut self, buf: &[u8]) -> Result<Option<usize>, FrameError> {
        loop {
            // payload of the last walked value still arriving
            if self.pos > buf.len() {
                return Ok(None);
            }
            if self.pending == 0 {
                let len = self.pos;
                self.reset();
                return Ok(Some(len));
            }
            let Some(&byte) = buf.get(self.pos) else {
                return Ok(None);
            };
            let Some((header, skip, nested)) = marker_extent(byte, buf, self.pos + 1)? else {
                return Ok(None);
            };
            let Some(next) = (self.pos + 1 + header).checked_add(skip) else {
                return Ok(None);
            };
            self.examined += 1 + header;
            self.pos = next;
            self.pending = self.pending - 1 + nested;
        }
    }
}

/// Sizes the value whose marker `byte` sits just before `pos`.
///
/// Returns the length-field width, the payload length and the number of
/// nested values, or `None` when the length field is not buffered yet.
fn marker_extent(byte: u8, buf: &[u8], pos: usize) -> Result<Option<(usize, usize, u64)>, FrameError> {
    let sized = |width: usize, extra: usize| be_len(buf, pos, width).map(|len| (width, extra + len, 0));
    let counted = |width: usize, per_entry: u64| {
        be_len(buf, pos, width).map(|len| (width, 0, per_entry * len as u64))
    };

    Ok(match Marker::from_u8(byte) {
        Marker::FixPos(_) | Marker::FixNeg(_) | Marker::Null | Marker::True | Marker::False => Some((0, 0, 0)),
        Marker::U8 | Marker::I8 => Some((0, 1, 0)),
        Marker::U16 | Marker::I16 => Some((0, 2, 0)),
        Marker::U32 | Marker::I32 | Marker::F32 => Some((0, 4, 0)),
        Marker::U64 | Marker::I64 | Marker::F64 => Some((0, 8, 0)),
        Marker::FixStr(len) => Some((0, len as usize, 0)),
        Marker::Str8 | Marker::Bin8 => sized(1, 0),
        Marker::Str16 | Marker::Bin16 => sized(2, 0),
        Marker::Str32 | Marker::Bin32 => sized(4, 0),
        Marker::FixArray(len) => Some((0, 0, len as u64)),
        Marker::Array16 => counted(2, 1),
        Marker::Array32 => counted(4, 1),
        Marker::FixMap(len) => Some((0, 0, 2 * len as u64)),
        Marker::Map16 => counted(2, 2),
        Marker::Map32 => counted(4, 2),
        // ext payloads are preceded by a one-byte type tag
        Marker::FixExt1 => Some((0, 2, 0)),
        Marker::FixExt2 => Some((0, 3, 0)),
        Marker::FixExt4 => Some((0, 5, 0)),
        Marker::FixExt8 => Some((0, 9, 0)),
        Marker::FixExt16 => Some((0, 17, 0)),
        Marker::Ext8 => sized(1, 1),
        Marker::Ext16 => sized(2, 1),
        Marker::Ext32 => sized(4, 1),
        Marker::Reserved => return Err(FrameError::ReservedMarker(byte)),
    })
}

/// Returns the byte length of the first complete value in `buf`.
///
/// One-shot form of [`ValueScan::resume`].
pub fn value_extent(buf: &[u8]) -> Result<Option<usize>, FrameError> {
    ValueScan::new().resume(buf)
}

/// Decodes a value whose extent is already known to be `buf.len()`.
pub fn decode_value(buf: &[u8]) -> Result<Value, FrameError> {
    let mut slice = buf;
    rmpv::decode::read_value(&mut slice).map_err(|e| FrameError::MalformedValue(e.to_string()))
}

/// Outcome of reading a typed header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field<T> {
    /// The field and the number of bytes it occupied.
    Ready(T, usize),
    /// More bytes are needed.
    Incomplete,
    /// The field has a different type; carries the offending marker byte.
    Mismatch(u8),
}

/// Reads an array header.
pub fn read_array_len(buf: &[u8]) -> Field<u32> {
    let Some(&byte) = buf.first() else {
        return Field::Incomplete;
    };
    let width = match Marker::from_u8(byte) {
        Marker::FixArray(len) => return Field::Ready(len as u32, 1),
        Marker::Array16 => 2,
        Marker::Array32 => 4,
        _ => return Field::Mismatch(byte),
    };
    match be_len(buf, 1, width) {
        Some(len) => Field::Ready(len as u32, 1 + width),
        None => Field::Incomplete,
    }
}

/// Reads a non-negative integer of any width.
///
/// Signed markers are accepted when the value is non-negative, since some
/// encoders always emit signed integers.
pub fn read_uint(buf: &[u8]) -> Field<u64> {
    let Some(&byte) = buf.first() else {
        return Field::Incomplete;
    };
    let (width, signed) = match Marker::from_u8(byte) {
        Marker::FixPos(value) => return Field::Ready(value as u64, 1),
        Marker::U8 => (1, false),
        Marker::U16 => (2, false),
        Marker::U32 => (4, false),
        Marker::U64 => (8, false),
        Marker::I8 => (1, true),
        Marker::I16 => (2, true),
        Marker::I32 => (4, true),
        Marker::I64 => (8, true),
        _ => return Field::Mismatch(byte),
    };
    let Some(bytes) = buf.get(1..1 + width) else {
        return Field::Incomplete;
    };
    let raw = bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
    // the sign bit of the big-endian payload
    if signed && bytes[0] & 0x80 != 0 {
        return Field::Mismatch(byte);
    }
    Field::Ready(raw, 1 + width)
}

/// Reads a string header, returning the payload range.
///
/// On success the payload is `buf[start..start + len]` and the whole field
/// occupies `start + len` bytes.
pub fn read_str_header(buf: &[u8]) -> Field<(usize, usize)> {
    let Some(&byte) = buf.first() else {
        return Field::Incomplete;
    };
    let width = match Marker::from_u8(byte) {
        Marker::FixStr(len) => {
            let len = len as usize;
            return if buf.len() >= 1 + len {
                Field::Ready((1, len), 1 + len)
            } else {
                Field::Incomplete
            };
        }
        Marker::Str8 => 1,
        Marker::Str16 => 2,
        Marker::Str32 => 4,
        _ => return Field::Mismatch(byte),
    };
    let Some(len) = be_len(buf, 1, width) else {
        return Field::Incomplete;
    };
    let start = 1 + width;
    if buf.len() >= start + len {
        Field::Ready((start, len), start + len)
    } else {
        Field::Incomplete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: &Value) -> Vec<u8> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, value).unwrap();
        buf
    }

    #[test]
    fn test_extent_of_scalars() {
        for value in [
            Value::Nil,
            Value::from(true),
            Value::from(7),
            Value::from(-3),
            Value::from(300),
            Value::from(u64::MAX),
            Value::from(-40_000),
            Value::from(1.5f64),
            Value::from("hello"),
            Value::Binary(vec![1, 2, 3]),
        ] {
            let bytes = encode(&value);
            assert_eq!(value_extent(&bytes).unwrap(), Some(bytes.len()), "{}", value);
        }
    }

    #[test]
    fn test_extent_of_nested_containers() {
        let value = Value::Array(vec![
            Value::from(1),
            Value::Map(vec![(Value::from("k"), Value::Array(vec![Value::Nil; 20]))]),
            Value::from("x".repeat(300)),
        ]);
        let mut bytes = encode(&value);
        let len = bytes.len();
        bytes.extend_from_slice(&[0x01, 0x02]);
        assert_eq!(value_extent(&bytes).unwrap(), Some(len));
    }

    #[test]
    fn test_extent_incomplete_at_every_prefix() {
        let value = Value::Array(vec![Value::from("abc"), Value::from(70_000), Value::Nil]);
        let bytes = encode(&value);
        for cut in 0..bytes.len() {
            assert_eq!(value_extent(&bytes[..cut]).unwrap(), None, "cut at {}", cut);
        }
    }

    #[test]
    fn test_huge_declared_length_is_not_allocated() {
        // str32 announcing 4 GiB with only three payload bytes present
        let bytes = [0xdb, 0xff, 0xff, 0xff, 0xff, b'a', b'b', b'c'];
        assert_eq!(value_extent(&bytes).unwrap(), None);

        // array32 announcing u32::MAX elements
        let bytes = [0xdd, 0xff, 0xff, 0xff, 0xff, 0x01];
        assert_eq!(value_extent(&bytes).unwrap(), None);
    }

    #[test]
    fn test_reserved_marker_is_rejected() {
        assert_eq!(value_extent(&[0x92, 0x01, 0xc1]), Err(FrameError::ReservedMarker(0xc1)));
    }

    #[test]
    fn test_ext_extent() {
        // fixext4 with type tag 5
        let bytes = [0xd6, 0x05, 1, 2, 3, 4];
        assert_eq!(value_extent(&bytes).unwrap(), Some(6));
        assert_eq!(value_extent(&bytes[..5]).unwrap(), None);
    }

    #[test]
    fn test_resumed_scan_walks_each_byte_once() {
        // every element is a one-byte fixint, so every byte is a marker
        let value = Value::Array(vec![Value::from(1); 20_000]);
        let bytes = encode(&value);

        let mut scan = ValueScan::new();
        let mut resumes = 0;
        for end in (0..bytes.len()).step_by(512) {
            assert_eq!(scan.resume(&bytes[..end]).unwrap(), None);
            resumes += 1;
        }
        assert!(resumes > 30);
        assert!(
            scan.examined() <= bytes.len(),
            "examined {} bytes of a {} byte value",
            scan.examined(),
            bytes.len()
        );

        assert_eq!(scan.resume(&bytes).unwrap(), Some(bytes.len()));
        assert_eq!(value_extent(&bytes).unwrap(), Some(bytes.len()));
        // reset for the next value
        assert_eq!(scan, ValueScan::new());
    }

    #[test]
    fn test_scan_resumes_inside_length_field() {
        // str16 of 300 bytes, cut between the two length bytes
        let bytes = encode(&Value::from("y".repeat(300)));
        let mut scan = ValueScan::new();
        assert_eq!(scan.resume(&bytes[..2]).unwrap(), None);
        assert_eq!(scan.resume(&bytes[..100]).unwrap(), None);
        assert_eq!(scan.resume(&bytes).unwrap(), Some(bytes.len()));
    }

    #[test]
    fn test_read_uint_widths() {
        assert_eq!(read_uint(&[0x05]), Field::Ready(5, 1));
        assert_eq!(read_uint(&[0xcd, 0x01, 0x00]), Field::Ready(256, 3));
        assert_eq!(read_uint(&[0xce, 0xff, 0xff, 0xff, 0xff]), Field::Ready(u32::MAX as u64, 5));
        assert_eq!(read_uint(&[0xd0, 0x05]), Field::Ready(5, 2));
        assert_eq!(read_uint(&[0xd0, 0xfb]), Field::Mismatch(0xd0));
        assert_eq!(read_uint(&[0xff]), Field::Mismatch(0xff));
        assert_eq!(read_uint(&[0xcd, 0x01]), Field::Incomplete);
        assert_eq!(read_uint(&[0xa1, b'x']), Field::Mismatch(0xa1));
    }

    #[test]
    fn test_read_array_len() {
        assert_eq!(read_array_len(&[0x94]), Field::Ready(4, 1));
        assert_eq!(read_array_len(&[0xdc, 0x01, 0x00]), Field::Ready(256, 3));
        assert_eq!(read_array_len(&[0xdc, 0x01]), Field::Incomplete);
        assert_eq!(read_array_len(&[0x80]), Field::Mismatch(0x80));
        assert_eq!(read_array_len(&[]), Field::Incomplete);
    }

    #[test]
    fn test_read_str_header() {
        assert_eq!(read_str_header(b"\xa3sum"), Field::Ready((1, 3), 4));
        assert_eq!(read_str_header(b"\xa3su"), Field::Incomplete);
        assert_eq!(read_str_header(b"\xd9\x02ab"), Field::Ready((2, 2), 4));
        assert_eq!(read_str_header(&[0x01]), Field::Mismatch(0x01));
    }
}
