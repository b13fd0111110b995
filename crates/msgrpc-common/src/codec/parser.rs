//! Resumable MessagePack-RPC frame parser.
//!
//! # Architecture
//!
//! A [`FrameParser`] holds the cursor state of one session: which framing
//! stage it is in and the header fields read so far. Each stage either
//! consumes a complete field from the front of the buffer and advances, or
//! leaves the buffer untouched and suspends until more bytes arrive. Partial
//! progress is never discarded, so every byte is examined once per stage
//! regardless of how the stream was fragmented.
//!
//! ```text
//! Header -> MessageType -+-> MessageId -+-> MethodName -> ArgumentsHeader -> Arguments
//!                        |              +-> ErrorField -> ResultField
//!                        +-> MethodName (notification)
//! ```
//!
//! After a frame completes the parser resets to `Header`; bytes of a
//! pipelined next frame stay in the buffer for the following call.

use bytes::{Buf, BytesMut};
use rmpv::Value;

use super::scan::{self, Field, ValueScan};
use super::{Arguments, FrameError};
use crate::pool::Poolable;
use crate::protocol::{Message, MessageId, MessageType, Notification, Request, Response};

/// Which frame types the parser accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserRole {
    /// Requests and notifications.
    Server,
    /// Responses only.
    Client,
    /// Any frame type.
    Any,
}

impl ParserRole {
    fn accepts(self, message_type: MessageType) -> bool {
        match self {
            ParserRole::Server => message_type != MessageType::Response,
            ParserRole::Client => message_type == MessageType::Response,
            ParserRole::Any => true,
        }
    }
}

/// Framing stage the cursor is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStage {
    Header,
    MessageType,
    MessageId,
    MethodName,
    ArgumentsHeader,
    Arguments,
    ErrorField,
    ResultField,
}

/// Quotas enforced while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserLimits {
    /// Maximum declared length of a params array.
    pub max_arguments_length: u32,
    /// Maximum encoded size of one frame.
    pub max_message_length: usize,
}

impl ParserLimits {
    pub fn unbounded() -> Self {
        ParserLimits {
            max_arguments_length: u32::MAX,
            max_message_length: usize::MAX,
        }
    }
}

impl Default for ParserLimits {
    fn default() -> Self {
        ParserLimits {
            max_arguments_length: 1024,
            max_message_length: 16 * 1024 * 1024,
        }
    }
}

/// A completely parsed inbound frame.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Request {
        id: MessageId,
        method: String,
        args: Arguments,
    },
    Notification {
        method: String,
        args: Arguments,
    },
    Response {
        id: MessageId,
        error: Value,
        result: Value,
    },
}

impl InboundFrame {
    pub fn message_type(&self) -> MessageType {
        match self {
            InboundFrame::Request { .. } => MessageType::Request,
            InboundFrame::Notification { .. } => MessageType::Notification,
            InboundFrame::Response { .. } => MessageType::Response,
        }
    }

    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            InboundFrame::Request { id, .. } | InboundFrame::Response { id, .. } => Some(*id),
            InboundFrame::Notification { .. } => None,
        }
    }

    /// Decodes the arguments and converts into an owned [`Message`].
    pub fn into_message(self) -> Result<Message, FrameError> {
        let decode = |args: Arguments| {
            args.to_values()
                .map_err(|e| FrameError::MalformedValue(e.message().to_owned()))
        };
        Ok(match self {
            InboundFrame::Request { id, method, args } => {
                Message::Request(Request::new(id, method, decode(args)?))
            }
            InboundFrame::Notification { method, args } => {
                Message::Notification(Notification::new(method, decode(args)?))
            }
            InboundFrame::Response { id, error, result } => {
                Message::Response(Response { id, error, result })
            }
        })
    }
}

enum Progress {
    Advanced,
    NeedMore,
    Complete(InboundFrame),
}

/// Per-session frame parser.
///
/// Feed it the session's receive buffer with [`FrameParser::parse`]; it
/// consumes complete fields from the front of the buffer and returns a frame
/// once the last field is in.
#[derive(Debug)]
pub struct FrameParser {
    role: ParserRole,
    limits: ParserLimits,
    stage: ParseStage,
    declared_fields: u32,
    message_type: Option<MessageType>,
    message_id: Option<MessageId>,
    method: Option<String>,
    declared_arguments: u32,
    consumed_arguments: u32,
    arguments: BytesMut,
    // walk over the value at the front of the buffer, kept across reads
    scan: ValueScan,
    error_field: Option<Value>,
    frame_consumed: usize,
}

impl FrameParser {
    pub fn new(role: ParserRole, limits: ParserLimits) -> Self {
        FrameParser {
            role,
            limits,
            stage: ParseStage::Header,
            declared_fields: 0,
            message_type: None,
            message_id: None,
            method: None,
            declared_arguments: 0,
            consumed_arguments: 0,
            arguments: BytesMut::new(),
            scan: ValueScan::new(),
            error_field: None,
            frame_consumed: 0,
        }
    }

    pub fn stage(&self) -> ParseStage {
        self.stage
    }

    /// Whether the parser sits between frames.
    pub fn is_idle(&self) -> bool {
        self.stage == ParseStage::Header
    }

    /// Message id of the frame in progress, once read.
    ///
    /// Used to address a best-effort error response after a framing error.
    pub fn message_id(&self) -> Option<MessageId> {
        self.message_id
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.message_type
    }

    /// Arguments consumed so far in the current frame.
    pub fn consumed_arguments(&self) -> u32 {
        self.consumed_arguments
    }

    pub fn limits(&self) -> ParserLimits {
        self.limits
    }

    pub fn set_limits(&mut self, limits: ParserLimits) {
        self.limits = limits;
    }

    /// Advances through as many stages as the buffered bytes allow.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(frame))` when a frame completed; trailing bytes of the next
    ///   frame remain in `buf`
    /// - `Ok(None)` when more bytes are needed; partial progress is kept
    ///
    /// # Errors
    ///
    /// A [`FrameError`] when the stream is malformed or a quota is exceeded.
    /// The parser state is left as it was at the failure so the caller can
    /// inspect [`FrameParser::message_id`].
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<InboundFrame>, FrameError> {
        loop {
            match self.step(buf)? {
                Progress::Advanced => continue,
                Progress::NeedMore => {
                    self.check_size(buf.len())?;
                    return Ok(None);
                }
                Progress::Complete(frame) => {
                    self.reset();
                    return Ok(Some(frame));
                }
            }
        }
    }

    /// Returns the cursor to the `Header` stage, discarding partial state.
    pub fn reset(&mut self) {
        self.stage = ParseStage::Header;
        self.declared_fields = 0;
        self.message_type = None;
        self.message_id = None;
        self.method = None;
        self.declared_arguments = 0;
        self.consumed_arguments = 0;
        self.arguments.clear();
        self.scan.reset();
        self.error_field = None;
        self.frame_consumed = 0;
    }

    fn step(&mut self, buf: &mut BytesMut) -> Result<Progress, FrameError> {
        match self.stage {
            ParseStage::Header => self.read_header(buf),
            ParseStage::MessageType => self.read_message_type(buf),
            ParseStage::MessageId => self.read_message_id(buf),
            ParseStage::MethodName => self.read_method_name(buf),
            ParseStage::ArgumentsHeader => self.read_arguments_header(buf),
            ParseStage::Arguments => self.read_argument(buf),
            ParseStage::ErrorField => self.read_error_field(buf),
            ParseStage::ResultField => self.read_result_field(buf),
        }
    }

    fn check_size(&self, pending: usize) -> Result<(), FrameError> {
        if self.stage == ParseStage::Header && pending == 0 {
            return Ok(());
        }
        if self.frame_consumed.saturating_add(pending) > self.limits.max_message_length {
            return Err(FrameError::MessageTooLarge {
                max: self.limits.max_message_length,
            });
        }
        Ok(())
    }

    /// Consumes `n` bytes of the current frame.
    fn consume(&mut self, buf: &mut BytesMut, n: usize) -> Result<(), FrameError> {
        self.check_size(n)?;
        self.frame_consumed += n;
        buf.advance(n);
        Ok(())
    }

    fn read_header(&mut self, buf: &mut BytesMut) -> Result<Progress, FrameError> {
        let (fields, n) = match scan::read_array_len(buf) {
            Field::Ready(fields, n) => (fields, n),
            Field::Incomplete => return Ok(Progress::NeedMore),
            Field::Mismatch(marker) => return Err(FrameError::NotAnArray(marker)),
        };
        if fields != 3 && fields != 4 {
            return Err(FrameError::InvalidArrayLength(fields));
        }
        self.consume(buf, n)?;
        self.declared_fields = fields;
        self.stage = ParseStage::MessageType;
        Ok(Progress::Advanced)
    }

    fn read_message_type(&mut self, buf: &mut BytesMut) -> Result<Progress, FrameError> {
        let (code, n) = match scan::read_uint(buf) {
            Field::Ready(code, n) => (code, n),
            Field::Incomplete => return Ok(Progress::NeedMore),
            Field::Mismatch(marker) => {
                return Err(FrameError::InvalidMessageType(format!("marker 0x{:02x}", marker)))
            }
        };
        let message_type = MessageType::from_code(code)
            .ok_or_else(|| FrameError::InvalidMessageType(code.to_string()))?;
        if !self.role.accepts(message_type) {
            return Err(FrameError::UnexpectedMessageType(message_type));
        }
        if self.declared_fields != message_type.field_count() {
            return Err(FrameError::LengthMismatch {
                message_type,
                expected: message_type.field_count(),
                actual: self.declared_fields,
            });
        }
        self.consume(buf, n)?;
        self.message_type = Some(message_type);
        self.stage = match message_type {
            MessageType::Request | MessageType::Response => ParseStage::MessageId,
            MessageType::Notification => ParseStage::MethodName,
        };
        Ok(Progress::Advanced)
    }

    fn read_message_id(&mut self, buf: &mut BytesMut) -> Result<Progress, FrameError> {
        let (id, n) = match scan::read_uint(buf) {
            Field::Ready(id, n) => (id, n),
            Field::Incomplete => return Ok(Progress::NeedMore),
            Field::Mismatch(marker) => {
                return Err(FrameError::InvalidMessageId(format!("marker 0x{:02x}", marker)))
            }
        };
        let id = MessageId::try_from(id).map_err(|_| FrameError::InvalidMessageId(id.to_string()))?;
        self.consume(buf, n)?;
        self.message_id = Some(id);
        self.stage = match self.message_type {
            Some(MessageType::Response) => ParseStage::ErrorField,
            _ => ParseStage::MethodName,
        };
        Ok(Progress::Advanced)
    }

    fn read_method_name(&mut self, buf: &mut BytesMut) -> Result<Progress, FrameError> {
        let ((start, len), n) = match scan::read_str_header(buf) {
            Field::Ready(range, n) => (range, n),
            Field::Incomplete => return Ok(Progress::NeedMore),
            Field::Mismatch(marker) => {
                return Err(FrameError::InvalidMethodName(format!("marker 0x{:02x}", marker)))
            }
        };
        let method = std::str::from_utf8(&buf[start..start + len])
            .map_err(|e| FrameError::InvalidMethodName(e.to_string()))?
            .to_owned();
        self.consume(buf, n)?;
        self.method = Some(method);
        self.stage = ParseStage::ArgumentsHeader;
        Ok(Progress::Advanced)
    }

    fn read_arguments_header(&mut self, buf: &mut BytesMut) -> Result<Progress, FrameError> {
        let (declared, n) = match scan::read_array_len(buf) {
            Field::Ready(declared, n) => (declared, n),
            Field::Incomplete => return Ok(Progress::NeedMore),
            Field::Mismatch(marker) => return Err(FrameError::InvalidArguments(marker)),
        };
        if declared > self.limits.max_arguments_length {
            return Err(FrameError::TooManyArguments {
                declared,
                max: self.limits.max_arguments_length,
            });
        }
        self.consume(buf, n)?;
        self.declared_arguments = declared;
        self.consumed_arguments = 0;
        self.arguments.clear();

        if declared == 0 {
            return Ok(Progress::Complete(self.take_call()));
        }
        self.stage = ParseStage::Arguments;
        Ok(Progress::Advanced)
    }

    fn read_argument(&mut self, buf: &mut BytesMut) -> Result<Progress, FrameError> {
        let Some(n) = self.scan.resume(buf)? else {
            return Ok(Progress::NeedMore);
        };
        self.check_size(n)?;
        // re-pack into the isolated argument buffer before releasing socket bytes
        self.arguments.extend_from_slice(&buf[..n]);
        self.consume(buf, n)?;
        self.consumed_arguments += 1;

        if self.consumed_arguments == self.declared_arguments {
            return Ok(Progress::Complete(self.take_call()));
        }
        Ok(Progress::Advanced)
    }

    fn read_error_field(&mut self, buf: &mut BytesMut) -> Result<Progress, FrameError> {
        let Some(n) = self.scan.resume(buf)? else {
            return Ok(Progress::NeedMore);
        };
        let error = scan::decode_value(&buf[..n])?;
        self.consume(buf, n)?;
        self.error_field = Some(error);
        self.stage = ParseStage::ResultField;
        Ok(Progress::Advanced)
    }

    fn read_result_field(&mut self, buf: &mut BytesMut) -> Result<Progress, FrameError> {
        let Some(n) = self.scan.resume(buf)? else {
            return Ok(Progress::NeedMore);
        };
        let result = scan::decode_value(&buf[..n])?;
        self.consume(buf, n)?;
        Ok(Progress::Complete(InboundFrame::Response {
            id: self.message_id.unwrap_or_default(),
            error: self.error_field.take().unwrap_or(Value::Nil),
            result,
        }))
    }

    /// Builds the request or notification from the accumulated fields.
    fn take_call(&mut self) -> InboundFrame {
        let method = self.method.take().unwrap_or_default();
        let args = Arguments::new(self.arguments.split().freeze(), self.declared_arguments);
        match (self.message_type, self.message_id) {
            (Some(MessageType::Request), Some(id)) => InboundFrame::Request { id, method, args },
            _ => InboundFrame::Notification { method, args },
        }
    }
}

impl Poolable for FrameParser {
    fn clear(&mut self) {
        self.reset();
        // keep a modest buffer for reuse, release anything a large call grew
        if self.arguments.capacity() > 64 * 1024 {
            self.arguments = BytesMut::new();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // [0, 1, "sum", [1, 2]]
    const SUM_REQUEST: [u8; 10] = [0x94, 0x00, 0x01, 0xa3, 0x73, 0x75, 0x6d, 0x92, 0x01, 0x02];

    fn server() -> FrameParser {
        FrameParser::new(ParserRole::Server, ParserLimits::default())
    }

    fn feed(parser: &mut FrameParser, chunks: &[&[u8]]) -> Vec<InboundFrame> {
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for chunk in chunks {
            buf.extend_from_slice(chunk);
            while let Some(frame) = parser.parse(&mut buf).unwrap() {
                frames.push(frame);
            }
        }
        assert!(buf.is_empty());
        frames
    }

    fn request_parts(frame: &InboundFrame) -> (MessageId, String, Vec<Value>) {
        match frame {
            InboundFrame::Request { id, method, args } => {
                (*id, method.clone(), args.to_values().unwrap())
            }
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_one_shot_request() {
        let frames = feed(&mut server(), &[&SUM_REQUEST]);
        assert_eq!(frames.len(), 1);
        assert_eq!(
            request_parts(&frames[0]),
            (1, "sum".to_string(), vec![Value::from(1), Value::from(2)])
        );
    }

    #[test]
    fn test_two_byte_chunks_match_one_shot() {
        let chunks: Vec<&[u8]> = SUM_REQUEST.chunks(2).collect();
        assert_eq!(chunks.len(), 5);
        let fragmented = feed(&mut server(), &chunks);
        let whole = feed(&mut server(), &[&SUM_REQUEST]);
        assert_eq!(request_parts(&fragmented[0]), request_parts(&whole[0]));
    }

    #[test]
    fn test_every_split_point() {
        let mut frame = Vec::new();
        crate::codec::encode_request_into(
            &mut frame,
            70_000,
            "a.longer.method",
            &[Value::from("x".repeat(40)), Value::Array(vec![Value::from(1.5f64), Value::Nil])],
        )
        .unwrap();
        let expected = request_parts(&feed(&mut server(), &[&frame])[0]);

        for cut in 0..=frame.len() {
            let (head, tail) = frame.split_at(cut);
            let frames = feed(&mut server(), &[head, tail]);
            assert_eq!(frames.len(), 1, "cut at {}", cut);
            assert_eq!(request_parts(&frames[0]), expected, "cut at {}", cut);
        }
    }

    #[test]
    fn test_large_argument_in_chunks_is_walked_once() {
        let bulk = Value::Array(vec![Value::from(1); 200_000]);
        let frame = crate::codec::encode_request(9, "bulk", &[bulk.clone()]).unwrap();
        let mut parser = FrameParser::new(ParserRole::Server, ParserLimits::unbounded());
        let mut buf = BytesMut::new();
        let mut examined = 0;
        let mut parsed = Vec::new();

        for chunk in frame.chunks(8 * 1024) {
            buf.extend_from_slice(chunk);
            match parser.parse(&mut buf).unwrap() {
                Some(frame) => parsed.push(frame),
                None => examined = examined.max(parser.scan.examined()),
            }
        }

        assert!(frame.len() > 20 * 8 * 1024);
        assert!(
            examined <= frame.len(),
            "walked {} bytes of a {} byte frame",
            examined,
            frame.len()
        );
        assert!(buf.is_empty());
        assert_eq!(parsed.len(), 1);
        assert_eq!(request_parts(&parsed[0]), (9, "bulk".to_string(), vec![bulk]));
        assert_eq!(parser.scan, ValueScan::new());
    }

    #[test]
    fn test_partial_progress_is_kept() {
        let mut parser = server();
        let mut buf = BytesMut::from(&SUM_REQUEST[..8]);
        assert!(parser.parse(&mut buf).unwrap().is_none());
        assert_eq!(parser.stage(), ParseStage::Arguments);
        assert_eq!(parser.message_id(), Some(1));
        assert_eq!(parser.consumed_arguments(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_pipelined_frames() {
        let mut bytes = SUM_REQUEST.to_vec();
        // [2, "log", ["x"]]
        bytes.extend_from_slice(&[0x93, 0x02, 0xa3, b'l', b'o', b'g', 0x91, 0xa1, b'x']);
        bytes.extend_from_slice(&SUM_REQUEST);

        let frames = feed(&mut server(), &[&bytes]);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].message_type(), MessageType::Notification);
        assert_eq!(frames[1].message_id(), None);
        assert_eq!(frames[2].message_id(), Some(1));
    }

    #[test]
    fn test_empty_params() {
        // [0, 7, "boom", []]
        let frame = [0x94, 0x00, 0x07, 0xa4, b'b', b'o', b'o', b'm', 0x90];
        let frames = feed(&mut server(), &[&frame]);
        assert_eq!(request_parts(&frames[0]), (7, "boom".to_string(), vec![]));
    }

    #[test]
    fn test_response_frame_for_client() {
        // [1, 1, nil, "hi"]
        let frame = [0x94, 0x01, 0x01, 0xc0, 0xa2, b'h', b'i'];
        let mut parser = FrameParser::new(ParserRole::Client, ParserLimits::default());
        let chunks: Vec<&[u8]> = frame.chunks(1).collect();
        let frames = feed(&mut parser, &chunks);
        match &frames[0] {
            InboundFrame::Response { id, error, result } => {
                assert_eq!(*id, 1);
                assert!(error.is_nil());
                assert_eq!(result, &Value::from("hi"));
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    fn parse_err(parser: &mut FrameParser, bytes: &[u8]) -> FrameError {
        let mut buf = BytesMut::from(bytes);
        parser.parse(&mut buf).unwrap_err()
    }

    #[test]
    fn test_framing_errors() {
        assert_eq!(parse_err(&mut server(), &[0x81]), FrameError::NotAnArray(0x81));
        assert_eq!(parse_err(&mut server(), &[0x95]), FrameError::InvalidArrayLength(5));
        assert_eq!(parse_err(&mut server(), &[0x92]), FrameError::InvalidArrayLength(2));
        assert_eq!(
            parse_err(&mut server(), &[0x94, 0x05]),
            FrameError::InvalidMessageType("5".to_string())
        );
        assert!(matches!(
            parse_err(&mut server(), &[0x94, 0xa1, b'x']),
            FrameError::InvalidMessageType(_)
        ));
        assert_eq!(
            parse_err(&mut server(), &[0x93, 0x00]),
            FrameError::LengthMismatch {
                message_type: MessageType::Request,
                expected: 4,
                actual: 3
            }
        );
        assert_eq!(
            parse_err(&mut server(), &[0x94, 0x01]),
            FrameError::UnexpectedMessageType(MessageType::Response)
        );
        assert!(matches!(
            parse_err(&mut server(), &[0x94, 0x00, 0xa1, b'x']),
            FrameError::InvalidMessageId(_)
        ));
        assert!(matches!(
            parse_err(&mut server(), &[0x94, 0x00, 0xcf, 0, 0, 0, 1, 0, 0, 0, 0]),
            FrameError::InvalidMessageId(_)
        ));
        assert!(matches!(
            parse_err(&mut server(), &[0x94, 0x00, 0x01, 0x01]),
            FrameError::InvalidMethodName(_)
        ));
        assert!(matches!(
            parse_err(&mut server(), &[0x94, 0x00, 0x01, 0xa2, 0xff, 0xfe]),
            FrameError::InvalidMethodName(_)
        ));
        assert_eq!(
            parse_err(&mut server(), &[0x94, 0x00, 0x01, 0xa1, b'm', 0x01]),
            FrameError::InvalidArguments(0x01)
        );
        assert_eq!(
            parse_err(&mut server(), &[0x94, 0x00, 0x01, 0xa1, b'm', 0x91, 0xc1]),
            FrameError::ReservedMarker(0xc1)
        );
    }

    #[test]
    fn test_client_rejects_requests() {
        let mut parser = FrameParser::new(ParserRole::Client, ParserLimits::default());
        assert_eq!(
            parse_err(&mut parser, &SUM_REQUEST),
            FrameError::UnexpectedMessageType(MessageType::Request)
        );
    }

    #[test]
    fn test_message_id_available_after_error() {
        let mut parser = server();
        parse_err(&mut parser, &[0x94, 0x00, 0x09, 0xa1, b'm', 0x01]);
        assert_eq!(parser.message_id(), Some(9));
    }

    #[test]
    fn test_arguments_quota() {
        let limits = ParserLimits {
            max_arguments_length: 2,
            ..ParserLimits::default()
        };
        let mut parser = FrameParser::new(ParserRole::Server, limits);
        // [0, 3, "m", [1, 2, 3]]
        let frame = [0x94, 0x00, 0x03, 0xa1, b'm', 0x93, 0x01, 0x02, 0x03];
        let err = parse_err(&mut parser, &frame);
        assert_eq!(err, FrameError::TooManyArguments { declared: 3, max: 2 });
        assert_eq!(err.category(), crate::protocol::ErrorCategory::Quota);
    }

    #[test]
    fn test_arguments_quota_without_elements() {
        // array32 header declaring far more elements than allowed, no payload
        let frame = [0x94, 0x00, 0x03, 0xa1, b'm', 0xdd, 0x7f, 0xff, 0xff, 0xff];
        assert!(matches!(
            parse_err(&mut server(), &frame),
            FrameError::TooManyArguments { .. }
        ));
    }

    #[test]
    fn test_message_length_quota() {
        let limits = ParserLimits {
            max_message_length: 32,
            ..ParserLimits::default()
        };
        let mut parser = FrameParser::new(ParserRole::Server, limits);
        let mut buf = BytesMut::from(&[0x94, 0x00, 0x01, 0xa1, b'm', 0x91, 0xd9, 0xff][..]);
        assert!(parser.parse(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[b'a'; 40]);
        assert_eq!(
            parser.parse(&mut buf).unwrap_err(),
            FrameError::MessageTooLarge { max: 32 }
        );
    }

    #[test]
    fn test_clear_restores_fresh_state() {
        let mut parser = server();
        let mut buf = BytesMut::from(&SUM_REQUEST[..8]);
        parser.parse(&mut buf).unwrap();
        parser.clear();
        assert!(parser.is_idle());
        assert_eq!(parser.message_id(), None);
        assert_eq!(parser.consumed_arguments(), 0);

        let frames = feed(&mut parser, &[&SUM_REQUEST]);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_into_message() {
        let frames = feed(&mut server(), &[&SUM_REQUEST]);
        let message = frames[0].clone().into_message().unwrap();
        assert_eq!(
            message,
            Message::Request(Request::new(1, "sum", vec![Value::from(1), Value::from(2)]))
        );
    }
}
