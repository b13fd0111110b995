//! Property tests for the incremental frame parser.
//!
//! Any valid frame stream, cut into arbitrary chunks, must decode to the
//! same frames as the unfragmented stream.

use bytes::BytesMut;
use msgrpc_common::codec::{
    encode_notification, encode_request, FrameParser, InboundFrame, ParserLimits, ParserRole,
};
use proptest::prelude::*;
use rmpv::Value;

fn arb_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Nil),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        any::<u64>().prop_map(Value::from),
        any::<f64>()
            .prop_filter("NaN never equals itself", |f| !f.is_nan())
            .prop_map(Value::from),
        ".{0,40}".prop_map(Value::from),
        proptest::collection::vec(any::<u8>(), 0..300).prop_map(Value::Binary),
    ];
    leaf.prop_recursive(3, 32, 6, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            proptest::collection::vec((inner.clone(), inner), 0..4).prop_map(Value::Map),
        ]
    })
}

#[derive(Debug, Clone)]
enum Call {
    Request(u32, String, Vec<Value>),
    Notification(String, Vec<Value>),
}

fn arb_params() -> impl Strategy<Value = Vec<Value>> {
    proptest::collection::vec(arb_value(), 0..5)
}

fn arb_call() -> impl Strategy<Value = Call> {
    prop_oneof![
        (any::<u32>(), "[a-z._]{1,24}", arb_params())
            .prop_map(|(id, method, params)| Call::Request(id, method, params)),
        ("[a-z._]{1,24}", arb_params()).prop_map(|(method, params)| Call::Notification(method, params)),
    ]
}

fn encode(calls: &[Call]) -> Vec<u8> {
    let mut stream = Vec::new();
    for call in calls {
        let frame = match call {
            Call::Request(id, method, params) => encode_request(*id, method, params),
            Call::Notification(method, params) => encode_notification(method, params),
        };
        stream.extend(frame.unwrap());
    }
    stream
}

fn decode(frame: InboundFrame) -> Call {
    match frame {
        InboundFrame::Request { id, method, args } => {
            Call::Request(id, method, args.to_values().unwrap())
        }
        InboundFrame::Notification { method, args } => {
            Call::Notification(method, args.to_values().unwrap())
        }
        InboundFrame::Response { .. } => panic!("server parser produced a response"),
    }
}

fn parse_chunked(stream: &[u8], cuts: &[usize]) -> Vec<Call> {
    let mut parser = FrameParser::new(ParserRole::Server, ParserLimits::unbounded());
    let mut buf = BytesMut::new();
    let mut calls = Vec::new();
    let mut start = 0;
    for &end in cuts.iter().chain(std::iter::once(&stream.len())) {
        buf.extend_from_slice(&stream[start..end]);
        start = end;
        while let Some(frame) = parser.parse(&mut buf).unwrap() {
            calls.push(decode(frame));
        }
    }
    assert!(buf.is_empty());
    assert!(parser.is_idle());
    calls
}

fn same(a: &[Call], b: &[Call]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|pair| match pair {
            (Call::Request(i1, m1, p1), Call::Request(i2, m2, p2)) => {
                i1 == i2 && m1 == m2 && p1 == p2
            }
            (Call::Notification(m1, p1), Call::Notification(m2, p2)) => m1 == m2 && p1 == p2,
            _ => false,
        })
}

proptest! {
    #[test]
    fn chunked_stream_decodes_like_one_shot(
        calls in proptest::collection::vec(arb_call(), 1..6),
        raw_cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..12),
    ) {
        let stream = encode(&calls);
        let mut cuts: Vec<usize> = raw_cuts.iter().map(|i| i.index(stream.len())).collect();
        cuts.sort_unstable();

        let one_shot = parse_chunked(&stream, &[]);
        let chunked = parse_chunked(&stream, &cuts);

        prop_assert!(same(&one_shot, &calls));
        prop_assert!(same(&chunked, &one_shot));
    }

    #[test]
    fn byte_at_a_time_matches_one_shot(call in arb_call()) {
        let stream = encode(std::slice::from_ref(&call));
        let cuts: Vec<usize> = (1..stream.len()).collect();
        prop_assert!(same(&parse_chunked(&stream, &cuts), &[call]));
    }

    #[test]
    fn garbage_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
        let mut parser = FrameParser::new(ParserRole::Server, ParserLimits::default());
        let mut buf = BytesMut::from(&bytes[..]);
        // errors are fine; panics and infinite loops are not
        while let Ok(Some(_)) = parser.parse(&mut buf) {}
    }
}
