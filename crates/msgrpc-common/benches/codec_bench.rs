// Criterion benchmarks for the msgrpc framing codec
//
// Run benchmarks with:
//   cargo bench -p msgrpc-common
//
// Compare against a saved baseline:
//   cargo bench -p msgrpc-common -- --save-baseline main

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use msgrpc_common::codec::{encode_request, encode_request_into, FrameParser, ParserLimits, ParserRole};
use rmpv::Value;

fn sample_params(n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| {
            Value::Map(vec![
                (Value::from("index"), Value::from(i as u64)),
                (Value::from("name"), Value::from(format!("item-{}", i))),
            ])
        })
        .collect()
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_request");

    for n in [1usize, 16, 256] {
        let params = sample_params(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &params, |b, params| {
            let mut buf = Vec::with_capacity(4096);
            b.iter(|| {
                buf.clear();
                encode_request_into(&mut buf, black_box(42), "bench.method", params).unwrap();
            });
        });
    }

    group.finish();
}

fn parse_all(frame: &[u8], chunk: usize, parser: &mut FrameParser, buf: &mut BytesMut) -> usize {
    let mut frames = 0;
    for piece in frame.chunks(chunk) {
        buf.extend_from_slice(piece);
        while let Ok(Some(_)) = parser.parse(buf) {
            frames += 1;
        }
    }
    frames
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_request");
    let frame = encode_request(42, "bench.method", &sample_params(64)).unwrap();
    group.throughput(Throughput::Bytes(frame.len() as u64));

    for chunk in [frame.len(), 512, 64, 2] {
        let label = if chunk == frame.len() {
            "one_shot".to_string()
        } else {
            format!("chunks_of_{}", chunk)
        };
        group.bench_function(label, |b| {
            let mut parser = FrameParser::new(ParserRole::Server, ParserLimits::default());
            let mut buf = BytesMut::with_capacity(frame.len());
            b.iter(|| parse_all(black_box(&frame), chunk, &mut parser, &mut buf));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_parse);
criterion_main!(benches);
