//! Codec benchmarks for parley-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use parley_protocol::{codec, ChatMessage, DeliveryStatus, Frame};

fn sample_frame(content_len: usize) -> Frame {
    Frame::receive_message(ChatMessage {
        id: 1,
        from: "alice".into(),
        to: "bob".into(),
        content: "x".repeat(content_len),
        timestamp: 1_700_000_000_000,
        status: DeliveryStatus::Delivered,
    })
}

fn bench_encode_small(c: &mut Criterion) {
    let frame = sample_frame(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("small_64B", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.bench_function("json_64B", |b| {
        b.iter(|| codec::encode_json(black_box(&frame)))
    });
    group.finish();
}

fn bench_decode_small(c: &mut Criterion) {
    let frame = sample_frame(64);
    let encoded = codec::encode(&frame).unwrap();
    let text = codec::encode_json(&frame).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("small_64B", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.bench_function("json_64B", |b| {
        b.iter(|| codec::decode_json(black_box(&text)))
    });
    group.finish();
}

fn bench_roundtrip(c: &mut Criterion) {
    let frame = sample_frame(256);

    c.bench_function("roundtrip_256B", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&frame)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_small,
    bench_decode_small,
    bench_roundtrip
);
criterion_main!(benches);
