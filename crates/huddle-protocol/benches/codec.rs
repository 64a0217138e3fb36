//! Codec benchmarks for huddle-protocol.

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use huddle_protocol::{codec, Message, ServerFrame};

fn chat_frame(len: usize) -> ServerFrame {
    ServerFrame::message(Message::new(
        "0192f3a4-0000-7000-8000-000000000000".into(),
        "Alice",
        "x".repeat(len),
        Utc::now(),
    ))
}

fn bench_encode(c: &mut Criterion) {
    let frame = chat_frame(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("msgpack_64B", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.bench_function("json_64B", |b| {
        b.iter(|| codec::encode_json(black_box(&frame)))
    });
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let frame = chat_frame(64);
    let encoded = codec::encode(&frame).unwrap();
    let text = codec::encode_json(&frame).unwrap();

    let mut group = c.benchmark_group("decode");
    group.bench_function("msgpack_64B", |b| {
        b.iter(|| codec::decode::<ServerFrame>(black_box(&encoded)))
    });
    group.bench_function("json_64B", |b| {
        b.iter(|| codec::decode_json::<ServerFrame>(black_box(&text)))
    });
    group.finish();
}

fn bench_replay(c: &mut Criterion) {
    let messages: Vec<Message> = (0..1000)
        .map(|i| Message::new(format!("m-{i}").into(), "Alice", "hello there", Utc::now()))
        .collect();
    let frame = ServerFrame::Replay { messages };

    c.bench_function("replay_1000_json", |b| {
        b.iter(|| codec::encode_json(black_box(&frame)).unwrap())
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_replay);
criterion_main!(benches);
