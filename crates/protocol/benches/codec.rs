//! Benchmarks for the packet codec
//!
//! Measures command encoding, response decoding (plain and CRC-checked) and
//! stream chunk parsing at the full 16 KiB chunk size.

use bytes::Bytes;
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use protocol::stream::{encode_imu, parse_frame_chunk, parse_imu};
use protocol::{
    CameraSide, CommandPacket, ResponsePacket, Status, StereoFrameChunk, decode_response,
};
use std::time::Instant;

fn benchmark_commands(c: &mut Criterion) {
    let mut group = c.benchmark_group("commands");

    let trigger = CommandPacket::stereo_trigger();
    group.bench_function("encode_long13", |b| b.iter(|| black_box(&trigger).encode()));

    let framed = CommandPacket::framed(0x20, vec![0xAB; 64]).unwrap();
    group.bench_function("encode_framed_64", |b| b.iter(|| black_box(&framed).encode()));

    group.finish();
}

fn benchmark_responses(c: &mut Criterion) {
    let mut group = c.benchmark_group("responses");

    let plain = ResponsePacket::new(0xED, Status::Success, &b"P6SPIH53200369\0\0"[..]).encode();
    group.bench_function("decode_plain", |b| {
        b.iter(|| decode_response(black_box(&plain)))
    });

    let framed =
        ResponsePacket::new_framed(0xED, Status::Success, &b"P6SPIH53200369\0\0"[..]).encode();
    group.bench_function("decode_framed", |b| {
        b.iter(|| decode_response(black_box(&framed)))
    });

    group.finish();
}

fn benchmark_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream");

    let imu = encode_imu(1, &[0.5; 15]);
    group.throughput(Throughput::Bytes(imu.len() as u64));
    group.bench_function("parse_imu", |b| {
        b.iter(|| parse_imu(black_box(&imu), Instant::now()))
    });

    let frame = StereoFrameChunk {
        packet_id: 1,
        frame_number: 100,
        side: CameraSide::Left,
        payload: Bytes::from(vec![0x11; 16376]),
    }
    .encode();
    group.throughput(Throughput::Bytes(frame.len() as u64));
    group.bench_function("parse_frame_16k", |b| {
        b.iter(|| parse_frame_chunk(black_box(frame.clone())))
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_commands,
    benchmark_responses,
    benchmark_stream
);
criterion_main!(benches);
