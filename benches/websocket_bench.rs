//! Benchmarks for sockudo-wire parsing and framing
//!
//! Run with: cargo bench

use bytes::{Bytes, BytesMut};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use sockudo_wire::Config;
use sockudo_wire::frame::{FrameParser, OpCode, OutgoingFrame, encode_frame};
use sockudo_wire::http::{HttpMode, HttpParser};
use sockudo_wire::mask::{MaskRng, apply_mask};
use sockudo_wire::protocol::{Protocol, Role};
use sockudo_wire::utf8::validate_utf8;

const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

/// Benchmark mask application
fn bench_mask(c: &mut Criterion) {
    let mut group = c.benchmark_group("mask");

    for size in [64, 1024, 16384, 65536] {
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("apply_mask", size), &size, |b, &size| {
            let mut data = vec![0x42u8; size];
            b.iter(|| apply_mask(black_box(&mut data), black_box(MASK)));
        });
    }

    group.finish();
}

/// Benchmark UTF-8 validation
fn bench_utf8(c: &mut Criterion) {
    let mut group = c.benchmark_group("utf8");

    for size in [64, 1024, 16384] {
        let ascii = "a".repeat(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("ascii", size), &ascii, |b, data| {
            b.iter(|| validate_utf8(black_box(data.as_bytes())));
        });
    }

    let mixed = "Hello, 世界! 🎉 ".repeat(64);
    group.throughput(Throughput::Bytes(mixed.len() as u64));
    group.bench_with_input(BenchmarkId::new("mixed", mixed.len()), &mixed, |b, data| {
        b.iter(|| validate_utf8(black_box(data.as_bytes())));
    });

    group.finish();
}

/// Benchmark header decoding and full server-side receive
fn bench_receive(c: &mut Criterion) {
    let mut group = c.benchmark_group("receive");

    for size in [8, 256, 4096, 65536] {
        let payload: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Binary, &payload, true, Some(MASK));
        let frame = buf.freeze();
        group.throughput(Throughput::Bytes(frame.len() as u64));

        group.bench_with_input(BenchmarkId::new("header", size), &frame, |b, data| {
            let mut parser = FrameParser::new(true);
            b.iter(|| {
                let mut input: &[u8] = black_box(data);
                parser.parse_header(&mut input)
            });
        });

        group.bench_with_input(BenchmarkId::new("message", size), &frame, |b, data| {
            let config = Config::default();
            let mut protocol = Protocol::with_rng(Role::Server, &config, MaskRng::from_seed(1));
            protocol.open();
            let mut effects = Vec::new();
            b.iter(|| {
                let mut input: &[u8] = black_box(data);
                while !input.is_empty() {
                    let _ = protocol.receive(&mut input, &mut effects);
                }
                effects.clear();
            });
        });
    }

    group.finish();
}

/// Benchmark frame encoding
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for size in [8, 256, 4096, 16384] {
        let payload = Bytes::from((0..size).map(|i| (i % 256) as u8).collect::<Vec<u8>>());
        let frame = OutgoingFrame::binary(vec![payload]);
        group.throughput(Throughput::Bytes(size as u64));

        // Server: header plus the caller's buffer
        group.bench_with_input(BenchmarkId::new("unmasked", size), &frame, |b, frame| {
            let mut out = Vec::with_capacity(2);
            b.iter(|| {
                out.clear();
                frame.encode_into(None, black_box(&mut out));
            });
        });

        // Client: copy and mask
        group.bench_with_input(BenchmarkId::new("masked", size), &frame, |b, frame| {
            let mut out = Vec::with_capacity(1);
            b.iter(|| {
                out.clear();
                frame.encode_into(Some(MASK), black_box(&mut out));
            });
        });
    }

    group.finish();
}

/// Benchmark HTTP parsing at different chunk sizes
fn bench_http(c: &mut Criterion) {
    let request = b"GET /chat HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Protocol: chat, superchat\r\n\
        Sec-WebSocket-Version: 13\r\n\
        Origin: http://example.com\r\n\r\n";

    let mut group = c.benchmark_group("http");
    group.throughput(Throughput::Bytes(request.len() as u64));

    for chunk in [1, 16, request.len()] {
        group.bench_with_input(BenchmarkId::new("request", chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut parser = HttpParser::new(HttpMode::Request);
                for piece in request.chunks(chunk) {
                    parser.execute(black_box(piece), &mut ());
                }
                parser.is_upgrade()
            });
        });
    }

    group.finish();
}

/// Benchmark handshake key generation
fn bench_handshake(c: &mut Criterion) {
    use sockudo_wire::handshake::{generate_accept_key, generate_key};

    let mut group = c.benchmark_group("handshake");

    group.bench_function("generate_key", |b| {
        let mut rng = MaskRng::new();
        b.iter(|| generate_key(&mut rng));
    });

    group.bench_function("generate_accept_key", |b| {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        b.iter(|| generate_accept_key(black_box(key)));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_mask,
    bench_utf8,
    bench_receive,
    bench_encode,
    bench_http,
    bench_handshake,
);

criterion_main!(benches);
