//! Criterion benchmarks for ARQ engine throughput and the wire codec.

use bytes::{Bytes, BytesMut};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use tether::protocol::{constants, Segment};
use tether::tether_core::{ArqConfig, ArqEngine, DelayConfig};

fn bench_config() -> ArqConfig {
    ArqConfig {
        snd_wnd: 128,
        rcv_wnd: 128,
        send_backlog: 1024,
        delay: DelayConfig::fast(),
        ..ArqConfig::default()
    }
}

/// Perfect transfer: all packets from src delivered to dst.
fn transfer(src: &mut ArqEngine, dst: &mut ArqEngine) {
    for packet in src.drain_output() {
        let _ = dst.input(packet);
    }
}

/// Run bidirectional update/flush/transfer rounds, draining the receiver
/// each round to keep the receive window open.
fn run_rounds(a: &mut ArqEngine, b: &mut ArqEngine, rounds: usize) -> usize {
    let mut received = 0;
    for _ in 0..rounds {
        let _ = a.update();
        let _ = a.flush();
        transfer(a, b);

        while b.recv().is_some() {
            received += 1;
        }

        let _ = b.update();
        let _ = b.flush();
        transfer(b, a);
    }
    received
}

/// Drain all receivable messages.
fn drain_recv(engine: &mut ArqEngine) -> usize {
    let mut count = 0;
    while engine.recv().is_some() {
        count += 1;
    }
    count
}

fn engine_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_throughput");

    for &msg_count in &[10, 100, 500] {
        let msg_size = 1024;
        group.throughput(Throughput::Bytes((msg_count * msg_size) as u64));

        group.bench_with_input(
            BenchmarkId::new("1KB_messages", msg_count),
            &msg_count,
            |b, &count| {
                b.iter(|| {
                    let mut tx = ArqEngine::new(0x7E7E_0001, bench_config());
                    let mut rx = ArqEngine::new(0x7E7E_0001, bench_config());

                    let payload = Bytes::from(vec![0xABu8; msg_size]);
                    for _ in 0..count {
                        tx.send(payload.clone()).unwrap();
                    }
                    tx.flush().unwrap();

                    let mut received = run_rounds(&mut tx, &mut rx, count * 2);
                    received += drain_recv(&mut rx);
                    assert_eq!(received, count);
                });
            },
        );
    }

    group.finish();
}

fn engine_small_messages(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_small_messages");
    let msg_count = 1000;
    let msg_size = 64;
    group.throughput(Throughput::Elements(msg_count as u64));

    group.bench_function("64B_x_1000", |b| {
        b.iter(|| {
            let mut tx = ArqEngine::new(0x7E7E_0002, bench_config());
            let mut rx = ArqEngine::new(0x7E7E_0002, bench_config());

            let payload = Bytes::from(vec![0xCDu8; msg_size]);
            for _ in 0..msg_count {
                tx.send(payload.clone()).unwrap();
            }
            tx.flush().unwrap();

            let mut received = run_rounds(&mut tx, &mut rx, msg_count * 2);
            received += drain_recv(&mut rx);
            assert_eq!(received, msg_count);
        });
    });

    group.finish();
}

fn engine_large_message(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_large_message");

    for &size_kb in &[16, 64] {
        let size = size_kb * 1024;
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(
            BenchmarkId::new("single_message", format!("{}KB", size_kb)),
            &size,
            |b, &sz| {
                b.iter(|| {
                    let config = ArqConfig {
                        snd_wnd: 256,
                        rcv_wnd: 256,
                        ..bench_config()
                    };
                    let mut tx = ArqEngine::new(0x7E7E_0003, config.clone());
                    let mut rx = ArqEngine::new(0x7E7E_0003, config);

                    let payload: Vec<u8> = (0..sz).map(|i| (i % 256) as u8).collect();
                    tx.send(Bytes::from(payload)).unwrap();
                    tx.flush().unwrap();

                    let mut received = run_rounds(&mut tx, &mut rx, 200);
                    received += drain_recv(&mut rx);
                    assert_eq!(received, 1);
                });
            },
        );
    }

    group.finish();
}

fn wire_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire_codec");
    let payload_size = 1024usize;
    group.throughput(Throughput::Bytes(
        (payload_size as u32 + constants::OVERHEAD) as u64,
    ));

    let seg = Segment::push(
        0x7E7E_0004,
        42,
        0,
        Bytes::from(vec![0xEFu8; payload_size]),
    );

    group.bench_function("encode_1KB_push", |b| {
        b.iter(|| {
            let mut buf = BytesMut::with_capacity(seg.wire_size());
            seg.encode(&mut buf);
            black_box(buf.freeze())
        });
    });

    let mut encoded = BytesMut::with_capacity(seg.wire_size());
    seg.encode(&mut encoded);
    let encoded = encoded.freeze();

    group.bench_function("decode_1KB_push", |b| {
        b.iter(|| {
            let mut wire = encoded.clone();
            black_box(Segment::decode(&mut wire).unwrap())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    engine_throughput,
    engine_small_messages,
    engine_large_message,
    wire_codec
);
criterion_main!(benches);
