//! Frame ring buffer throughput
//!
//! The receiver pushes every 5 ms frame through the shared queue, so
//! push/pop must stay far below a frame period even under contention.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;

use lan_audio_relay::audio::{EncodedFrame, FrameQueue, FrameRing};

fn frame(sequence: u64) -> EncodedFrame {
    EncodedFrame::new(
        Bytes::from_static(&[0u8; 160]),
        sequence,
        Duration::from_millis(5),
    )
}

fn bench_ring_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_ring");

    group.bench_function("push_pop", |b| {
        let mut ring = FrameRing::with_capacity(64);
        let mut sequence = 0u64;

        b.iter(|| {
            ring.push(frame(sequence));
            sequence += 1;
            black_box(ring.pop());
        });
    });

    group.bench_function("push_overwrite_full", |b| {
        let mut ring = FrameRing::with_capacity(64);
        for n in 0..64 {
            ring.push(frame(n));
        }
        let mut sequence = 64u64;

        b.iter(|| {
            black_box(ring.push(frame(sequence)));
            sequence += 1;
        });
    });

    group.bench_function("push_bulk_16", |b| {
        let mut ring = FrameRing::with_capacity(64);

        b.iter(|| {
            let batch: Vec<EncodedFrame> = (0..16).map(frame).collect();
            black_box(ring.push_bulk(batch));
            black_box(ring.pop_bulk(16));
        });
    });

    group.bench_function("shared_queue_push_pop", |b| {
        let queue = FrameQueue::new(64);
        let mut sequence = 0u64;

        b.iter(|| {
            queue.push(frame(sequence));
            sequence += 1;
            black_box(queue.pop());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_ring_operations);
criterion_main!(benches);
