//! Benchmarks for frame transport: heap allocation and packet hand-off
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use facefilter_live::backend::{Connection, ConnectionPacket, FrameId, WeakHeap};
use facefilter_live::types::FrameImage;
use std::sync::Arc;
use std::time::Duration;

const RESOLUTIONS: [(u32, u32); 3] = [(320, 240), (640, 480), (1280, 720)];

fn bench_heap_store_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap_store_release");
    let heap = WeakHeap::new(64 * 1024 * 1024);

    for (w, h) in RESOLUTIONS {
        let frame = vec![128u8; (w * h * 3) as usize];
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(format!("{}x{}", w, h)), &frame, |b, frame| {
            b.iter(|| {
                let handle = heap.store(black_box(frame)).unwrap();
                heap.release(handle).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_heap_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap_read");
    let heap = WeakHeap::new(64 * 1024 * 1024);

    for (w, h) in RESOLUTIONS {
        let len = (w * h * 3) as usize;
        let handle = heap.store(&vec![7u8; len]).unwrap();
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_function(BenchmarkId::from_parameter(format!("{}x{}", w, h)), |b| {
            b.iter(|| black_box(heap.read(handle).unwrap()));
        });
        heap.release(handle).unwrap();
    }
    group.finish();
}

fn bench_connection_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("connection_round_trip");
    let heap = Arc::new(WeakHeap::new(64 * 1024 * 1024));
    let conn = Connection::new("bench");
    let frame = FrameImage::filled(640, 480, 3, 64);

    group.bench_function("write_read_640x480", |b| {
        b.iter(|| {
            let mut packet = ConnectionPacket::new(&heap, FrameId::next());
            packet.set_image("frame", &frame).unwrap();
            conn.write(packet);
            black_box(conn.read(Duration::from_millis(1)).unwrap());
        });
    });

    group.bench_function("is_full", |b| {
        conn.write(ConnectionPacket::new(&heap, FrameId::next()));
        b.iter(|| black_box(conn.is_full(black_box(1))));
        conn.clear();
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_heap_store_release,
    bench_heap_read,
    bench_connection_round_trip
);
criterion_main!(benches);
