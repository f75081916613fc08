//! Throughput benchmarks

use benchlink_core::core::capture::{ChannelOrder, RawFrame};
use benchlink_core::core::serial::LineReader;
use benchlink_core::{EventBus, Topic};
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn bus_benchmark(c: &mut Criterion) {
    const BATCH: u64 = 1_000;

    let bus = EventBus::new();
    let seen = Arc::new(AtomicU64::new(0));
    for _ in 0..2 {
        let seen = seen.clone();
        bus.subscribe(Topic::LogLine, move |event| {
            if event.as_log_line().is_some() {
                seen.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    let mut group = c.benchmark_group("bus");
    group.throughput(Throughput::Elements(BATCH));

    group.bench_function("publish_dispatch_1k", |b| {
        b.iter(|| {
            for i in 0..BATCH {
                bus.publish_log(format!("[COM3] line {i}"));
            }
            assert!(bus.flush(Duration::from_secs(5)));
        })
    });

    group.finish();
    bus.shutdown();
    black_box(seen.load(Ordering::Relaxed));
}

fn line_benchmark(c: &mut Criterion) {
    let data: Vec<u8> = (0..64)
        .flat_map(|i| format!("T={i}.5 H=40.{i} PONG RFBOX v3\r\n").into_bytes())
        .collect();

    let mut group = c.benchmark_group("lines");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("split_lines", |b| {
        b.iter(|| {
            let mut reader = LineReader::new(b'\n');
            reader.push(black_box(&data));
            let mut count = 0;
            while let Some(line) = reader.next_line() {
                count += line.len();
            }
            black_box(count)
        })
    });

    group.finish();
}

fn frame_benchmark(c: &mut Criterion) {
    let (width, height) = (640u32, 480u32);
    let data: Vec<u8> = (0..width * height * 3).map(|i| (i % 251) as u8).collect();

    let mut group = c.benchmark_group("frames");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("normalize_bgr_bottom_up_vga", |b| {
        b.iter(|| {
            let raw = RawFrame {
                width,
                height,
                data: data.clone(),
                order: ChannelOrder::Bgr,
                bottom_up: true,
            };
            black_box(raw.normalize(0).map(|frame| frame.width()))
        })
    });

    group.finish();
}

criterion_group!(benches, bus_benchmark, line_benchmark, frame_benchmark);
criterion_main!(benches);
