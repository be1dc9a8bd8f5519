//! Benchmark: allocation throughput through the thread cache, the central
//! lists and the page heap.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use spangc::{GcConfig, Heap, StaticRoots};
use std::hint::black_box;
use std::sync::Arc;
use std::thread;

fn bench_config(gc_percent: i32) -> GcConfig {
    let mut config = GcConfig::new();
    config
        .set_gc_percent(gc_percent)
        .set_procs(4)
        .set_force_gc_period(None);
    config
}

fn bench_small_alloc(c: &mut Criterion) {
    let heap = Heap::new(bench_config(100), Arc::new(StaticRoots::new())).unwrap();
    let mut mutator = heap.mutator();

    let mut group = c.benchmark_group("small_alloc");
    for size in [16usize, 64, 512, 4096] {
        group.throughput(Throughput::Elements(1000));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                for _ in 0..1000 {
                    black_box(mutator.allocate(size, false).unwrap());
                }
            });
        });
    }
    group.finish();
}

fn bench_noscan_alloc(c: &mut Criterion) {
    let heap = Heap::new(bench_config(100), Arc::new(StaticRoots::new())).unwrap();
    let mut mutator = heap.mutator();

    c.bench_function("noscan_alloc_64", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                black_box(mutator.allocate_noscan(64, false).unwrap());
            }
        });
    });
}

fn bench_large_alloc(c: &mut Criterion) {
    let heap = Heap::new(bench_config(100), Arc::new(StaticRoots::new())).unwrap();
    let mut mutator = heap.mutator();

    c.bench_function("large_alloc_64k", |b| {
        b.iter(|| black_box(mutator.allocate_noscan(64 << 10, false).unwrap()));
    });
}

fn bench_contended_alloc(c: &mut Criterion) {
    let heap = Arc::new(Heap::new(bench_config(100), Arc::new(StaticRoots::new())).unwrap());

    c.bench_function("contended_alloc_4_threads", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let heap = Arc::clone(&heap);
                    thread::spawn(move || {
                        let mut mutator = heap.mutator();
                        for _ in 0..5000 {
                            black_box(mutator.allocate(48, false).unwrap());
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        });
    });
}

criterion_group!(
    benches,
    bench_small_alloc,
    bench_noscan_alloc,
    bench_large_alloc,
    bench_contended_alloc
);
criterion_main!(benches);
