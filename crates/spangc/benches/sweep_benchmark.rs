//! Benchmark: cycle cost over garbage, and lazy against eager sweeping.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use spangc::{GcConfig, Heap, StaticRoots};
use std::hint::black_box;
use std::sync::Arc;

fn manual_config() -> GcConfig {
    let mut config = GcConfig::new();
    config
        .set_gc_percent(-1)
        .set_procs(2)
        .set_mark_workers(1)
        .set_background_sweep(false)
        .set_force_gc_period(None);
    config
}

fn bench_collect_garbage(c: &mut Criterion) {
    let mut group = c.benchmark_group("collect_garbage");
    for objects in [1_000usize, 10_000, 100_000] {
        let heap = Heap::new(manual_config(), Arc::new(StaticRoots::new())).unwrap();
        let mut mutator = heap.mutator();
        group.bench_function(format!("{objects}_objects"), |b| {
            b.iter(|| {
                for _ in 0..objects {
                    black_box(mutator.allocate(32, true).unwrap());
                }
                mutator.force_gc(true);
                heap.finish_sweep();
            });
        });
    }
    group.finish();
}

fn bench_mark_live_list(c: &mut Criterion) {
    let roots = Arc::new(StaticRoots::new());
    let heap = Heap::new(manual_config(), roots.clone()).unwrap();
    let mut mutator = heap.mutator();

    let head = mutator.allocate(32, true).unwrap();
    let root = roots.add(head);
    let mut prev = head;
    for _ in 0..50_000 {
        let node = mutator.allocate(32, true).unwrap();
        mutator.store_pointer(prev, 0, node);
        prev = node;
    }

    c.bench_function("mark_live_list_50000", |b| {
        b.iter(|| {
            mutator.force_gc(true);
            heap.finish_sweep();
        });
    });
    roots.remove(root);
}

fn bench_lazy_vs_eager_sweep(c: &mut Criterion) {
    let heap = Heap::new(manual_config(), Arc::new(StaticRoots::new())).unwrap();
    let mut mutator = heap.mutator();

    let mut group = c.benchmark_group("sweep");
    group.bench_function("eager_finish_sweep", |b| {
        b.iter_batched(
            || {
                for _ in 0..20_000 {
                    mutator.allocate_noscan(64, false).unwrap();
                }
                mutator.force_gc(true);
            },
            |()| heap.finish_sweep(),
            BatchSize::PerIteration,
        );
    });
    group.bench_function("lazy_sweep_one", |b| {
        b.iter_batched(
            || {
                for _ in 0..20_000 {
                    mutator.allocate_noscan(64, false).unwrap();
                }
                mutator.force_gc(true);
            },
            |()| while black_box(heap.sweep_one()).is_some() {},
            BatchSize::PerIteration,
        );
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_collect_garbage,
    bench_mark_live_list,
    bench_lazy_vs_eager_sweep
);
criterion_main!(benches);
