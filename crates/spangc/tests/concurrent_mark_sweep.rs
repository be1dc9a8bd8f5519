//! Several mutators allocate and rewire object graphs while cycles start
//! on their own and background workers mark concurrently.

use std::sync::{Arc, Barrier};
use std::thread;

use spangc::{Address, GcConfig, Heap, Mutator, StaticRoots};

const THREADS: usize = 4;
const LIST_LEN: usize = 2000;

/// `value` is stored odd so it never looks like a heap pointer.
const fn tag(value: usize) -> Address {
    Address::from_usize(value * 2 + 1)
}

fn walk(mutator: &Mutator, head: Address) -> Vec<usize> {
    let mut values = Vec::new();
    let mut node = head;
    while !node.is_null() {
        values.push((mutator.load_pointer(node, 8).as_usize() - 1) / 2);
        node = mutator.load_pointer(node, 0);
    }
    values
}

fn busy_config() -> GcConfig {
    let mut config = GcConfig::new();
    config
        .set_gc_percent(100)
        .set_heap_minimum(256 << 10)
        .set_procs(THREADS)
        .set_mark_workers(2)
        .set_force_gc_period(None);
    config
}

#[test]
fn test_reachable_lists_survive_concurrent_cycles() {
    let roots = Arc::new(StaticRoots::new());
    let heap = Arc::new(Heap::new(busy_config(), roots.clone()).unwrap());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let (heap, roots, barrier) = (Arc::clone(&heap), Arc::clone(&roots), Arc::clone(&barrier));
            thread::spawn(move || {
                let mut mutator = heap.mutator();
                let root = roots.add(Address::NULL);
                barrier.wait();

                // Push-front a list, dropping garbage between nodes. The new
                // head is rooted before the next allocation.
                for i in 0..LIST_LEN {
                    let node = mutator.allocate(32, true).unwrap();
                    mutator.store_pointer(node, 8, tag(t * LIST_LEN + i));
                    let head = roots.get(root).unwrap_or(Address::NULL);
                    mutator.store_pointer(node, 0, head);
                    roots.set(root, node);

                    for _ in 0..8 {
                        mutator.allocate(96, false).unwrap();
                    }
                }

                // Unlink every other node while cycles keep running.
                let mut node = roots.get(root).unwrap_or(Address::NULL);
                while !node.is_null() {
                    let next = mutator.load_pointer(node, 0);
                    if next.is_null() {
                        break;
                    }
                    let after = mutator.load_pointer(next, 0);
                    mutator.store_pointer(node, 0, after);
                    mutator.allocate(64, false).unwrap();
                    node = after;
                }

                let values = walk(&mutator, roots.get(root).unwrap_or(Address::NULL));
                (root, values)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(heap.cycles() > 0, "no cycle ran during the test");

    let mut mutator = heap.mutator();
    mutator.force_gc(true);
    heap.finish_sweep();

    for (t, (root, values)) in results.into_iter().enumerate() {
        let expected: Vec<usize> = (0..LIST_LEN).rev().step_by(2).map(|i| t * LIST_LEN + i).collect();
        assert_eq!(values, expected, "list of thread {t} was damaged while marking");

        let head = roots.get(root).unwrap();
        assert_eq!(walk(&mutator, head), expected, "list of thread {t} was damaged by sweeping");
        roots.remove(root);
    }
}

#[test]
fn test_stats_balance_after_concurrent_churn() {
    let roots = Arc::new(StaticRoots::new());
    let heap = Arc::new(Heap::new(busy_config(), roots.clone()).unwrap());

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let (heap, roots) = (Arc::clone(&heap), Arc::clone(&roots));
            thread::spawn(move || {
                let mut mutator = heap.mutator();
                let mut kept = Vec::new();
                for i in 0..20_000usize {
                    let size = 16 + (i * 37 + t * 11) % 2000;
                    let addr = mutator.allocate(size, true).unwrap();
                    if i % 100 == 0 {
                        kept.push(roots.add(addr));
                    }
                }
                kept
            })
        })
        .collect();
    let kept: Vec<_> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();

    {
        let mut mutator = heap.mutator();
        mutator.force_gc(true);
    }
    heap.finish_sweep();

    let stats = heap.mem_stats();
    assert_eq!(stats.total_alloc - stats.total_freed, heap.in_use_object_bytes());
    assert_eq!(stats.mallocs, (THREADS * 20_000) as u64);
    assert!(stats.mallocs - stats.frees >= kept.len() as u64);
    assert!(stats.num_gc >= 1);
    for id in kept {
        roots.remove(id);
    }
}

#[test]
fn test_threads_can_force_cycles_together() {
    let roots = Arc::new(StaticRoots::new());
    let heap = Arc::new(Heap::new(busy_config(), roots).unwrap());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let (heap, barrier) = (Arc::clone(&heap), Arc::clone(&barrier));
            thread::spawn(move || {
                let mut mutator = heap.mutator();
                barrier.wait();
                for _ in 0..5 {
                    for _ in 0..200 {
                        mutator.allocate(128, false).unwrap();
                    }
                    let before = heap.cycles();
                    mutator.force_gc(true);
                    assert!(heap.cycles() > before);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(heap.cycles() >= 5);
}
