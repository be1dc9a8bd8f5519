//! Mark-sweep behaviour seen through a single mutator: reachability,
//! the write barrier, black allocation and sweeping.

use std::sync::Arc;

use spangc::{Address, GcConfig, GcPhase, Heap, StaticRoots};

/// No automatic cycles and no background helpers unless a test asks.
fn manual_config(mark_workers: usize) -> GcConfig {
    let mut config = GcConfig::new();
    config
        .set_gc_percent(-1)
        .set_procs(2)
        .set_mark_workers(mark_workers)
        .set_background_sweep(false)
        .set_force_gc_period(None);
    config
}

fn new_heap(config: GcConfig) -> (Heap, Arc<StaticRoots>) {
    let roots = Arc::new(StaticRoots::new());
    let heap = Heap::new(config, roots.clone()).unwrap();
    (heap, roots)
}

#[test]
fn test_unreachable_objects_are_freed() {
    let (heap, roots) = new_heap(manual_config(1));
    let mut mutator = heap.mutator();

    let kept = mutator.allocate(32, true).unwrap();
    let root = roots.add(kept);
    let garbage: Vec<Address> = (0..100).map(|_| mutator.allocate(32, true).unwrap()).collect();

    mutator.force_gc(true);
    heap.finish_sweep();

    assert_eq!(heap.cycles(), 1);
    assert_eq!(heap.phase(), GcPhase::Off);
    assert!(heap.is_allocated(kept));
    for addr in garbage {
        assert!(!heap.is_allocated(addr), "{addr} survived without a path from the roots");
    }
    roots.remove(root);
}

#[test]
fn test_objects_reachable_through_pointers_survive() {
    let (heap, roots) = new_heap(manual_config(2));
    let mut mutator = heap.mutator();

    // head -> n1 -> n2 -> ... -> n49
    let head = mutator.allocate(32, true).unwrap();
    let root = roots.add(head);
    let mut nodes = vec![head];
    for i in 1..50usize {
        let node = mutator.allocate(32, true).unwrap();
        mutator.store_pointer(node, 8, Address::from_usize(i * 2 + 1));
        let prev = nodes[i - 1];
        mutator.store_pointer(prev, 0, node);
        nodes.push(node);
    }

    mutator.force_gc(true);
    heap.finish_sweep();
    for (i, &node) in nodes.iter().enumerate().skip(1) {
        assert!(heap.is_allocated(node));
        assert_eq!(mutator.load_pointer(node, 8), Address::from_usize(i * 2 + 1));
    }

    // Cutting the chain in the middle frees the tail only.
    mutator.store_pointer(nodes[24], 0, Address::NULL);
    mutator.force_gc(true);
    heap.finish_sweep();
    assert!(nodes[..25].iter().all(|&n| heap.is_allocated(n)));
    assert!(nodes[25..].iter().all(|&n| !heap.is_allocated(n)));
    roots.remove(root);
}

#[test]
fn test_cycles_are_collected() {
    let (heap, _roots) = new_heap(manual_config(1));
    let mut mutator = heap.mutator();

    let a = mutator.allocate(48, true).unwrap();
    let b = mutator.allocate(48, true).unwrap();
    mutator.store_pointer(a, 0, b);
    mutator.store_pointer(b, 0, a);

    mutator.force_gc(true);
    heap.finish_sweep();
    assert!(!heap.is_allocated(a));
    assert!(!heap.is_allocated(b));
}

#[test]
fn test_noscan_objects_do_not_keep_others_alive() {
    let (heap, roots) = new_heap(manual_config(1));
    let mut mutator = heap.mutator();

    let target = mutator.allocate(32, true).unwrap();
    let holder = mutator.allocate_noscan(32, true).unwrap();
    let root = roots.add(holder);
    mutator.store_pointer(holder, 0, target);

    mutator.force_gc(true);
    heap.finish_sweep();
    assert!(heap.is_allocated(holder));
    assert!(!heap.is_allocated(target));
    roots.remove(root);
}

#[test]
fn test_thread_stack_regions_are_roots() {
    let (heap, roots) = new_heap(manual_config(1));
    let mut mutator = heap.mutator();

    let obj = mutator.allocate(64, true).unwrap();
    let stack: Box<[usize; 4]> = Box::new([0, obj.as_usize(), 7, 0]);
    // SAFETY: `stack` outlives the registration.
    let region = unsafe { roots.register_region(stack.as_ptr().cast(), std::mem::size_of_val(&*stack)) };

    mutator.force_gc(true);
    heap.finish_sweep();
    assert!(heap.is_allocated(obj));

    roots.unregister_region(region);
    mutator.force_gc(true);
    heap.finish_sweep();
    assert!(!heap.is_allocated(obj));
}

/// A pointer overwritten during marking keeps its old referent alive for
/// the rest of the cycle, even though nothing reaches it any more.
#[test]
fn test_write_barrier_shades_overwritten_referent() {
    let (heap, roots) = new_heap(manual_config(0));
    let mut mutator = heap.mutator();

    let a = mutator.allocate(32, true).unwrap();
    let b = mutator.allocate(32, true).unwrap();
    let c = mutator.allocate(32, true).unwrap();
    let root = roots.add(a);
    mutator.store_pointer(a, 0, b);

    assert!(mutator.start_gc());
    assert_eq!(heap.phase(), GcPhase::Mark);
    // Only the roots were shaded in the start pause.
    assert!(heap.is_marked(a));
    assert!(!heap.is_marked(b));
    assert!(!heap.is_marked(c));

    mutator.store_pointer(a, 0, c);
    assert!(heap.is_marked(b), "overwritten referent must be shaded");
    assert!(heap.is_marked(c), "stored referent must be shaded");

    mutator.finish_gc();
    assert_eq!(heap.cycles(), 1);
    heap.finish_sweep();
    assert!(heap.is_allocated(b), "shaded object is floating garbage for one cycle");

    mutator.force_gc(true);
    heap.finish_sweep();
    assert!(!heap.is_allocated(b));
    assert!(heap.is_allocated(c));
    assert_eq!(mutator.load_pointer(a, 0), c);
    roots.remove(root);
}

#[test]
fn test_allocation_during_mark_is_black() {
    let (heap, roots) = new_heap(manual_config(0));
    let mut mutator = heap.mutator();

    // A chain much longer than one assist scans.
    let head = mutator.allocate(64, true).unwrap();
    let root = roots.add(head);
    let mut prev = head;
    for _ in 0..4000 {
        let node = mutator.allocate(64, true).unwrap();
        mutator.store_pointer(prev, 0, node);
        prev = node;
    }

    assert!(mutator.start_gc());
    let fresh = mutator.allocate_with(64, false, true).unwrap();
    assert_eq!(heap.phase(), GcPhase::Mark);
    assert!(fresh.black);
    assert!(heap.is_marked(fresh.addr));

    mutator.finish_gc();
    heap.finish_sweep();
    assert!(heap.is_allocated(fresh.addr));
    assert!(heap.is_allocated(prev));
    roots.remove(root);
}

/// Everything dies at once: every span goes back to the page heap.
#[test]
fn test_all_dead_heap_is_fully_reclaimed() {
    let mut config = manual_config(2);
    config.set_gc_percent(100).set_heap_minimum(256 << 10);
    let (heap, _roots) = new_heap(config);
    let mut mutator = heap.mutator();

    let mut n = 0;
    while heap.started_cycles() == 0 {
        mutator.allocate(64, true).unwrap();
        if n % 64 == 0 {
            mutator.allocate_noscan(20_000, false).unwrap();
        }
        n += 1;
        assert!(n < 1_000_000, "heap trigger never fired");
    }

    mutator.force_gc(true);
    heap.finish_sweep();
    mutator.flush();

    let stats = heap.mem_stats();
    assert_eq!(stats.heap_inuse, 0);
    assert_eq!(heap.in_use_object_bytes(), 0);
    assert_eq!(stats.total_alloc, stats.total_freed);
    assert_eq!(stats.heap_idle, stats.heap_sys);
}

#[test]
fn test_allocated_bytes_match_span_contents() {
    let (heap, roots) = new_heap(manual_config(1));
    let mut mutator = heap.mutator();

    let mut kept = Vec::new();
    for i in 0..3000usize {
        let size = [16, 48, 200, 1500, 9000, 40_000][i % 6];
        let addr = mutator.allocate(size, true).unwrap();
        if i % 3 == 0 {
            kept.push(roots.add(addr));
        }
    }
    mutator.flush();
    let stats = heap.mem_stats();
    assert_eq!(stats.total_alloc - stats.total_freed, heap.in_use_object_bytes());

    mutator.force_gc(true);
    mutator.flush();
    let stats = heap.mem_stats();
    assert_eq!(stats.total_alloc - stats.total_freed, heap.in_use_object_bytes());

    heap.finish_sweep();
    let stats = heap.mem_stats();
    assert!(stats.total_freed > 0);
    assert_eq!(stats.total_alloc - stats.total_freed, heap.in_use_object_bytes());
    assert_eq!(stats.mallocs - stats.frees, kept.len() as u64);
    for id in kept {
        roots.remove(id);
    }
}

#[test]
fn test_lazy_sweep_is_idempotent() {
    let (heap, roots) = new_heap(manual_config(1));
    let mut mutator = heap.mutator();

    let first = mutator.allocate_noscan(48, true).unwrap();
    let root = roots.add(first);
    for _ in 1..1000 {
        mutator.allocate_noscan(48, true).unwrap();
    }
    mutator.force_gc(true);

    // 170 objects of 48 bytes fit in a page: six spans, one survivor.
    let mut outcomes = Vec::new();
    while let Some(outcome) = heap.sweep_one() {
        outcomes.push(outcome);
    }
    assert_eq!(outcomes.len(), 6);
    assert_eq!(outcomes.iter().map(|o| o.freed_objects).sum::<usize>(), 999);
    assert_eq!(outcomes.iter().map(|o| o.live_objects).sum::<usize>(), 1);
    assert_eq!(outcomes.iter().filter(|o| o.released).count(), 5);
    assert!(outcomes.iter().all(|o| o.freed_anything() || o.live_objects > 0));

    let freed = heap.mem_stats().total_freed;
    assert_eq!(freed, 999 * 48);

    // Sweeping again is a no-op.
    assert!(heap.sweep_one().is_none());
    let span = heap.span_of(first).unwrap();
    heap.ensure_swept(&span);
    heap.ensure_swept(&span);
    heap.finish_sweep();
    assert_eq!(heap.mem_stats().total_freed, freed);
    assert!(heap.is_allocated(first));
    assert_eq!(span.alloc_count(), 1);
    roots.remove(root);
}

#[test]
fn test_release_os_memory_tracks_released_bytes() {
    let (heap, _roots) = new_heap(manual_config(1));
    let mut mutator = heap.mutator();

    for _ in 0..8 {
        mutator.allocate_noscan(64 << 10, false).unwrap();
    }
    mutator.force_gc(true);
    heap.finish_sweep();

    let released = heap.release_os_memory().unwrap();
    assert!(released > 0);
    let stats = heap.mem_stats();
    assert_eq!(stats.heap_released, released as u64);
    assert!(stats.heap_released <= stats.heap_idle);

    // Nothing new to release.
    assert_eq!(heap.release_os_memory().unwrap(), 0);

    // Reusing released pages takes them out of the released count.
    let addr = mutator.allocate_noscan(64 << 10, true).unwrap();
    assert!(heap.mem_stats().heap_released < released as u64);
    assert!(mutator.load_pointer(addr, 0).is_null());
}
