//! Allocation paths: size classes, thread caches, large objects, manual
//! spans and heap limits.

use std::collections::HashSet;
use std::process::Command;
use std::sync::{Arc, Barrier};
use std::thread;

use spangc::address::{word_in_object, WORD_SIZE};
use spangc::size_class::PAGE_SIZE;
use spangc::{Address, GcConfig, GcError, Heap, SpanState, StaticRoots};

fn quiet_config() -> GcConfig {
    let mut config = GcConfig::new();
    config
        .set_gc_percent(-1)
        .set_procs(4)
        .set_mark_workers(1)
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
fn test_small_requests_round_up_to_size_class() {
    let (heap, _roots) = new_heap(quiet_config());
    let mut mutator = heap.mutator();

    let a = mutator.allocate_with(24, false, true).unwrap();
    let b = mutator.allocate_with(24, false, true).unwrap();
    assert_eq!(a.size, 32);
    assert_eq!(b.size, 32);
    assert_ne!(a.addr, b.addr);
    assert!(!a.black);
    assert!(heap.is_allocated(a.addr));
    assert!(heap.is_allocated(b.addr));

    let span = heap.span_of(a.addr).unwrap();
    assert_eq!(span.state(), SpanState::InUse);
    assert_eq!(span.elem_size(), 32);
    assert!(!span.span_class().is_large());
    assert!(!span.span_class().noscan());

    let c = mutator.allocate_with(24, true, true).unwrap();
    let noscan = heap.span_of(c.addr).unwrap();
    assert!(noscan.span_class().noscan());
    assert_ne!(noscan.base(), span.base());
}

#[test]
fn test_zeroed_allocation_reads_zero() {
    let (heap, _roots) = new_heap(quiet_config());
    let mut mutator = heap.mutator();
    let obj = mutator.allocate(64, true).unwrap();
    for offset in (0..64).step_by(8) {
        assert!(mutator.load_pointer(obj, offset).is_null());
    }
    mutator.store_pointer(obj, 8, Address::from_usize(0x55));
    assert_eq!(mutator.load_pointer(obj, 8), Address::from_usize(0x55));
}

/// K threads allocate concurrently without a cycle: every slot is handed
/// out once and the byte count matches the rounded size.
#[test]
fn test_concurrent_allocation_hands_out_distinct_slots() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 5000;

    let (heap, _roots) = new_heap(quiet_config());
    let heap = Arc::new(heap);
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let heap = Arc::clone(&heap);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut mutator = heap.mutator();
                barrier.wait();
                (0..PER_THREAD)
                    .map(|_| {
                        let alloc = mutator.allocate_with(24, false, false).unwrap();
                        assert_eq!(alloc.size, 32);
                        alloc.addr
                    })
                    .collect::<Vec<Address>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for addr in handle.join().unwrap() {
            assert!(seen.insert(addr), "{addr} handed out twice");
        }
    }
    assert_eq!(seen.len(), THREADS * PER_THREAD);

    let stats = heap.mem_stats();
    assert_eq!(stats.total_alloc, (THREADS * PER_THREAD * 32) as u64);
    assert_eq!(stats.mallocs, (THREADS * PER_THREAD) as u64);
    assert_eq!(stats.total_freed, 0);
    assert_eq!(heap.in_use_object_bytes(), stats.total_alloc);
    assert_eq!(heap.cycles(), 0);
}

#[test]
fn test_large_object_gets_its_own_span() {
    let (heap, _roots) = new_heap(quiet_config());
    let mut mutator = heap.mutator();

    let alloc = mutator.allocate_with(100_000, false, true).unwrap();
    let npages = 100_000usize.div_ceil(PAGE_SIZE);
    assert_eq!(alloc.size, npages * PAGE_SIZE);

    let span = heap.span_of(alloc.addr).unwrap();
    assert!(span.span_class().is_large());
    assert_eq!(span.base(), alloc.addr);
    assert_eq!(span.npages(), npages);
    assert_eq!(span.alloc_count(), 1);
    // Interior addresses resolve to the same span.
    assert!(heap.is_allocated(alloc.addr.offset(50_000)));
}

#[test]
fn test_free_large_returns_pages() {
    let (heap, _roots) = new_heap(quiet_config());
    let mut mutator = heap.mutator();

    let addr = mutator.allocate_noscan(3 * PAGE_SIZE, false).unwrap();
    mutator.flush();
    let before = heap.mem_stats();
    assert_eq!(before.heap_inuse, (3 * PAGE_SIZE) as u64);

    let span = heap.span_of(addr).unwrap();
    mutator.free_large(&span);
    assert_eq!(span.state(), SpanState::Dead);
    assert!(!heap.is_allocated(addr));

    let after = heap.mem_stats();
    assert_eq!(after.heap_inuse, 0);
    assert_eq!(after.total_freed, (3 * PAGE_SIZE) as u64);
    assert_eq!(after.frees, 1);
    assert_eq!(heap.in_use_object_bytes(), 0);
}

#[test]
fn test_manual_spans_are_zeroed_and_never_collected() {
    let (heap, _roots) = new_heap(quiet_config());
    let mut mutator = heap.mutator();

    let span = mutator.alloc_manual(2).unwrap();
    assert_eq!(span.state(), SpanState::Manual);
    assert_eq!(span.npages(), 2);
    assert_eq!(span.bytes(), 2 * PAGE_SIZE);
    // SAFETY: the manual span is ours until it is freed.
    let bytes = unsafe { std::slice::from_raw_parts_mut(span.base().as_ptr::<u8>(), span.bytes()) };
    assert!(bytes.iter().all(|&b| b == 0));
    bytes.fill(0xAB);

    mutator.force_gc(true);
    heap.finish_sweep();
    assert_eq!(span.state(), SpanState::Manual);
    assert_eq!(heap.mem_stats().heap_inuse, (2 * PAGE_SIZE) as u64);

    mutator.free_large(&span);
    assert_eq!(span.state(), SpanState::Dead);
    assert_eq!(heap.mem_stats().heap_inuse, 0);

    // The same pages come back zeroed.
    let again = mutator.alloc_manual(2).unwrap();
    // SAFETY: as above.
    let bytes = unsafe { std::slice::from_raw_parts(again.base().as_ptr::<u8>(), again.bytes()) };
    assert!(bytes.iter().all(|&b| b == 0));
    mutator.free_large(&again);
}

#[test]
fn test_heap_limit_surfaces_out_of_memory() {
    const LIMIT: usize = 8 << 20;
    let mut config = quiet_config();
    config.set_heap_limit(Some(LIMIT));
    let (heap, roots) = new_heap(config);
    let mut mutator = heap.mutator();

    let mut ids = Vec::new();
    let err = loop {
        match mutator.allocate_noscan(1 << 20, false) {
            Ok(addr) => ids.push(roots.add(addr)),
            Err(err) => break err,
        }
        assert!(ids.len() <= 16, "heap limit never enforced");
    };
    assert!(matches!(err, GcError::OutOfMemory { requested } if requested == 1 << 20));
    assert_eq!(ids.len(), LIMIT >> 20);
    assert!(heap.mem_stats().heap_sys <= LIMIT as u64);

    // Dropping the roots and collecting makes room again.
    for id in ids {
        roots.remove(id);
    }
    mutator.force_gc(true);
    heap.finish_sweep();
    assert!(mutator.allocate_noscan(1 << 20, false).is_ok());
}

#[test]
fn test_impossible_size_is_rejected() {
    let (heap, _roots) = new_heap(quiet_config());
    let mut mutator = heap.mutator();
    let err = mutator.allocate(usize::MAX, false).unwrap_err();
    assert!(matches!(err, GcError::SizeOverflow { .. }));
}

#[test]
fn test_zero_page_manual_span_is_rejected() {
    let (heap, _roots) = new_heap(quiet_config());
    let mut mutator = heap.mutator();
    let err = mutator.alloc_manual(0).unwrap_err();
    assert!(matches!(err, GcError::ZeroSize));
    assert_eq!(heap.mem_stats().heap_inuse, 0);
}

#[test]
fn test_word_offsets_are_checked_against_object_size() {
    let (heap, _roots) = new_heap(quiet_config());
    let mut mutator = heap.mutator();
    let size = mutator.allocate_with(24, false, true).unwrap().size;
    assert_eq!(size, 32);

    for offset in (0..size).step_by(WORD_SIZE) {
        assert!(word_in_object(offset, size), "offset {offset} rejected");
    }
    assert!(!word_in_object(size, size));
    assert!(!word_in_object(size - WORD_SIZE + 1, size));
    assert!(!word_in_object(1, size));
    assert!(!word_in_object(usize::MAX - 7, size));
    assert!(!word_in_object(usize::MAX - 7, usize::MAX));
}

/// Set in a child process that is expected to abort.
const MISUSE_CHILD: &str = "SPANGC_MISUSE_CHILD";

/// Runs `test` alone in a child copy of this binary with [`MISUSE_CHILD`]
/// set, and checks that it died through the fatal-error path.
fn assert_child_aborts(test: &str) {
    let output = Command::new(std::env::current_exe().unwrap())
        .args([test, "--exact", "--test-threads=1", "--nocapture"])
        .env(MISUSE_CHILD, "1")
        .output()
        .unwrap();
    assert!(!output.status.success(), "{test} completed without aborting");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("fatal error:"), "{test} failed without a fatal report:\n{stderr}");
}

fn in_misuse_child() -> bool {
    std::env::var_os(MISUSE_CHILD).is_some()
}

/// An offset that wraps the address space must not reach the object below.
#[test]
fn test_wrapping_offset_load_aborts() {
    if in_misuse_child() {
        let (heap, _roots) = new_heap(quiet_config());
        let mut mutator = heap.mutator();
        let lo = mutator.allocate(32, true).unwrap();
        let hi = mutator.allocate(32, true).unwrap();
        mutator.store_pointer(lo, 24, hi);
        let word = mutator.load_pointer(hi, usize::MAX - 7);
        println!("read {word} outside the object");
        return;
    }
    assert_child_aborts("test_wrapping_offset_load_aborts");
}

#[test]
fn test_wrapping_offset_store_aborts() {
    if in_misuse_child() {
        let (heap, _roots) = new_heap(quiet_config());
        let mut mutator = heap.mutator();
        let _lo = mutator.allocate(32, true).unwrap();
        let hi = mutator.allocate(32, true).unwrap();
        mutator.store_pointer(hi, usize::MAX - 7, Address::from_usize(0x55));
        return;
    }
    assert_child_aborts("test_wrapping_offset_store_aborts");
}

#[test]
fn test_store_past_object_end_aborts() {
    if in_misuse_child() {
        let (heap, _roots) = new_heap(quiet_config());
        let mut mutator = heap.mutator();
        let obj = mutator.allocate(32, true).unwrap();
        mutator.store_pointer(obj, 32, Address::NULL);
        return;
    }
    assert_child_aborts("test_store_past_object_end_aborts");
}

#[test]
fn test_misaligned_load_aborts() {
    if in_misuse_child() {
        let (heap, _roots) = new_heap(quiet_config());
        let mut mutator = heap.mutator();
        let obj = mutator.allocate(64, true).unwrap();
        let _ = mutator.load_pointer(obj, 12);
        return;
    }
    assert_child_aborts("test_misaligned_load_aborts");
}

#[test]
fn test_double_free_of_manual_span_aborts() {
    if in_misuse_child() {
        let (heap, _roots) = new_heap(quiet_config());
        let mut mutator = heap.mutator();
        let span = mutator.alloc_manual(1).unwrap();
        mutator.free_large(&span);
        mutator.free_large(&span);
        return;
    }
    assert_child_aborts("test_double_free_of_manual_span_aborts");
}
