//! Background thread behaviour: deferred cycles and background sweeping.

#![cfg(feature = "test-util")]

use std::time::Duration;

use spangc::test_util::{eventually, heap_with_roots, test_config};
use spangc::GcPhase;

const WAIT: Duration = Duration::from_secs(10);

#[test]
fn test_non_blocking_force_runs_in_background() {
    let mut config = test_config(1);
    config.set_background_sweep(true);
    let (heap, _roots) = heap_with_roots(config).unwrap();

    {
        let mut mutator = heap.mutator();
        for _ in 0..2000 {
            mutator.allocate(64, true).unwrap();
        }
        // The handle is dropped so the world can stop without it.
    }

    heap.force_gc(false);
    assert!(heap.wait_for_cycle(1, WAIT));
    assert!(heap.history().last().unwrap().forced);

    // Nothing was rooted; the background sweeper gives every page back.
    assert!(eventually(WAIT, || heap.mem_stats().heap_inuse == 0));
    assert_eq!(heap.phase(), GcPhase::Off);
}

#[test]
fn test_periodic_cycles_start_without_allocation() {
    let mut config = test_config(1);
    config.set_force_gc_period(Some(Duration::from_millis(20)));
    let (heap, _roots) = heap_with_roots(config).unwrap();

    assert!(heap.wait_for_cycle(2, WAIT));
    let recent = heap.history().recent(2);
    assert!(recent.iter().all(|m| !m.forced));
}

#[test]
fn test_wait_for_cycle_times_out_when_idle() {
    let (heap, _roots) = heap_with_roots(test_config(1)).unwrap();
    assert!(!heap.wait_for_cycle(1, Duration::from_millis(30)));
    assert!(heap.wait_for_cycle(0, Duration::ZERO));
}

#[test]
fn test_blocking_force_from_a_collector_thread() {
    let (heap, roots) = heap_with_roots(test_config(0)).unwrap();
    let kept = {
        let mut mutator = heap.mutator();
        mutator.allocate(256, true).unwrap()
    };
    let root = roots.add(kept);

    // No mutator is registered on this thread, so the heap-level call may
    // stop the world itself.
    heap.force_gc(true);
    heap.force_gc(true);
    assert_eq!(heap.cycles(), 2);
    heap.finish_sweep();
    assert!(heap.is_allocated(kept));
    roots.remove(root);
}
