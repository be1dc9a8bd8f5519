//! Pacing and cycle metrics.

use std::sync::Arc;
use std::time::Duration;

use spangc::{GcConfig, Heap, StaticRoots};

const EPS: f64 = 1e-9;

fn new_heap(config: GcConfig) -> (Heap, Arc<StaticRoots>) {
    let roots = Arc::new(StaticRoots::new());
    let heap = Heap::new(config, roots.clone()).unwrap();
    (heap, roots)
}

/// With `gc_percent = 50` the heap grows by roughly half of the marked
/// heap between cycles, and never runs far past the goal.
#[test]
fn test_heap_growth_follows_gc_percent() {
    const LIVE_OBJECTS: usize = 64;
    const LIVE_SIZE: usize = 128 << 10;

    let mut config = GcConfig::new();
    config
        .set_gc_percent(-1)
        .set_heap_minimum(64 << 10)
        .set_procs(4)
        .set_mark_workers(2)
        .set_background_sweep(false)
        .set_force_gc_period(None);
    let pacer = config.pacer;
    let (heap, roots) = new_heap(config);
    let mut mutator = heap.mutator();

    // 8 MiB that stays live throughout, in place before the first cycle.
    let live: Vec<_> = (0..LIVE_OBJECTS)
        .map(|_| roots.add(mutator.allocate_noscan(LIVE_SIZE, false).unwrap()))
        .collect();
    assert_eq!(mutator.set_gc_percent(50), -1);

    let mut n = 0usize;
    while heap.cycles() < 8 {
        mutator.allocate_noscan(64, false).unwrap();
        n += 1;
        assert!(n < 50_000_000, "heap trigger stopped firing");
    }
    mutator.flush();

    let history = heap.history().recent(64);
    let (min_ratio, max_ratio) = (pacer.min_trigger_scale * 0.5, pacer.max_trigger_scale * 0.5);
    for m in &history {
        assert!(!m.forced);
        assert!(
            m.next_trigger_ratio >= min_ratio - EPS && m.next_trigger_ratio <= max_ratio + EPS,
            "trigger ratio {} outside [{min_ratio}, {max_ratio}]",
            m.next_trigger_ratio
        );
        assert!(m.heap_marked >= (LIVE_OBJECTS * LIVE_SIZE) as u64);
        // Growth never runs past the overshoot bound, give or take the
        // spans cached when the goal was crossed.
        #[allow(clippy::cast_precision_loss)]
        let bound = m.heap_goal as f64 * (1.0 + pacer.max_overshoot) + f64::from(1u32 << 20);
        #[allow(clippy::cast_precision_loss)]
        let end = m.heap_live_at_end as f64;
        assert!(end <= bound, "heap reached {end} against goal {}", m.heap_goal);
    }

    // Later cycles start from the previous cycle's marked heap.
    for pair in history.windows(2).skip(1) {
        let (prev, cur) = (&pair[0], &pair[1]);
        #[allow(clippy::cast_precision_loss)]
        let growth = cur.heap_live_at_trigger as f64 / prev.heap_marked as f64 - 1.0;
        assert!(
            (0.25..0.6).contains(&growth),
            "growth {growth} between triggers is not near 0.5"
        );
        assert!(cur.heap_goal >= prev.heap_marked + prev.heap_marked / 2);
    }

    for id in live {
        roots.remove(id);
    }
}

#[test]
fn test_forced_cycles_are_recorded() {
    let mut config = GcConfig::new();
    config
        .set_procs(2)
        .set_mark_workers(1)
        .set_background_sweep(false)
        .set_force_gc_period(None);
    let (heap, roots) = new_heap(config);
    let mut mutator = heap.mutator();

    let keep = roots.add(mutator.allocate(1024, true).unwrap());
    for cycle in 1..=3u32 {
        for _ in 0..100 {
            mutator.allocate(256, true).unwrap();
        }
        mutator.force_gc(true);
        let last = heap.history().last().unwrap();
        assert_eq!(last.cycle, cycle);
        assert!(last.forced);
        assert!(last.heap_marked >= 1024);
        assert!(last.duration >= last.mark_duration);
        assert!(last.duration >= last.total_pause());
        assert!(last.cpu_fraction.is_finite() && last.cpu_fraction >= 0.0);
    }

    assert_eq!(heap.cycles(), 3);
    assert_eq!(heap.history().total_recorded(), 3);
    assert_eq!(heap.pauses().count(), 6);
    assert!(heap.history().max_pause_time(3) >= heap.history().average_pause_time(3));

    let stats = heap.mem_stats();
    assert_eq!(stats.num_gc, 3);
    assert_eq!(stats.num_forced_gc, 3);
    assert!(stats.last_gc > 0);
    assert!(stats.pause_total >= heap.history().recent(3).iter().map(|m| m.total_pause()).sum::<Duration>());
    roots.remove(keep);
}

#[test]
fn test_gc_percent_can_be_changed_and_disabled() {
    let mut config = GcConfig::new();
    config
        .set_procs(2)
        .set_mark_workers(1)
        .set_heap_minimum(64 << 10)
        .set_background_sweep(false)
        .set_force_gc_period(None);
    let (heap, _roots) = new_heap(config);
    let mut mutator = heap.mutator();

    assert_eq!(mutator.set_gc_percent(-1), 100);
    assert_eq!(heap.pacer().gc_percent(), -1);
    assert_eq!(heap.pacer().trigger(), u64::MAX);

    // Disabled: lots of garbage, no cycle.
    for _ in 0..20_000 {
        mutator.allocate(128, false).unwrap();
    }
    assert_eq!(heap.cycles(), 0);
    assert_eq!(heap.started_cycles(), 0);

    // Explicit cycles still run.
    mutator.force_gc(true);
    assert_eq!(heap.cycles(), 1);

    assert_eq!(mutator.set_gc_percent(200), -1);
    assert!(heap.pacer().trigger() < u64::MAX);
    assert!(heap.pacer().goal() >= heap.pacer().trigger());
}
