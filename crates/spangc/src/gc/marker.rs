//! Background mark workers.
//!
//! Each worker parks on the grey queue and, when woken during a mark
//! phase, picks a mode: dedicated while the pacer wants dedicated workers,
//! fractional while its share of this cycle is below the fractional goal,
//! idle while processors are otherwise unused. A worker that finds no mode
//! goes back to sleep.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::gc::pacer::WorkerMode;
use crate::gc::work::GcWork;
use crate::gc::GcPhase;
use crate::heap::HeapCore;

/// Longest a worker sleeps between checks of the collector state.
const WORKER_PARK: Duration = Duration::from_millis(10);

/// Fractional workers stop once they exceed their goal by this factor.
const FRACTIONAL_OVERSHOOT: f64 = 1.2;

/// Time this worker has spent marking in one cycle.
#[derive(Debug, Default)]
struct WorkerClock {
    cycle: u32,
    worked: Duration,
}

impl WorkerClock {
    fn for_cycle(&mut self, cycle: u32) {
        if self.cycle != cycle {
            self.cycle = cycle;
            self.worked = Duration::ZERO;
        }
    }

    /// Share of the mark phase's wall time this worker has spent marking.
    fn share(&self, extra: Duration, mark_elapsed: Duration) -> f64 {
        if mark_elapsed.is_zero() {
            return 0.0;
        }
        (self.worked + extra).as_secs_f64() / mark_elapsed.as_secs_f64()
    }
}

/// Body of a mark worker thread.
pub(crate) fn run_worker(heap: &HeapCore) {
    let mut gcw = GcWork::new();
    let mut clock = WorkerClock::default();
    while !heap.gc.is_shutdown() {
        let epoch = heap.grey.epoch();
        if heap.phase() == GcPhase::Mark && heap.gc.blackening() {
            clock.for_cycle(heap.gc.started_cycles());
            if !heap.grey.is_empty() {
                if let Some(mode) = pick_mode(heap, &clock) {
                    mark(heap, &mut gcw, &mut clock, mode);
                }
            }
            if heap.mark_work_drained() && heap.mark_done() {
                continue;
            }
        }
        heap.grey.wait_for_work(epoch, WORKER_PARK);
    }
}

fn pick_mode(heap: &HeapCore, clock: &WorkerClock) -> Option<WorkerMode> {
    if heap.pacer.claim_dedicated() {
        return Some(WorkerMode::Dedicated);
    }
    let goal = heap.pacer.fractional_goal();
    if goal > 0.0 && clock.share(Duration::ZERO, heap.pacer.mark_elapsed()) < goal {
        return Some(WorkerMode::Fractional);
    }
    if heap.world.idle_procs() > 0 {
        return Some(WorkerMode::Idle);
    }
    None
}

/// Drains grey work in `mode` until the mode's stop condition holds.
fn mark(heap: &HeapCore, gcw: &mut GcWork, clock: &mut WorkerClock, mode: WorkerMode) {
    let start = Instant::now();
    heap.gc.busy.fetch_add(1, Ordering::SeqCst);
    if heap.gc.blackening() {
        match mode {
            WorkerMode::Dedicated => {
                heap.drain(gcw, None, true, &mut || !heap.gc.is_shutdown());
            }
            WorkerMode::Fractional => {
                let goal = heap.pacer.fractional_goal() * FRACTIONAL_OVERSHOOT;
                let worked = &*clock;
                heap.drain(gcw, None, true, &mut || {
                    worked.share(start.elapsed(), heap.pacer.mark_elapsed()) < goal
                });
            }
            WorkerMode::Idle => {
                heap.drain(gcw, None, true, &mut || heap.world.idle_procs() > 0);
            }
        }
    }
    gcw.dispose(&heap.grey);
    heap.flush_mark_stats(gcw, true);
    heap.gc.busy.fetch_sub(1, Ordering::SeqCst);
    if mode == WorkerMode::Dedicated {
        heap.pacer.release_dedicated();
    }

    let elapsed = start.elapsed();
    heap.pacer.add_worker_time(mode, elapsed);
    clock.worked += elapsed;
}
