//! Cycle coordination: triggers, the start pause, termination and waiting.
//!
//! Phase changes happen under the transition lock with the world stopped.
//! Marking is done by three kinds of markers: background workers, mutators
//! paying off assist debt, and threads blocked in a forced collection. Each
//! registers in `busy` (or `assists`) while it holds private grey work and
//! publishes that work before it deregisters. Termination therefore stops
//! the world, turns blackening off, waits for the markers to deregister
//! and checks the grey queue once more: parked mutators have flushed their
//! buffers by then, so an empty queue means marking is complete. Otherwise
//! the world restarts and marking continues.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};

use crate::address::Address;
use crate::fatal;
use crate::gc::sync::{LockGuard, LockOrder};
use crate::gc::work::GcWork;
use crate::gc::{GcPhase, GcTrigger, PhaseCell};
use crate::heap::HeapCore;
use crate::metrics::{duration_ns, GcMetrics};
use crate::tracing::internal as trace;

/// Scan work a thread blocked in a forced collection does between checks.
const HELP_BUDGET: i64 = 256 << 10;

/// How long a helper sleeps when there is nothing to drain.
const HELP_PARK: Duration = Duration::from_millis(1);

/// Bookkeeping of the cycle in progress.
#[derive(Debug)]
struct CycleRecord {
    start: Instant,
    start_pause: Duration,
    termination_pause: Duration,
    heap_live_at_trigger: u64,
    heap_goal: u64,
    trigger_ratio: f64,
    forced: bool,
    restarts: u32,
    last_end: Instant,
}

/// Collector state shared by every thread.
#[derive(Debug)]
pub(crate) struct GcState {
    pub(crate) phase: PhaseCell,
    transition: Mutex<()>,
    /// Markers may take grey work.
    blackening: AtomicBool,
    /// Background workers and helpers holding private grey work.
    pub(crate) busy: AtomicUsize,
    /// Mutators assisting.
    pub(crate) assists: AtomicUsize,
    started: AtomicU32,
    completed: Mutex<u32>,
    completed_cond: Condvar,
    pending_force: AtomicBool,
    shutdown: AtomicBool,
    cycle: Mutex<CycleRecord>,
}

impl GcState {
    pub(crate) fn new() -> Self {
        let now = Instant::now();
        Self {
            phase: PhaseCell::new(),
            transition: Mutex::new(()),
            blackening: AtomicBool::new(false),
            busy: AtomicUsize::new(0),
            assists: AtomicUsize::new(0),
            started: AtomicU32::new(0),
            completed: Mutex::new(0),
            completed_cond: Condvar::new(),
            pending_force: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            cycle: Mutex::new(CycleRecord {
                start: now,
                start_pause: Duration::ZERO,
                termination_pause: Duration::ZERO,
                heap_live_at_trigger: 0,
                heap_goal: 0,
                trigger_ratio: 0.0,
                forced: false,
                restarts: 0,
                last_end: now,
            }),
        }
    }

    pub(crate) fn blackening(&self) -> bool {
        self.blackening.load(Ordering::SeqCst)
    }

    /// Cycles started so far.
    pub(crate) fn started_cycles(&self) -> u32 {
        self.started.load(Ordering::SeqCst)
    }

    /// Cycles whose mark termination has finished.
    pub(crate) fn completed_cycles(&self) -> u32 {
        *self.completed.lock()
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

/// `a >= b` on wrapping cycle counters.
#[allow(clippy::cast_possible_wrap)]
pub(crate) const fn cycle_reached(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) as i32 >= 0
}

impl HeapCore {
    /// Whether `trigger` calls for a new cycle right now.
    pub(crate) fn test_trigger(&self, trigger: GcTrigger) -> bool {
        if self.phase() != GcPhase::Off || self.gc.is_shutdown() {
            return false;
        }
        match trigger {
            GcTrigger::Heap => {
                self.pacer.gc_percent() >= 0
                    && self.pacer.heap_trigger_reached(self.counters.heap_live())
            }
            GcTrigger::Time => {
                self.pacer.gc_percent() >= 0
                    && self
                        .config
                        .force_gc_period
                        .is_some_and(|period| self.gc.cycle.lock().last_end.elapsed() > period)
            }
            GcTrigger::Cycle(n) => !cycle_reached(self.gc.started_cycles(), n),
        }
    }

    /// Starts a cycle if `trigger` holds. Returns whether this call started
    /// one.
    ///
    /// The caller must not be a running mutator: the world is stopped here.
    pub(crate) fn gc_start(&self, trigger: GcTrigger) -> bool {
        // Pay off the previous generation's sweeping concurrently first.
        while self.test_trigger(trigger) && self.sweep_one().is_some() {}

        let _order = LockGuard::new(LockOrder::Transition);
        let _transition = self.gc.transition.lock();
        if !self.test_trigger(trigger) {
            return false;
        }

        let cycle = self.gc.started_cycles().wrapping_add(1);
        let _span = trace::trace_gc_cycle(cycle, trigger.as_str());
        let pause_start = Instant::now();
        self.world.stop_the_world();

        self.finish_sweep();
        #[cfg(feature = "paranoid-sweep")]
        self.verify_swept();

        self.counters.bytes_marked.store(0, Ordering::Release);
        self.pages.arenas().clear_page_marks();
        self.gc.started.store(cycle, Ordering::SeqCst);

        let heap_live = self.counters.heap_live();
        let targets =
            self.pacer
                .on_cycle_start(heap_live, self.counters.heap_scan(), trigger.is_forced());
        self.gc.phase.store(GcPhase::Mark);
        self.mark_roots();
        self.gc.blackening.store(true, Ordering::SeqCst);

        let start_pause = pause_start.elapsed();
        {
            let mut record = self.gc.cycle.lock();
            record.start = pause_start;
            record.start_pause = start_pause;
            record.termination_pause = Duration::ZERO;
            record.heap_live_at_trigger = heap_live;
            record.heap_goal = targets.goal_bytes;
            record.trigger_ratio = self.pacer.trigger_ratio();
            record.forced = trigger.is_forced();
            record.restarts = 0;
        }
        self.world.start_the_world();
        trace::log_cycle_start(cycle, heap_live, self.pacer.trigger(), targets.goal_bytes);
        self.grey.notify_all();
        true
    }

    /// No grey work is queued and no marker holds private work.
    pub(crate) fn mark_work_drained(&self) -> bool {
        self.grey.is_empty()
            && self.gc.busy.load(Ordering::SeqCst) == 0
            && self.gc.assists.load(Ordering::SeqCst) == 0
    }

    /// Publishes a marker's statistics; `background` work also earns
    /// credit that assists may steal.
    pub(crate) fn flush_mark_stats(&self, gcw: &mut GcWork, background: bool) {
        let (marked, work) = gcw.take_stats();
        if marked > 0 {
            self.counters.bytes_marked.fetch_add(marked, Ordering::AcqRel);
        }
        if work > 0 {
            self.pacer.add_scan_work(work);
            if background {
                self.pacer.add_background_credit(work);
            }
            if self.phase() == GcPhase::Mark {
                self.pacer
                    .revise(self.counters.heap_live(), self.counters.heap_scan());
            }
        }
    }

    /// Attempts to finish marking. Returns `true` if this call ran mark
    /// termination.
    ///
    /// The caller must not be a running mutator and must have published
    /// its own grey work.
    pub(crate) fn mark_done(&self) -> bool {
        if self.phase() != GcPhase::Mark || !self.mark_work_drained() {
            return false;
        }
        let _order = LockGuard::new(LockOrder::Transition);
        let _transition = self.gc.transition.lock();
        if self.phase() != GcPhase::Mark || !self.mark_work_drained() {
            return false;
        }

        let cycle = self.gc.started_cycles();
        let pause_start = Instant::now();
        self.world.stop_the_world();
        self.gc.blackening.store(false, Ordering::SeqCst);
        let backoff = Backoff::new();
        while self.gc.busy.load(Ordering::SeqCst) != 0 || self.gc.assists.load(Ordering::SeqCst) != 0 {
            backoff.snooze();
        }

        if !self.grey.is_empty() {
            let restarts = {
                let mut record = self.gc.cycle.lock();
                record.restarts += 1;
                record.termination_pause += pause_start.elapsed();
                record.restarts
            };
            trace::log_termination_restart(cycle, restarts);
            self.gc.blackening.store(true, Ordering::SeqCst);
            self.world.start_the_world();
            self.grey.notify_all();
            return false;
        }

        self.mark_termination(cycle, pause_start);
        true
    }

    /// Finishes cycle `cycle`. Runs with the world stopped and the
    /// transition lock held.
    fn mark_termination(&self, cycle: u32, pause_start: Instant) {
        self.gc.phase.store(GcPhase::MarkTermination);

        let marked = self.counters.bytes_marked.load(Ordering::Acquire);
        let heap_live = self.counters.heap_live();
        let scan_work = u64::try_from(self.pacer.scan_work()).unwrap_or(0);
        let mark_duration = self.pacer.mark_elapsed();
        let actual_growth = self.pacer.actual_growth(heap_live);
        let next_ratio = self.pacer.on_cycle_end(actual_growth);
        let times = self.pacer.cycle_times();
        self.pacer.set_heap_marked(marked);

        self.counters.heap_live.store(marked, Ordering::Release);
        self.counters.heap_scan.store(scan_work, Ordering::Release);
        self.flip_sweep_generation();
        self.pacer
            .set_trigger_ratio(next_ratio, marked, self.sweep_progress());
        self.gc.phase.store(GcPhase::Off);

        let metrics = {
            let mut record = self.gc.cycle.lock();
            let now = Instant::now();
            record.termination_pause += now.duration_since(pause_start);
            record.last_end = now;
            let duration = now.duration_since(record.start);
            let pauses = record.start_pause + record.termination_pause;
            #[allow(clippy::cast_precision_loss)]
            let cpu_fraction = if duration.is_zero() {
                0.0
            } else {
                let procs = self.pacer.procs() as f64;
                (times.total().as_secs_f64() + pauses.as_secs_f64() * procs)
                    / (duration.as_secs_f64() * procs)
            };
            GcMetrics {
                cycle,
                forced: record.forced,
                duration,
                mark_duration,
                start_pause: record.start_pause,
                termination_pause: record.termination_pause,
                heap_live_at_trigger: record.heap_live_at_trigger,
                heap_marked: marked,
                heap_goal: record.heap_goal,
                heap_live_at_end: heap_live,
                trigger_ratio: record.trigger_ratio,
                next_trigger_ratio: self.pacer.trigger_ratio(),
                scan_work,
                assist_time: times.assist,
                dedicated_time: times.dedicated,
                fractional_time: times.fractional,
                idle_time: times.idle,
                cpu_fraction,
                termination_restarts: record.restarts,
            }
        };
        self.history.push(metrics);
        self.pauses.record(metrics.start_pause);
        self.pauses.record(metrics.termination_pause);
        let procs = u32::try_from(self.pacer.procs()).unwrap_or(u32::MAX);
        let pause_cpu = metrics.total_pause().saturating_mul(procs);
        self.counters
            .record_cycle(metrics.forced, metrics.total_pause(), times.total() + pause_cpu);
        trace::log_cycle_end(&metrics);

        {
            let mut completed = self.gc.completed.lock();
            *completed = cycle;
            self.gc.completed_cond.notify_all();
        }
        self.world.start_the_world();
        self.sweep.wake();
    }

    /// Waits until `n` cycles have completed or `timeout` elapses; returns
    /// whether they have.
    pub(crate) fn wait_for_cycle(&self, n: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut completed = self.gc.completed.lock();
        while !cycle_reached(*completed, n) {
            if self
                .gc
                .completed_cond
                .wait_until(&mut completed, deadline)
                .timed_out()
            {
                return cycle_reached(*completed, n);
            }
        }
        true
    }

    /// Blocks until `n` cycles have completed, marking while cycle `n` is
    /// in its mark phase.
    ///
    /// The caller must not be a running mutator.
    pub(crate) fn wait_for_cycle_helping(&self, n: u32) {
        let mut gcw = GcWork::new();
        while !cycle_reached(self.gc.completed_cycles(), n) {
            if self.phase() == GcPhase::Mark && self.gc.blackening() {
                self.gc.busy.fetch_add(1, Ordering::SeqCst);
                if self.gc.blackening() {
                    self.drain(&mut gcw, Some(HELP_BUDGET), false, &mut || true);
                }
                gcw.dispose(&self.grey);
                self.flush_mark_stats(&mut gcw, false);
                self.gc.busy.fetch_sub(1, Ordering::SeqCst);
                if self.mark_work_drained() && self.mark_done() {
                    continue;
                }
            }
            self.wait_for_cycle(n, HELP_PARK);
        }
    }

    /// Runs a full cycle.
    ///
    /// Blocking: waits for a cycle in progress, starts a fresh one and
    /// waits for its termination, marking along the way. Non-blocking:
    /// leaves a request for the background thread.
    pub(crate) fn force_gc(&self, blocking: bool) {
        if !blocking {
            self.gc.pending_force.store(true, Ordering::Release);
            self.sweep.wake();
            return;
        }
        let n = self.gc.started_cycles();
        self.wait_for_cycle_helping(n);
        self.gc_start(GcTrigger::Cycle(n.wrapping_add(1)));
        self.wait_for_cycle_helping(n.wrapping_add(1));
    }

    /// Starts deferred forced cycles and periodic cycles. Called from the
    /// background thread.
    pub(crate) fn service_triggers(&self) {
        if self.gc.pending_force.swap(false, Ordering::AcqRel) {
            let next = self.gc.started_cycles().wrapping_add(1);
            if !self.gc_start(GcTrigger::Cycle(next)) && self.phase() != GcPhase::Off {
                // A cycle is already running; ask again once it is over.
                self.gc.pending_force.store(true, Ordering::Release);
            }
        }
        if self.test_trigger(GcTrigger::Time) {
            self.gc_start(GcTrigger::Time);
        }
    }

    /// Sets the growth percentage and returns the previous one. Disabling
    /// collection waits for a running cycle to finish.
    ///
    /// The caller must not be a running mutator.
    pub(crate) fn set_gc_percent(&self, pct: i32) -> i32 {
        let old = {
            let _order = LockGuard::new(LockOrder::Transition);
            let _transition = self.gc.transition.lock();
            let heap_live = self.counters.heap_live();
            let old = self
                .pacer
                .set_gc_percent(pct, heap_live, self.sweep_progress());
            if self.phase() == GcPhase::Mark {
                self.pacer.revise(heap_live, self.counters.heap_scan());
            }
            old
        };
        if pct < 0 {
            self.wait_for_cycle_helping(self.gc.started_cycles());
        }
        old
    }

    /// Stores `new` into `slot`, shading both the overwritten and the new
    /// pointer while marking.
    ///
    /// # Safety
    ///
    /// `slot` must be a valid, word-aligned pointer slot that stays mapped
    /// for the duration of the call.
    pub(crate) unsafe fn write_barrier(&self, gcw: &mut GcWork, slot: *mut Address, new: Address) {
        // SAFETY: the caller guarantees `slot` is an aligned, mapped word;
        // `Address` has the layout of `usize`.
        let cell = unsafe { &*slot.cast::<AtomicUsize>() };
        match self.phase() {
            GcPhase::Off => {}
            GcPhase::Mark => {
                let old = Address::from_usize(cell.load(Ordering::Acquire));
                self.shade(old, gcw);
                self.shade(new, gcw);
            }
            GcPhase::MarkTermination => {
                fatal!("write barrier at {:?} during mark termination", slot);
            }
        }
        cell.store(new.as_usize(), Ordering::Release);
    }

    /// Nanoseconds of collector CPU time per available processor second
    /// since the heap was created.
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn gc_cpu_fraction(&self) -> f64 {
        let elapsed = duration_ns(self.created.elapsed()) as f64 * self.pacer.procs() as f64;
        if elapsed == 0.0 {
            return 0.0;
        }
        self.counters.gc_cpu_ns.load(Ordering::Acquire) as f64 / elapsed
    }
}
