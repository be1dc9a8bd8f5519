//! Feedback-controlled GC pacer.
//!
//! The pacer decides when the next cycle starts (the *trigger*), how large
//! the heap may grow before marking must be done (the *goal*), and how much
//! scan work a mutator owes per byte it allocates while marking runs.
//!
//! After each cycle the trigger ratio is nudged toward the value that would
//! have finished marking exactly at the goal while using the target CPU
//! utilization:
//!
//! ```text
//! error = goal_growth - ratio - (utilization / goal_utilization) * (actual_growth - ratio)
//! next  = ratio + trigger_gain * error
//! ```

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::{GcConfig, PacerConfig};
use crate::metrics::duration_ns;
use crate::size_class::PAGE_SIZE;
use crate::tracing::internal as trace;

/// Largest tolerated relative error between the dedicated worker count and
/// the background utilization goal before fractional workers take over.
const MAX_UTIL_ERROR: f64 = 0.3;

/// Slack kept between the trigger and the live heap when computing the
/// proportional sweep rate.
const SWEEP_HEAP_SLACK: u64 = 1 << 20;

/// Per-cycle targets computed when a cycle starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleTargets {
    /// `heap_live` at which the cycle was triggered.
    pub trigger_bytes: u64,
    /// Heap size at which marking should be complete.
    pub goal_bytes: u64,
    /// Scan work a mutator owes per allocated byte.
    pub assist_work_per_byte: f64,
    /// Background workers that run in dedicated mode.
    pub dedicated_workers: usize,
    /// Per-worker CPU fraction for fractional workers.
    pub fractional_goal: f64,
}

/// Sweep progress consulted when the trigger moves.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepProgress {
    /// Every span of the current generation has been swept.
    pub sweep_done: bool,
    /// Pages held by in-use spans.
    pub pages_in_use: u64,
    /// Pages swept so far in the current generation.
    pub pages_swept: u64,
}

/// Which kind of mark worker spent time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// Runs until no work remains.
    Dedicated,
    /// Runs while under its share of the fractional goal.
    Fractional,
    /// Runs on an otherwise idle processor.
    Idle,
}

#[derive(Debug)]
struct PacerState {
    gc_percent: i32,
    heap_minimum: u64,
    trigger_ratio: f64,
    heap_marked: u64,
    mark_start: Option<Instant>,
    user_forced: bool,
}

/// The pacer.
#[derive(Debug)]
pub struct GcController {
    config: PacerConfig,
    base_heap_minimum: u64,
    procs: usize,
    state: Mutex<PacerState>,

    trigger: AtomicU64,
    goal: AtomicU64,

    scan_work: AtomicI64,
    bg_scan_credit: AtomicI64,
    assist_work_per_byte: AtomicU64,
    assist_bytes_per_work: AtomicU64,
    dedicated_needed: AtomicI64,
    fractional_goal: AtomicU64,

    assist_time: AtomicI64,
    dedicated_time: AtomicI64,
    fractional_time: AtomicI64,
    idle_time: AtomicI64,

    sweep_pages_per_byte: AtomicU64,
    sweep_heap_live_basis: AtomicU64,
    sweep_pages_swept_basis: AtomicU64,
}

fn load_f64(a: &AtomicU64) -> f64 {
    f64::from_bits(a.load(Ordering::Acquire))
}

fn store_f64(a: &AtomicU64, v: f64) {
    a.store(v.to_bits(), Ordering::Release);
}

#[allow(clippy::cast_precision_loss)]
const fn as_f64(v: u64) -> f64 {
    v as f64
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn as_u64(v: f64) -> u64 {
    if v >= as_f64(u64::MAX) {
        u64::MAX
    } else {
        v.max(0.0) as u64
    }
}

impl GcController {
    /// Creates a pacer for the given configuration.
    ///
    /// Before the first cycle the marked heap is assumed to be whatever
    /// makes the initial trigger land on the heap minimum.
    #[must_use]
    pub fn new(config: &GcConfig) -> Self {
        let pacer = config.pacer;
        let base_heap_minimum = config.heap_minimum as u64;
        let heap_minimum = scaled_minimum(base_heap_minimum, config.gc_percent);
        let heap_marked = as_u64(as_f64(heap_minimum) / (1.0 + pacer.initial_trigger_ratio));
        let controller = Self {
            config: pacer,
            base_heap_minimum,
            procs: config.procs.max(1),
            state: Mutex::new(PacerState {
                gc_percent: config.gc_percent,
                heap_minimum,
                trigger_ratio: pacer.initial_trigger_ratio,
                heap_marked,
                mark_start: None,
                user_forced: false,
            }),
            trigger: AtomicU64::new(u64::MAX),
            goal: AtomicU64::new(u64::MAX),
            scan_work: AtomicI64::new(0),
            bg_scan_credit: AtomicI64::new(0),
            assist_work_per_byte: AtomicU64::new(0),
            assist_bytes_per_work: AtomicU64::new(0),
            dedicated_needed: AtomicI64::new(0),
            fractional_goal: AtomicU64::new(0),
            assist_time: AtomicI64::new(0),
            dedicated_time: AtomicI64::new(0),
            fractional_time: AtomicI64::new(0),
            idle_time: AtomicI64::new(0),
            sweep_pages_per_byte: AtomicU64::new(0),
            sweep_heap_live_basis: AtomicU64::new(0),
            sweep_pages_swept_basis: AtomicU64::new(0),
        };
        controller.set_trigger_ratio(pacer.initial_trigger_ratio, 0, SweepProgress {
            sweep_done: true,
            ..SweepProgress::default()
        });
        controller
    }

    /// Pacer constants.
    #[must_use]
    pub const fn config(&self) -> &PacerConfig {
        &self.config
    }

    /// Processor count CPU budgets are computed against.
    #[must_use]
    pub const fn procs(&self) -> usize {
        self.procs
    }

    /// Current growth percentage; negative when automatic GC is off.
    #[must_use]
    pub fn gc_percent(&self) -> i32 {
        self.state.lock().gc_percent
    }

    /// Current trigger ratio.
    #[must_use]
    pub fn trigger_ratio(&self) -> f64 {
        self.state.lock().trigger_ratio
    }

    /// Bytes marked by the last cycle (or the initial estimate).
    #[must_use]
    pub fn heap_marked(&self) -> u64 {
        self.state.lock().heap_marked
    }

    /// Heap minimum scaled by the growth percentage.
    #[must_use]
    pub fn heap_minimum(&self) -> u64 {
        self.state.lock().heap_minimum
    }

    /// `heap_live` at which the next cycle starts; `u64::MAX` when off.
    #[must_use]
    pub fn trigger(&self) -> u64 {
        self.trigger.load(Ordering::Acquire)
    }

    /// Heap goal; `u64::MAX` when off.
    #[must_use]
    pub fn goal(&self) -> u64 {
        self.goal.load(Ordering::Acquire)
    }

    /// Whether `heap_live` has reached the trigger.
    #[must_use]
    pub fn heap_trigger_reached(&self, heap_live: u64) -> bool {
        heap_live >= self.trigger()
    }

    /// Changes the growth percentage and re-derives the trigger.
    /// Returns the previous percentage.
    pub fn set_gc_percent(&self, pct: i32, heap_live: u64, sweep: SweepProgress) -> i32 {
        let (old, ratio) = {
            let mut state = self.state.lock();
            let old = state.gc_percent;
            state.gc_percent = pct.max(-1);
            state.heap_minimum = scaled_minimum(self.base_heap_minimum, state.gc_percent);
            (old, state.trigger_ratio)
        };
        self.set_trigger_ratio(ratio, heap_live, sweep);
        old
    }

    /// Clamps `ratio` and derives the trigger and goal from the marked heap.
    ///
    /// The ratio is clamped to `[min, max] * gc_percent / 100`. The trigger
    /// never falls below the heap minimum, nor below `heap_live` plus some
    /// sweeping headroom while sweeping is unfinished. The goal is never
    /// below the trigger. With `gc_percent < 0` both are infinite.
    pub fn set_trigger_ratio(&self, ratio: f64, heap_live: u64, sweep: SweepProgress) {
        let mut state = self.state.lock();
        let pct = state.gc_percent;
        let marked = state.heap_marked;

        let mut ratio = ratio;
        let mut goal = u64::MAX;
        let mut trigger = u64::MAX;
        if pct >= 0 {
            let scale = f64::from(pct) / 100.0;
            ratio = ratio
                .min(self.config.max_trigger_scale * scale)
                .max(self.config.min_trigger_scale * scale);
            goal = marked.saturating_add(marked.saturating_mul(pct.unsigned_abs().into()) / 100);

            let mut min_trigger = state.heap_minimum;
            if !sweep.sweep_done {
                min_trigger = min_trigger.max(heap_live.saturating_add(self.config.sweep_min_heap_distance));
            }
            trigger = as_u64(as_f64(marked) * (1.0 + ratio)).max(min_trigger);
            goal = goal.max(trigger);
        } else {
            ratio = ratio.max(0.0);
        }
        state.trigger_ratio = ratio;
        self.trigger.store(trigger, Ordering::Release);
        self.goal.store(goal, Ordering::Release);

        // Sweep everything still in use before heap_live reaches the trigger.
        let pages_left = sweep.pages_in_use.saturating_sub(sweep.pages_swept);
        if sweep.sweep_done || pages_left == 0 || trigger == u64::MAX {
            store_f64(&self.sweep_pages_per_byte, 0.0);
        } else {
            let distance = trigger
                .saturating_sub(heap_live)
                .saturating_sub(SWEEP_HEAP_SLACK)
                .max(PAGE_SIZE as u64);
            store_f64(&self.sweep_pages_per_byte, as_f64(pages_left) / as_f64(distance));
            self.sweep_heap_live_basis.store(heap_live, Ordering::Release);
            self.sweep_pages_swept_basis
                .store(sweep.pages_swept, Ordering::Release);
        }
    }

    /// Resets per-cycle state and computes the targets for a new cycle.
    pub fn on_cycle_start(&self, heap_live: u64, heap_scan: u64, user_forced: bool) -> CycleTargets {
        self.scan_work.store(0, Ordering::Release);
        self.bg_scan_credit.store(0, Ordering::Release);
        self.assist_time.store(0, Ordering::Release);
        self.dedicated_time.store(0, Ordering::Release);
        self.fractional_time.store(0, Ordering::Release);
        self.idle_time.store(0, Ordering::Release);

        let min_goal = heap_live.saturating_add(self.config.min_goal_distance);
        if self.goal() < min_goal {
            self.goal.store(min_goal, Ordering::Release);
        }

        #[allow(clippy::cast_precision_loss)]
        let total_goal = self.procs as f64 * self.config.background_utilization;
        #[allow(clippy::cast_possible_truncation)]
        let mut dedicated = (total_goal + 0.5) as i64;
        #[allow(clippy::cast_precision_loss)]
        let util_error = if total_goal > 0.0 {
            dedicated as f64 / total_goal - 1.0
        } else {
            0.0
        };
        #[allow(clippy::cast_precision_loss)]
        let fractional = if util_error.abs() > MAX_UTIL_ERROR {
            if dedicated as f64 > total_goal {
                dedicated -= 1;
            }
            (total_goal - dedicated as f64) / self.procs as f64
        } else {
            0.0
        };
        self.dedicated_needed.store(dedicated, Ordering::Release);
        store_f64(&self.fractional_goal, fractional);

        {
            let mut state = self.state.lock();
            state.mark_start = Some(Instant::now());
            state.user_forced = user_forced;
        }
        self.revise(heap_live, heap_scan);

        let targets = CycleTargets {
            trigger_bytes: heap_live,
            goal_bytes: self.goal(),
            assist_work_per_byte: self.assist_work_per_byte(),
            dedicated_workers: usize::try_from(dedicated).unwrap_or(0),
            fractional_goal: fractional,
        };
        trace::log_pacer_targets(
            targets.assist_work_per_byte,
            targets.dedicated_workers,
            targets.fractional_goal,
        );
        targets
    }

    /// Recomputes the assist ratio from the work still expected and the
    /// heap left before the goal. Called at cycle start and whenever scan
    /// work is flushed.
    pub fn revise(&self, heap_live: u64, heap_scan: u64) {
        let pct = match self.gc_percent() {
            p if p < 0 => 100_000,
            p => i64::from(p),
        };
        let work = self.scan_work.load(Ordering::Acquire);
        let mut goal = self.goal();
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let mut expected = (heap_scan as f64 * 100.0 / (100 + pct) as f64) as i64;
        if heap_live > goal || work > expected {
            goal = as_u64(as_f64(goal) * self.config.max_overshoot);
            expected = i64::try_from(heap_scan).unwrap_or(i64::MAX);
        }
        let remaining_work = expected.saturating_sub(work).max(1000);
        let remaining_heap = goal.saturating_sub(heap_live).max(1);

        #[allow(clippy::cast_precision_loss)]
        let work_f = remaining_work as f64;
        let heap_f = as_f64(remaining_heap);
        store_f64(&self.assist_work_per_byte, work_f / heap_f);
        store_f64(&self.assist_bytes_per_work, heap_f / work_f);
    }

    /// Growth the heap reached over the last marked heap.
    #[must_use]
    pub fn actual_growth(&self, heap_live: u64) -> f64 {
        let marked = self.heap_marked().max(1);
        as_f64(heap_live) / as_f64(marked) - 1.0
    }

    /// Growth ratio the goal represents, accounting for the heap minimum.
    #[must_use]
    pub fn effective_growth(&self) -> f64 {
        let marked = self.heap_marked().max(1);
        let goal = self.goal();
        if goal == u64::MAX {
            return 0.0;
        }
        (as_f64(goal.saturating_sub(marked)) / as_f64(marked)).max(0.0)
    }

    /// Mark CPU utilization of the current cycle: background share plus
    /// assist time over the available CPU time.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        let elapsed = self.mark_elapsed();
        let mut utilization = self.config.background_utilization;
        if !elapsed.is_zero() {
            #[allow(clippy::cast_precision_loss)]
            let available = elapsed.as_nanos() as f64 * self.procs as f64;
            #[allow(clippy::cast_precision_loss)]
            let assist = self.assist_time.load(Ordering::Acquire) as f64;
            utilization += assist / available;
        }
        utilization
    }

    /// Computes the trigger ratio for the next cycle from the growth this
    /// cycle reached. User-forced cycles keep the current ratio.
    #[must_use]
    pub fn on_cycle_end(&self, actual_growth: f64) -> f64 {
        let (ratio, user_forced) = {
            let state = self.state.lock();
            (state.trigger_ratio, state.user_forced)
        };
        if user_forced {
            return ratio;
        }
        let goal_growth = self.effective_growth();
        let utilization = self.utilization();
        let error = goal_growth
            - ratio
            - utilization / self.config.goal_utilization * (actual_growth - ratio);
        let next = ratio + self.config.trigger_gain * error;
        trace::log_pacer_feedback(actual_growth, utilization, next);
        next
    }

    /// Records the bytes marked by the cycle that just finished.
    pub fn set_heap_marked(&self, marked: u64) {
        self.state.lock().heap_marked = marked;
    }

    /// Wall time since the current cycle's mark phase started.
    #[must_use]
    pub fn mark_elapsed(&self) -> Duration {
        self.state
            .lock()
            .mark_start
            .map_or(Duration::ZERO, |start| start.elapsed())
    }

    // ------------------------------------------------------------------------
    // Scan work and assist credit
    // ------------------------------------------------------------------------

    /// Current assist ratio.
    #[must_use]
    pub fn assist_work_per_byte(&self) -> f64 {
        load_f64(&self.assist_work_per_byte)
    }

    /// Inverse of the assist ratio.
    #[must_use]
    pub fn assist_bytes_per_work(&self) -> f64 {
        load_f64(&self.assist_bytes_per_work)
    }

    /// Scan work done this cycle.
    #[must_use]
    pub fn scan_work(&self) -> i64 {
        self.scan_work.load(Ordering::Acquire)
    }

    /// Publishes scan work performed by a worker or an assist.
    pub fn add_scan_work(&self, work: i64) {
        self.scan_work.fetch_add(work, Ordering::AcqRel);
    }

    /// Publishes scan work done by background workers as credit that
    /// mutators in assist debt may steal.
    pub fn add_background_credit(&self, work: i64) {
        self.bg_scan_credit.fetch_add(work, Ordering::AcqRel);
    }

    /// Takes up to `want` units of background credit; returns what was taken.
    pub fn steal_background_credit(&self, want: i64) -> i64 {
        let mut current = self.bg_scan_credit.load(Ordering::Acquire);
        loop {
            if current <= 0 || want <= 0 {
                return 0;
            }
            let take = want.min(current);
            match self.bg_scan_credit.compare_exchange_weak(
                current,
                current - take,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return take,
                Err(actual) => current = actual,
            }
        }
    }

    // ------------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------------

    /// Claims a dedicated worker slot for this cycle.
    pub fn claim_dedicated(&self) -> bool {
        let mut current = self.dedicated_needed.load(Ordering::Acquire);
        while current > 0 {
            match self.dedicated_needed.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Returns a dedicated slot claimed with [`claim_dedicated`](Self::claim_dedicated).
    pub fn release_dedicated(&self) {
        self.dedicated_needed.fetch_add(1, Ordering::AcqRel);
    }

    /// Per-worker CPU fraction for fractional workers this cycle.
    #[must_use]
    pub fn fractional_goal(&self) -> f64 {
        load_f64(&self.fractional_goal)
    }

    /// Accounts time spent marking by a worker of `mode`.
    pub fn add_worker_time(&self, mode: WorkerMode, time: Duration) {
        let ns = i64::try_from(duration_ns(time)).unwrap_or(i64::MAX);
        let counter = match mode {
            WorkerMode::Dedicated => &self.dedicated_time,
            WorkerMode::Fractional => &self.fractional_time,
            WorkerMode::Idle => &self.idle_time,
        };
        counter.fetch_add(ns, Ordering::AcqRel);
    }

    /// Accounts time mutators spent assisting.
    pub fn add_assist_time(&self, time: Duration) {
        let ns = i64::try_from(duration_ns(time)).unwrap_or(i64::MAX);
        self.assist_time.fetch_add(ns, Ordering::AcqRel);
    }

    /// Time spent this cycle by assists and each worker mode.
    #[must_use]
    pub fn cycle_times(&self) -> CycleTimes {
        let get = |a: &AtomicI64| Duration::from_nanos(a.load(Ordering::Acquire).max(0).unsigned_abs());
        CycleTimes {
            assist: get(&self.assist_time),
            dedicated: get(&self.dedicated_time),
            fractional: get(&self.fractional_time),
            idle: get(&self.idle_time),
        }
    }

    // ------------------------------------------------------------------------
    // Sweep pacing
    // ------------------------------------------------------------------------

    /// Pages that should have been swept once `heap_live` reaches the given
    /// value, or `None` when no proportional sweeping is required.
    #[must_use]
    pub fn sweep_pages_target(&self, heap_live: u64) -> Option<u64> {
        let per_byte = load_f64(&self.sweep_pages_per_byte);
        if per_byte <= 0.0 {
            return None;
        }
        let basis = self.sweep_heap_live_basis.load(Ordering::Acquire);
        let swept_basis = self.sweep_pages_swept_basis.load(Ordering::Acquire);
        let allocated = heap_live.saturating_sub(basis);
        Some(swept_basis.saturating_add(as_u64(as_f64(allocated) * per_byte)))
    }

    /// Disables proportional sweeping for the rest of the generation.
    pub fn clear_sweep_pacing(&self) {
        store_f64(&self.sweep_pages_per_byte, 0.0);
    }
}

/// Time spent marking during one cycle, by kind of marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleTimes {
    /// Mutator assists.
    pub assist: Duration,
    /// Dedicated workers.
    pub dedicated: Duration,
    /// Fractional workers.
    pub fractional: Duration,
    /// Idle workers.
    pub idle: Duration,
}

impl CycleTimes {
    /// Total CPU time spent marking.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.assist + self.dedicated + self.fractional + self.idle
    }
}

fn scaled_minimum(base: u64, pct: i32) -> u64 {
    if pct < 0 {
        return 0;
    }
    base.saturating_mul(pct.unsigned_abs().into()) / 100
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(pct: i32, procs: usize) -> GcController {
        let mut config = GcConfig::new();
        config.set_gc_percent(pct).set_procs(procs);
        GcController::new(&config)
    }

    fn swept() -> SweepProgress {
        SweepProgress {
            sweep_done: true,
            ..SweepProgress::default()
        }
    }

    #[test]
    fn test_initial_trigger_is_heap_minimum() {
        let pacer = controller(100, 4);
        let minimum = 4u64 << 20;
        assert!((pacer.trigger_ratio() - 7.0 / 8.0).abs() < 1e-9);
        // heap_marked * (1 + 7/8) rounds down to just below the minimum.
        assert_eq!(pacer.trigger(), minimum);
        assert!(pacer.goal() >= pacer.trigger());
    }

    #[test]
    fn test_ratio_is_clamped() {
        let pacer = controller(50, 4);
        pacer.set_heap_marked(100 << 20);
        pacer.set_trigger_ratio(10.0, 0, swept());
        assert!((pacer.trigger_ratio() - 0.95 * 0.5).abs() < 1e-9);
        pacer.set_trigger_ratio(-1.0, 0, swept());
        assert!((pacer.trigger_ratio() - 0.6 * 0.5).abs() < 1e-9);
        assert!(pacer.trigger().abs_diff(130 << 20) <= 1);
        assert_eq!(pacer.goal(), 150 << 20);
    }

    #[test]
    fn test_disabled_gc_has_infinite_trigger() {
        let pacer = controller(100, 4);
        assert_eq!(pacer.set_gc_percent(-5, 0, swept()), 100);
        assert_eq!(pacer.gc_percent(), -1);
        assert_eq!(pacer.trigger(), u64::MAX);
        assert_eq!(pacer.goal(), u64::MAX);
        assert!(!pacer.heap_trigger_reached(u64::MAX - 1));
    }

    #[test]
    fn test_unfinished_sweep_raises_trigger() {
        let pacer = controller(100, 4);
        pacer.set_heap_marked(1 << 20);
        let sweeping = SweepProgress {
            sweep_done: false,
            pages_in_use: 1000,
            pages_swept: 0,
        };
        pacer.set_trigger_ratio(0.5, 10 << 20, sweeping);
        assert_eq!(pacer.trigger(), (10 << 20) + (1 << 20));
        assert!(pacer.sweep_pages_target(10 << 20).is_some());
    }

    #[test]
    fn test_dedicated_worker_rounding() {
        let four = controller(100, 4);
        let t = four.on_cycle_start(0, 0, false);
        assert_eq!(t.dedicated_workers, 1);
        assert!(t.fractional_goal.abs() < f64::EPSILON);

        let one = controller(100, 1);
        let t = one.on_cycle_start(0, 0, false);
        assert_eq!(t.dedicated_workers, 0);
        assert!((t.fractional_goal - 0.25).abs() < 1e-9);

        let six = controller(100, 6);
        let t = six.on_cycle_start(0, 0, false);
        // 1.5 rounds to 2, which is 33% over the goal.
        assert_eq!(t.dedicated_workers, 1);
        assert!((t.fractional_goal - 0.5 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_revise_assist_ratio() {
        let pacer = controller(100, 4);
        pacer.set_heap_marked(8 << 20);
        pacer.set_trigger_ratio(0.5, 0, swept());
        let t = pacer.on_cycle_start(12 << 20, 8 << 20, false);
        assert_eq!(t.goal_bytes, 16 << 20);
        // (8M * 100/200) / (16M - 12M) = 1.0
        assert!((t.assist_work_per_byte - 1.0).abs() < 1e-9);

        // Past the goal the pacer assumes the whole scannable heap is left.
        pacer.revise(17 << 20, 8 << 20);
        assert!(pacer.assist_work_per_byte() > 1.0);
    }

    #[test]
    fn test_feedback_direction() {
        let pacer = controller(100, 4);
        pacer.set_heap_marked(64 << 20);
        pacer.set_trigger_ratio(0.7, 0, swept());
        let _ = pacer.on_cycle_start(0, 0, false);
        // Overshooting the goal lowers the ratio; undershooting raises it.
        assert!(pacer.on_cycle_end(1.2) < 0.7);
        assert!(pacer.on_cycle_end(0.7) > 0.7);
    }

    #[test]
    fn test_forced_cycle_keeps_ratio() {
        let pacer = controller(100, 4);
        pacer.set_heap_marked(64 << 20);
        pacer.set_trigger_ratio(0.7, 0, swept());
        let _ = pacer.on_cycle_start(0, 0, true);
        assert!((pacer.on_cycle_end(3.0) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_background_credit() {
        let pacer = controller(100, 4);
        pacer.add_background_credit(500);
        assert_eq!(pacer.steal_background_credit(200), 200);
        assert_eq!(pacer.steal_background_credit(1000), 300);
        assert_eq!(pacer.steal_background_credit(1), 0);
    }

    #[test]
    fn test_claim_dedicated() {
        let pacer = controller(100, 4);
        let _ = pacer.on_cycle_start(0, 0, false);
        assert!(pacer.claim_dedicated());
        assert!(!pacer.claim_dedicated());
        pacer.release_dedicated();
        assert!(pacer.claim_dedicated());
    }
}
