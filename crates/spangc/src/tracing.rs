//! GC tracing support.
//!
//! When the `tracing` feature is enabled, this module emits structured
//! spans and events for collection cycles, pacing decisions, sweeping and
//! heap growth. Without the feature the same functions exist as no-ops so
//! call sites need no `cfg` gates.

#[cfg(feature = "tracing")]
pub mod internal {
    use tracing::{span, Level};

    use crate::metrics::GcMetrics;

    /// Guard for the span covering one collection cycle.
    pub type CycleSpan = span::EnteredSpan;

    /// Create a span for one collection cycle.
    pub fn trace_gc_cycle(cycle: u32, trigger: &str) -> CycleSpan {
        span!(Level::DEBUG, "gc_cycle", cycle, trigger).entered()
    }

    /// Log the start of the concurrent mark phase.
    pub fn log_cycle_start(cycle: u32, heap_live: u64, trigger_bytes: u64, goal_bytes: u64) {
        tracing::debug!(cycle, heap_live, trigger_bytes, goal_bytes, "mark_start");
    }

    /// Log the pacer's targets for a new cycle.
    pub fn log_pacer_targets(
        assist_work_per_byte: f64,
        dedicated_workers: usize,
        fractional_goal: f64,
    ) {
        tracing::trace!(
            assist_work_per_byte,
            dedicated_workers,
            fractional_goal,
            "pacer_targets"
        );
    }

    /// Log the trigger ratio chosen for the next cycle.
    pub fn log_pacer_feedback(actual_growth: f64, utilization: f64, next_ratio: f64) {
        tracing::debug!(actual_growth, utilization, next_ratio, "pacer_feedback");
    }

    /// Log a termination attempt that found more work.
    pub fn log_termination_restart(cycle: u32, restarts: u32) {
        tracing::debug!(cycle, restarts, "mark_termination_restart");
    }

    /// Log a completed cycle.
    pub fn log_cycle_end(metrics: &GcMetrics) {
        tracing::debug!(
            cycle = metrics.cycle,
            forced = metrics.forced,
            heap_marked = metrics.heap_marked,
            heap_goal = metrics.heap_goal,
            pause_us = u64::try_from(metrics.total_pause().as_micros()).unwrap_or(u64::MAX),
            restarts = metrics.termination_restarts,
            "mark_termination"
        );
    }

    /// Log that every span of a sweep generation has been swept.
    pub fn log_sweep_done(sweep_gen: u32, pages_in_use: usize) {
        tracing::debug!(sweep_gen, pages_in_use, "sweep_done");
    }

    /// Log a new OS mapping.
    pub fn log_arena_growth(start: usize, bytes: usize, heap_sys: usize) {
        tracing::debug!(start = format_args!("{start:#x}"), bytes, heap_sys, "arena_growth");
    }

    /// Log an allocation that could not be satisfied.
    pub fn log_out_of_memory(requested: usize, heap_sys: usize) {
        tracing::warn!(requested, heap_sys, "out_of_memory");
    }

    /// Log memory returned to the OS.
    pub fn log_scavenge(released: usize, heap_released: usize) {
        tracing::debug!(released, heap_released, "scavenge");
    }

    /// Log a fatal collector error.
    pub fn log_fatal(msg: &str) {
        tracing::error!(msg, "fatal");
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn)]
pub mod internal {
    use crate::metrics::GcMetrics;

    /// Stub span guard when tracing is disabled.
    #[derive(Debug)]
    pub struct CycleSpan;

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn trace_gc_cycle(_cycle: u32, _trigger: &str) -> CycleSpan {
        CycleSpan
    }

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn log_cycle_start(_cycle: u32, _heap_live: u64, _trigger_bytes: u64, _goal_bytes: u64) {}

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn log_pacer_targets(
        _assist_work_per_byte: f64,
        _dedicated_workers: usize,
        _fractional_goal: f64,
    ) {
    }

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn log_pacer_feedback(_actual_growth: f64, _utilization: f64, _next_ratio: f64) {}

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn log_termination_restart(_cycle: u32, _restarts: u32) {}

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn log_cycle_end(_metrics: &GcMetrics) {}

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn log_sweep_done(_sweep_gen: u32, _pages_in_use: usize) {}

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn log_arena_growth(_start: usize, _bytes: usize, _heap_sys: usize) {}

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn log_out_of_memory(_requested: usize, _heap_sys: usize) {}

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn log_scavenge(_released: usize, _heap_released: usize) {}

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn log_fatal(_msg: &str) {}
}

pub(crate) use internal::log_fatal;
