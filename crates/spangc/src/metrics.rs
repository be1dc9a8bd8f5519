//! GC metrics and statistics.
//!
//! Counters the allocator touches on every refill live in [`HeapCounters`].
//! Everything else is recorded once per cycle at mark termination: a
//! [`GcMetrics`] record goes into the [`GcHistory`] ring and both pauses go
//! into the [`PauseHistogram`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::fatal;

/// Statistics of one completed collection cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GcMetrics {
    /// Cycle number, starting at 1.
    pub cycle: u32,
    /// Whether the cycle was requested by the user rather than the pacer.
    pub forced: bool,
    /// Wall time from the start pause to the end of mark termination.
    pub duration: Duration,
    /// Wall time spent in the concurrent mark phase.
    pub mark_duration: Duration,
    /// Stop-the-world pause that started the cycle.
    pub start_pause: Duration,
    /// Stop-the-world pause of mark termination (including restarts).
    pub termination_pause: Duration,
    /// `heap_live` when the cycle started.
    pub heap_live_at_trigger: u64,
    /// Bytes marked during the cycle.
    pub heap_marked: u64,
    /// Heap goal of the cycle.
    pub heap_goal: u64,
    /// `heap_live` when marking finished.
    pub heap_live_at_end: u64,
    /// Trigger ratio the cycle was started with.
    pub trigger_ratio: f64,
    /// Trigger ratio chosen for the next cycle.
    pub next_trigger_ratio: f64,
    /// Bytes of scan work performed.
    pub scan_work: u64,
    /// Time mutators spent assisting.
    pub assist_time: Duration,
    /// Time spent by dedicated mark workers.
    pub dedicated_time: Duration,
    /// Time spent by fractional mark workers.
    pub fractional_time: Duration,
    /// Time spent by idle mark workers.
    pub idle_time: Duration,
    /// Fraction of the available CPU spent on marking during the cycle.
    pub cpu_fraction: f64,
    /// How many times termination found new work and restarted the world.
    pub termination_restarts: u32,
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMetrics {
    /// Creates a record with every field zeroed.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cycle: 0,
            forced: false,
            duration: Duration::ZERO,
            mark_duration: Duration::ZERO,
            start_pause: Duration::ZERO,
            termination_pause: Duration::ZERO,
            heap_live_at_trigger: 0,
            heap_marked: 0,
            heap_goal: 0,
            heap_live_at_end: 0,
            trigger_ratio: 0.0,
            next_trigger_ratio: 0.0,
            scan_work: 0,
            assist_time: Duration::ZERO,
            dedicated_time: Duration::ZERO,
            fractional_time: Duration::ZERO,
            idle_time: Duration::ZERO,
            cpu_fraction: 0.0,
            termination_restarts: 0,
        }
    }

    /// Total stop-the-world time of the cycle.
    #[must_use]
    pub fn total_pause(&self) -> Duration {
        self.start_pause + self.termination_pause
    }

    /// Heap growth ratio reached at the end of marking, relative to the
    /// marked heap.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn actual_growth(&self) -> f64 {
        if self.heap_marked == 0 {
            return 0.0;
        }
        self.heap_live_at_end as f64 / self.heap_marked as f64 - 1.0
    }
}

/// Ring buffer size for GC history.
const HISTORY_SIZE: usize = 64;

struct Ring {
    buffer: [GcMetrics; HISTORY_SIZE],
    total: usize,
}

/// Fixed-size ring of the most recent 64 cycles.
///
/// # Example
///
/// ```
/// use spangc::GcHistory;
///
/// let history = GcHistory::new();
/// assert_eq!(history.total_recorded(), 0);
/// assert!(history.recent(10).is_empty());
/// ```
pub struct GcHistory {
    ring: Mutex<Ring>,
}

impl Default for GcHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GcHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcHistory")
            .field("total_recorded", &self.total_recorded())
            .finish_non_exhaustive()
    }
}

impl GcHistory {
    /// Creates an empty history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: Mutex::new(Ring {
                buffer: [GcMetrics::new(); HISTORY_SIZE],
                total: 0,
            }),
        }
    }

    pub(crate) fn push(&self, metrics: GcMetrics) {
        let mut ring = self.ring.lock();
        let idx = ring.total % HISTORY_SIZE;
        ring.buffer[idx] = metrics;
        ring.total += 1;
    }

    /// Number of cycles recorded; may exceed the ring size.
    #[inline]
    #[must_use]
    pub fn total_recorded(&self) -> usize {
        self.ring.lock().total
    }

    /// The most recent `n` records, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<GcMetrics> {
        let ring = self.ring.lock();
        let n = n.min(HISTORY_SIZE).min(ring.total);
        (ring.total - n..ring.total)
            .map(|i| ring.buffer[i % HISTORY_SIZE])
            .collect()
    }

    /// The last completed cycle, if any.
    #[must_use]
    pub fn last(&self) -> Option<GcMetrics> {
        self.recent(1).pop()
    }

    /// Average total pause over the most recent `n` cycles.
    ///
    /// Returns `Duration::ZERO` if no cycle has been recorded.
    #[must_use]
    pub fn average_pause_time(&self, n: usize) -> Duration {
        let recent = self.recent(n);
        if recent.is_empty() {
            return Duration::ZERO;
        }
        let total_ns: u128 = recent.iter().map(|m| m.total_pause().as_nanos()).sum();
        Duration::from_nanos(
            (total_ns / recent.len() as u128)
                .try_into()
                .unwrap_or(u64::MAX),
        )
    }

    /// Longest total pause over the most recent `n` cycles.
    #[must_use]
    pub fn max_pause_time(&self, n: usize) -> Duration {
        self.recent(n)
            .iter()
            .map(GcMetrics::total_pause)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

const PAUSE_BUCKETS: usize = 32;

/// Histogram of stop-the-world pauses in power-of-two microsecond buckets.
///
/// Bucket 0 counts pauses under 1µs; bucket `i > 0` counts pauses in
/// `[2^(i-1), 2^i)` µs. The last bucket absorbs everything longer.
#[derive(Debug)]
pub struct PauseHistogram {
    buckets: [AtomicU64; PAUSE_BUCKETS],
}

impl Default for PauseHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseHistogram {
    /// Creates an empty histogram.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buckets: [const { AtomicU64::new(0) }; PAUSE_BUCKETS],
        }
    }

    fn bucket_of(pause: Duration) -> usize {
        let us = pause.as_micros();
        if us == 0 {
            0
        } else {
            ((u128::BITS - us.leading_zeros()) as usize).min(PAUSE_BUCKETS - 1)
        }
    }

    /// Records one pause.
    pub fn record(&self, pause: Duration) {
        self.buckets[Self::bucket_of(pause)].fetch_add(1, Ordering::Relaxed);
    }

    /// Number of pauses recorded.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).sum()
    }

    /// Per-bucket counts.
    #[must_use]
    pub fn bucket_counts(&self) -> [u64; PAUSE_BUCKETS] {
        std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed))
    }

    /// Upper bound of the bucket holding the `q` quantile (`0.0..=1.0`).
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn quantile(&self, q: f64) -> Duration {
        let counts = self.bucket_counts();
        let total: u64 = counts.iter().sum();
        if total == 0 {
            return Duration::ZERO;
        }
        let rank = ((total as f64) * q.clamp(0.0, 1.0)).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (i, &c) in counts.iter().enumerate() {
            seen += c;
            if seen >= rank {
                return Duration::from_micros(1u64 << i);
            }
        }
        Duration::from_micros(1u64 << (PAUSE_BUCKETS - 1))
    }
}

/// Atomic counters updated by the allocator and the collector.
#[derive(Debug, Default)]
pub struct HeapCounters {
    /// Bytes considered live by the pacer: marked bytes plus everything
    /// allocated (or cached for allocation) since.
    pub(crate) heap_live: AtomicU64,
    /// Scannable bytes the next cycle expects to scan.
    pub(crate) heap_scan: AtomicU64,
    /// Bytes marked in the current cycle.
    pub(crate) bytes_marked: AtomicU64,
    pub(crate) total_alloc: AtomicU64,
    pub(crate) total_freed: AtomicU64,
    pub(crate) mallocs: AtomicU64,
    pub(crate) frees: AtomicU64,
    pub(crate) num_gc: AtomicU64,
    pub(crate) num_forced_gc: AtomicU64,
    pub(crate) last_gc_unix_ns: AtomicU64,
    pub(crate) pause_total_ns: AtomicU64,
    pub(crate) gc_cpu_ns: AtomicU64,
}

impl HeapCounters {
    pub(crate) fn add_alloc(&self, bytes: u64, count: u64) {
        if count > 0 {
            self.total_alloc.fetch_add(bytes, Ordering::Relaxed);
            self.mallocs.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub(crate) fn add_freed(&self, bytes: u64, count: u64) {
        if count > 0 {
            self.total_freed.fetch_add(bytes, Ordering::Relaxed);
            self.frees.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// A count that would drop below zero means bytes were uncached twice
    /// or never cached, and is fatal.
    pub(crate) fn add_heap_live(&self, delta: i64) {
        if delta >= 0 {
            self.heap_live.fetch_add(delta.unsigned_abs(), Ordering::AcqRel);
            return;
        }
        if let Err(live) = self
            .heap_live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| apply_heap_live_delta(v, delta))
        {
            fatal!("heap_live underflow: {live} live bytes, delta {delta}");
        }
    }

    pub(crate) fn heap_live(&self) -> u64 {
        self.heap_live.load(Ordering::Acquire)
    }

    pub(crate) fn add_heap_scan(&self, bytes: u64) {
        if bytes > 0 {
            self.heap_scan.fetch_add(bytes, Ordering::AcqRel);
        }
    }

    pub(crate) fn heap_scan(&self) -> u64 {
        self.heap_scan.load(Ordering::Acquire)
    }

    pub(crate) fn record_cycle(&self, forced: bool, pause: Duration, gc_cpu: Duration) {
        self.num_gc.fetch_add(1, Ordering::AcqRel);
        if forced {
            self.num_forced_gc.fetch_add(1, Ordering::AcqRel);
        }
        self.pause_total_ns
            .fetch_add(duration_ns(pause), Ordering::AcqRel);
        self.gc_cpu_ns.fetch_add(duration_ns(gc_cpu), Ordering::AcqRel);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, duration_ns);
        self.last_gc_unix_ns.store(now, Ordering::Release);
    }
}

/// Applies `delta` to a live-byte count, or `None` if it would go negative.
const fn apply_heap_live_delta(live: u64, delta: i64) -> Option<u64> {
    if delta >= 0 {
        live.checked_add(delta.unsigned_abs())
    } else {
        live.checked_sub(delta.unsigned_abs())
    }
}

pub(crate) fn duration_ns(d: Duration) -> u64 {
    d.as_nanos().try_into().unwrap_or(u64::MAX)
}

/// Point-in-time snapshot of heap statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemStats {
    /// Bytes of allocated objects (live plus not yet swept).
    pub heap_alloc: u64,
    /// Bytes mapped from the OS.
    pub heap_sys: u64,
    /// Bytes in free page ranges.
    pub heap_idle: u64,
    /// Bytes in in-use and manual spans.
    pub heap_inuse: u64,
    /// Bytes of free pages returned to the OS.
    pub heap_released: u64,
    /// Cumulative bytes allocated.
    pub total_alloc: u64,
    /// Cumulative bytes freed by sweeping or explicit frees.
    pub total_freed: u64,
    /// Cumulative objects allocated.
    pub mallocs: u64,
    /// Cumulative objects freed.
    pub frees: u64,
    /// `heap_live` at which the next cycle triggers; `u64::MAX` when off.
    pub next_gc: u64,
    /// Wall-clock time of the last completed cycle, in nanoseconds since
    /// the Unix epoch; 0 before the first cycle.
    pub last_gc: u64,
    /// Completed cycles.
    pub num_gc: u64,
    /// Completed cycles that were requested by the user.
    pub num_forced_gc: u64,
    /// Cumulative stop-the-world time.
    pub pause_total: Duration,
    /// Fraction of available CPU time used by the collector since the heap
    /// was created.
    pub gc_cpu_fraction: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gc_metrics_new_is_zeroed() {
        let metrics = GcMetrics::new();
        assert_eq!(metrics.cycle, 0);
        assert_eq!(metrics.total_pause(), Duration::ZERO);
        assert!(metrics.actual_growth().abs() < f64::EPSILON);
    }

    #[test]
    fn test_actual_growth() {
        let metrics = GcMetrics {
            heap_marked: 1000,
            heap_live_at_end: 1500,
            ..GcMetrics::new()
        };
        assert!((metrics.actual_growth() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_history_wraps() {
        let history = GcHistory::new();
        for cycle in 1..=100 {
            history.push(GcMetrics {
                cycle,
                start_pause: Duration::from_micros(u64::from(cycle)),
                ..GcMetrics::new()
            });
        }
        assert_eq!(history.total_recorded(), 100);
        let recent = history.recent(1000);
        assert_eq!(recent.len(), HISTORY_SIZE);
        assert_eq!(recent.first().unwrap().cycle, 37);
        assert_eq!(history.last().unwrap().cycle, 100);
        assert_eq!(history.max_pause_time(10), Duration::from_micros(100));
        assert_eq!(history.average_pause_time(2), Duration::from_nanos(99_500));
    }

    #[test]
    fn test_pause_histogram() {
        let hist = PauseHistogram::new();
        hist.record(Duration::from_nanos(10));
        hist.record(Duration::from_micros(1));
        hist.record(Duration::from_micros(3));
        hist.record(Duration::from_micros(900));
        assert_eq!(hist.count(), 4);
        let counts = hist.bucket_counts();
        assert_eq!(counts[0], 1);
        assert_eq!(counts[1], 1);
        assert_eq!(counts[2], 1);
        assert_eq!(counts[10], 1);
        assert_eq!(hist.quantile(0.5), Duration::from_micros(2));
        assert_eq!(hist.quantile(1.0), Duration::from_micros(1024));
    }

    #[test]
    fn test_heap_live_tracks_deltas() {
        let counters = HeapCounters::default();
        counters.add_heap_live(100);
        counters.add_heap_live(-40);
        assert_eq!(counters.heap_live(), 60);
        counters.add_heap_live(-60);
        assert_eq!(counters.heap_live(), 0);
    }

    #[test]
    fn test_heap_live_underflow_is_rejected() {
        assert_eq!(apply_heap_live_delta(100, -40), Some(60));
        assert_eq!(apply_heap_live_delta(100, -100), Some(0));
        assert_eq!(apply_heap_live_delta(100, -250), None);
        assert_eq!(apply_heap_live_delta(0, i64::MIN), None);
        assert_eq!(apply_heap_live_delta(5, 10), Some(15));
    }
}
