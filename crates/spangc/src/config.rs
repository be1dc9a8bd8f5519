//! Heap and collector configuration.

use std::env;
use std::time::Duration;

/// Default heap size below which no automatic cycle starts (at `gc_percent = 100`).
pub const DEFAULT_HEAP_MINIMUM: usize = 4 << 20;

/// Default interval after which an idle heap is collected anyway.
pub const DEFAULT_FORCE_GC_PERIOD: Duration = Duration::from_secs(120);

/// Tuning constants of the pacer's feedback controller.
///
/// The defaults are empirically tuned; they are knobs, not semantics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacerConfig {
    /// Target fraction of CPU spent on marking, assists included.
    pub goal_utilization: f64,
    /// Fraction of CPU handed to background mark workers.
    pub background_utilization: f64,
    /// Proportional gain applied to the trigger error.
    pub trigger_gain: f64,
    /// Lower clamp of the trigger ratio, scaled by `gc_percent / 100`.
    pub min_trigger_scale: f64,
    /// Upper clamp of the trigger ratio, scaled by `gc_percent / 100`.
    pub max_trigger_scale: f64,
    /// How far past the goal the heap may run before assists assume the
    /// worst case and scan the whole scannable heap.
    pub max_overshoot: f64,
    /// Trigger ratio used before the first cycle has measured anything.
    pub initial_trigger_ratio: f64,
    /// Scan work a worker accumulates before publishing it.
    pub credit_slack: i64,
    /// Minimum scan work an assist performs once it has to help.
    pub over_assist_work: i64,
    /// Minimum distance between the live heap and the goal at cycle start.
    pub min_goal_distance: u64,
    /// Headroom kept between the live heap and the trigger while sweeping.
    pub sweep_min_heap_distance: u64,
}

impl PacerConfig {
    /// Returns the default constants.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            goal_utilization: 0.30,
            background_utilization: 0.25,
            trigger_gain: 0.5,
            min_trigger_scale: 0.6,
            max_trigger_scale: 0.95,
            max_overshoot: 1.1,
            initial_trigger_ratio: 7.0 / 8.0,
            credit_slack: 2000,
            over_assist_work: 64 << 10,
            min_goal_distance: 1 << 20,
            sweep_min_heap_distance: 1 << 20,
        }
    }
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration of a [`Heap`](crate::Heap).
///
/// # Example
///
/// ```
/// use spangc::GcConfig;
///
/// let mut config = GcConfig::new();
/// config.set_gc_percent(50);
/// config.set_mark_workers(2);
/// assert_eq!(config.gc_percent, 50);
/// ```
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Heap growth allowed between cycles, in percent of the marked heap.
    /// Negative disables automatic collection.
    pub gc_percent: i32,
    /// Heap size below which no automatic cycle starts, at `gc_percent = 100`.
    pub heap_minimum: usize,
    /// Hard cap on memory mapped from the OS; `None` means unlimited.
    pub heap_limit: Option<usize>,
    /// Number of processors the pacer budgets CPU against.
    pub procs: usize,
    /// Background mark worker threads; `None` uses one per processor.
    pub mark_workers: Option<usize>,
    /// Whether a background thread sweeps spans after each cycle.
    pub background_sweep: bool,
    /// Collect at least this often, even without allocation pressure.
    pub force_gc_period: Option<Duration>,
    /// Pacer constants.
    pub pacer: PacerConfig,
}

impl GcConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        let procs = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self {
            gc_percent: 100,
            heap_minimum: DEFAULT_HEAP_MINIMUM,
            heap_limit: None,
            procs,
            mark_workers: None,
            background_sweep: true,
            force_gc_period: Some(DEFAULT_FORCE_GC_PERIOD),
            pacer: PacerConfig::new(),
        }
    }

    /// Creates the default configuration, overridden by environment variables.
    ///
    /// - `SPANGC_GCPERCENT`: an integer, or `off` to disable automatic collection
    /// - `SPANGC_PROCS`: processor count used by the pacer
    /// - `SPANGC_MARK_WORKERS`: number of background mark workers
    ///
    /// Unparsable values are ignored.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if let Some(pct) = env::var("SPANGC_GCPERCENT").ok().and_then(|v| parse_gc_percent(&v)) {
            config.gc_percent = pct;
        }
        if let Some(procs) = env_usize("SPANGC_PROCS").filter(|&n| n > 0) {
            config.procs = procs;
        }
        if let Some(workers) = env_usize("SPANGC_MARK_WORKERS") {
            config.mark_workers = Some(workers);
        }
        config
    }

    /// Sets the growth percentage; negative disables automatic collection.
    pub const fn set_gc_percent(&mut self, pct: i32) -> &mut Self {
        self.gc_percent = if pct < 0 { -1 } else { pct };
        self
    }

    /// Sets the heap minimum at `gc_percent = 100`.
    pub const fn set_heap_minimum(&mut self, bytes: usize) -> &mut Self {
        self.heap_minimum = bytes;
        self
    }

    /// Caps the memory mapped from the OS.
    pub const fn set_heap_limit(&mut self, limit: Option<usize>) -> &mut Self {
        self.heap_limit = limit;
        self
    }

    /// Sets the processor count used by the pacer. Zero is treated as one.
    pub fn set_procs(&mut self, procs: usize) -> &mut Self {
        self.procs = procs.max(1);
        self
    }

    /// Sets the number of background mark workers. Zero leaves marking to
    /// assists and to callers blocked in a forced collection.
    pub const fn set_mark_workers(&mut self, workers: usize) -> &mut Self {
        self.mark_workers = Some(workers);
        self
    }

    /// Enables or disables the background sweeper.
    pub const fn set_background_sweep(&mut self, enabled: bool) -> &mut Self {
        self.background_sweep = enabled;
        self
    }

    /// Sets the periodic collection interval.
    pub const fn set_force_gc_period(&mut self, period: Option<Duration>) -> &mut Self {
        self.force_gc_period = period;
        self
    }

    /// Replaces the pacer constants.
    pub const fn set_pacer(&mut self, pacer: PacerConfig) -> &mut Self {
        self.pacer = pacer;
        self
    }

    /// Number of mark worker threads to spawn.
    #[must_use]
    pub fn mark_worker_count(&self) -> usize {
        self.mark_workers.unwrap_or(self.procs)
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_gc_percent(value: &str) -> Option<i32> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("off") {
        return Some(-1);
    }
    value.parse::<i32>().ok().map(|pct| pct.max(-1))
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok()?.trim().parse().ok()
}
