//! The collected heap.
//!
//! [`Heap`] owns the allocator tiers (thread caches, central free lists and
//! the page heap), the collector state and the background threads. Mutator
//! threads reach it through [`Mutator`] handles.

pub mod arena;
pub mod cache;
pub mod central;
pub mod page_heap;
pub mod span;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::address::Address;
use crate::config::GcConfig;
use crate::error::{GcError, Result};
use crate::fatal;
use crate::gc::coordinator::GcState;
use crate::gc::marker;
use crate::gc::pacer::GcController;
use crate::gc::sweep::{SweepOutcome, SweepState};
use crate::gc::work::GreyQueue;
use crate::gc::GcPhase;
use crate::metrics::{GcHistory, HeapCounters, MemStats, PauseHistogram};
use crate::mutator::Mutator;
use crate::roots::RootSet;
use crate::size_class::{SpanClass, NUM_SPAN_CLASSES, PAGE_SIZE};
use crate::world::{SafepointWorld, World};

use self::arena::PAGES_PER_ARENA;
use self::central::CentralFreeList;
use self::page_heap::PageHeap;
use self::span::{Span, SpanState};

// ============================================================================
// HeapCore - state shared by mutators and collector threads
// ============================================================================

pub(crate) struct HeapCore {
    pub(crate) config: GcConfig,
    pub(crate) pages: PageHeap,
    pub(crate) central: Box<[CentralFreeList]>,
    pub(crate) sweep: SweepState,
    pub(crate) counters: HeapCounters,
    pub(crate) gc: GcState,
    pub(crate) pacer: GcController,
    pub(crate) grey: GreyQueue,
    pub(crate) world: Arc<dyn World>,
    pub(crate) roots: Arc<dyn RootSet>,
    pub(crate) history: GcHistory,
    pub(crate) pauses: PauseHistogram,
    pub(crate) created: Instant,
}

impl HeapCore {
    fn new(config: GcConfig, roots: Arc<dyn RootSet>, world: Arc<dyn World>) -> Self {
        Self {
            pages: PageHeap::new(config.heap_limit),
            central: (0..NUM_SPAN_CLASSES)
                .map(|i| CentralFreeList::new(SpanClass::from_index(i)))
                .collect(),
            sweep: SweepState::new(),
            counters: HeapCounters::default(),
            gc: GcState::new(),
            pacer: GcController::new(&config),
            grey: GreyQueue::new(),
            world,
            roots,
            history: GcHistory::new(),
            pauses: PauseHistogram::new(),
            created: Instant::now(),
            config,
        }
    }

    pub(crate) fn phase(&self) -> GcPhase {
        self.gc.phase.load()
    }

    pub(crate) fn central(&self, span_class: SpanClass) -> &CentralFreeList {
        &self.central[span_class.index()]
    }

    /// Allocates an in-use span of `npages` pages, reclaiming unmarked
    /// spans first while the previous cycle's sweep is unfinished.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::OutOfMemory`](crate::GcError::OutOfMemory) when
    /// the page heap cannot grow.
    pub(crate) fn alloc_pages(&self, npages: usize, span_class: SpanClass) -> Result<Arc<Span>> {
        let _gen = self.sweep.read_generation();
        if !self.sweep.sweep_done() {
            self.reclaim(npages);
        }
        let sg = self.sweep.sweep_gen();
        let span = self
            .pages
            .alloc_span(npages, span_class, SpanState::InUse, sg)?;
        self.sweep.push_swept(sg, Arc::clone(&span));
        Ok(span)
    }

    /// Allocates a manual span, zeroed. Manual spans are never scanned or
    /// swept.
    pub(crate) fn alloc_manual(&self, npages: usize) -> Result<Arc<Span>> {
        if npages == 0 {
            return Err(GcError::ZeroSize);
        }
        let span = self
            .pages
            .alloc_span(npages, SpanClass::LARGE_NOSCAN, SpanState::Manual, 0)?;
        if span.needs_zero() {
            // SAFETY: the span was just carved for this caller.
            unsafe { Span::zero_slot(span.base(), span.bytes()) };
            span.set_needs_zero(false);
        }
        Ok(span)
    }

    pub(crate) fn free_manual(&self, span: &Span) {
        self.pages.free_span(span, SpanState::Manual);
    }

    /// Frees a swept large span outside of a cycle.
    pub(crate) fn free_large_span(&self, span: &Span) {
        let _gen = self.sweep.read_generation();
        if span.alloc_count() != 1 {
            fatal!("free_large({span:?}) of a span without a live object");
        }
        let bytes = span.bytes() as u64;
        span.clear_large();
        self.counters.add_freed(bytes, 1);
        self.counters
            .add_heap_live(-i64::try_from(bytes).unwrap_or(i64::MAX));
        self.pages.free_span(span, SpanState::InUse);
    }

    /// Sum of `alloc_count * elem_size` over in-use spans.
    pub(crate) fn in_use_object_bytes(&self) -> u64 {
        let mut total = 0u64;
        for arena in self.pages.arenas().arenas() {
            for page in 0..PAGES_PER_ARENA {
                if !arena.page_in_use(page) {
                    continue;
                }
                if let Some(span) = arena.span_at(page).filter(|s| s.state() == SpanState::InUse) {
                    total += (span.alloc_count() * span.elem_size()) as u64;
                }
            }
        }
        total
    }

    pub(crate) fn mem_stats(&self) -> MemStats {
        let c = &self.counters;
        let total_alloc = c.total_alloc.load(Ordering::Acquire);
        let total_freed = c.total_freed.load(Ordering::Acquire);
        let in_use_pages = self.pages.pages_in_use() + self.pages.pages_manual();
        MemStats {
            heap_alloc: total_alloc.saturating_sub(total_freed),
            heap_sys: self.pages.heap_sys() as u64,
            heap_idle: (self.pages.free_pages() * PAGE_SIZE) as u64,
            heap_inuse: (in_use_pages * PAGE_SIZE) as u64,
            heap_released: self.pages.heap_released() as u64,
            total_alloc,
            total_freed,
            mallocs: c.mallocs.load(Ordering::Acquire),
            frees: c.frees.load(Ordering::Acquire),
            next_gc: self.pacer.trigger(),
            last_gc: c.last_gc_unix_ns.load(Ordering::Acquire),
            num_gc: c.num_gc.load(Ordering::Acquire),
            num_forced_gc: c.num_forced_gc.load(Ordering::Acquire),
            pause_total: Duration::from_nanos(c.pause_total_ns.load(Ordering::Acquire)),
            gc_cpu_fraction: self.gc_cpu_fraction(),
        }
    }
}

// ============================================================================
// Heap - public handle
// ============================================================================

/// A garbage-collected heap and its collector threads.
///
/// Dropping the heap stops the mark workers and the background sweeper.
/// Memory stays mapped until the last [`Mutator`] is dropped too.
///
/// Collector-wide operations that wait for a cycle (`force_gc(true)`,
/// `set_gc_percent(-1)`) must not be called from a thread whose
/// [`Mutator`] is running; use the mutator's own methods there.
pub struct Heap {
    core: Arc<HeapCore>,
    threads: Vec<JoinHandle<()>>,
}

impl Heap {
    /// Creates a heap with a [`SafepointWorld`] sized to `config.procs`.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::Os`](crate::GcError::Os) if a collector thread
    /// cannot be spawned.
    pub fn new(config: GcConfig, roots: Arc<dyn RootSet>) -> Result<Self> {
        let world = Arc::new(SafepointWorld::new(config.procs));
        Self::with_world(config, roots, world)
    }

    /// Creates a heap that stops mutators through `world`.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::Os`](crate::GcError::Os) if a collector thread
    /// cannot be spawned.
    pub fn with_world(config: GcConfig, roots: Arc<dyn RootSet>, world: Arc<dyn World>) -> Result<Self> {
        let workers = config.mark_worker_count();
        let core = Arc::new(HeapCore::new(config, roots, world));
        let mut heap = Self {
            core,
            threads: Vec::with_capacity(workers + 1),
        };
        for id in 0..workers {
            let core = Arc::clone(&heap.core);
            heap.threads.push(
                std::thread::Builder::new()
                    .name(format!("spangc-mark-{id}"))
                    .spawn(move || marker::run_worker(&core))?,
            );
        }
        let core = Arc::clone(&heap.core);
        heap.threads.push(
            std::thread::Builder::new()
                .name("spangc-background".into())
                .spawn(move || core.run_background_sweeper())?,
        );
        Ok(heap)
    }

    /// Registers the calling thread as a mutator.
    #[must_use]
    pub fn mutator(&self) -> Mutator {
        Mutator::new(Arc::clone(&self.core))
    }

    /// The heap's configuration.
    #[must_use]
    pub fn config(&self) -> &GcConfig {
        &self.core.config
    }

    /// The pacer.
    #[must_use]
    pub fn pacer(&self) -> &GcController {
        &self.core.pacer
    }

    /// The stop-the-world coordinator.
    #[must_use]
    pub fn world(&self) -> &Arc<dyn World> {
        &self.core.world
    }

    /// Runs a full cycle; see [`Mutator::force_gc`].
    pub fn force_gc(&self, blocking: bool) {
        self.core.force_gc(blocking);
    }

    /// Sets the growth percentage and returns the previous one.
    pub fn set_gc_percent(&self, pct: i32) -> i32 {
        self.core.set_gc_percent(pct)
    }

    /// Waits until `n` cycles have completed or `timeout` elapses; returns
    /// whether they have.
    pub fn wait_for_cycle(&self, n: u32, timeout: Duration) -> bool {
        self.core.wait_for_cycle(n, timeout)
    }

    /// Sweeps one span of the current generation.
    pub fn sweep_one(&self) -> Option<SweepOutcome> {
        self.core.sweep_one()
    }

    /// Sweeps every span still awaiting its sweep.
    pub fn finish_sweep(&self) {
        self.core.finish_sweep();
    }

    /// Sweeps `span` now if it has not been swept in this generation.
    pub fn ensure_swept(&self, span: &Arc<Span>) {
        self.core.ensure_swept(span);
    }

    /// Returns free pages to the OS; returns the bytes released.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::Os`](crate::GcError::Os) if the OS rejects the
    /// request.
    pub fn release_os_memory(&self) -> Result<usize> {
        self.core.pages.release_os_memory()
    }

    /// Heap statistics.
    #[must_use]
    pub fn mem_stats(&self) -> MemStats {
        self.core.mem_stats()
    }

    /// Metrics of recent cycles.
    #[must_use]
    pub fn history(&self) -> &GcHistory {
        &self.core.history
    }

    /// Distribution of stop-the-world pauses.
    #[must_use]
    pub fn pauses(&self) -> &PauseHistogram {
        &self.core.pauses
    }

    /// Current collector phase.
    #[must_use]
    pub fn phase(&self) -> GcPhase {
        self.core.phase()
    }

    /// Completed cycles.
    #[must_use]
    pub fn cycles(&self) -> u32 {
        self.core.gc.completed_cycles()
    }

    /// Started cycles.
    #[must_use]
    pub fn started_cycles(&self) -> u32 {
        self.core.gc.started_cycles()
    }

    /// Current sweep generation.
    #[must_use]
    pub fn sweep_gen(&self) -> u32 {
        self.core.sweep.sweep_gen()
    }

    /// Bytes the pacer considers live.
    #[must_use]
    pub fn heap_live(&self) -> u64 {
        self.core.counters.heap_live()
    }

    /// Bytes of allocated slots across in-use spans.
    #[must_use]
    pub fn in_use_object_bytes(&self) -> u64 {
        self.core.in_use_object_bytes()
    }

    /// Span covering `addr`, whatever its state.
    #[must_use]
    pub fn span_of(&self, addr: Address) -> Option<Arc<Span>> {
        self.core.pages.span_of(addr)
    }

    /// Central free list serving `span_class`.
    #[must_use]
    pub fn central(&self, span_class: SpanClass) -> &CentralFreeList {
        self.core.central(span_class)
    }

    /// Whether `addr` points into a marked object.
    #[must_use]
    pub fn is_marked(&self, addr: Address) -> bool {
        self.object_slot(addr)
            .is_some_and(|(span, idx)| span.is_marked(idx))
    }

    /// Whether `addr` points into an allocated object.
    #[must_use]
    pub fn is_allocated(&self, addr: Address) -> bool {
        self.object_slot(addr)
            .is_some_and(|(span, idx)| span.is_allocated(idx))
    }

    fn object_slot(&self, addr: Address) -> Option<(Arc<Span>, usize)> {
        let span = self.span_of(addr)?;
        if span.state() != SpanState::InUse {
            return None;
        }
        let idx = span.object_index(addr)?;
        Some((span, idx))
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("phase", &self.phase())
            .field("cycles", &self.cycles())
            .field("sweep_gen", &self.sweep_gen())
            .field("heap_live", &self.heap_live())
            .finish_non_exhaustive()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.core.gc.shutdown();
        self.core.grey.notify_all();
        self.core.sweep.wake();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}
