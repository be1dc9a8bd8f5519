//! Lazy, concurrent and proportional sweeping.
//!
//! # Sweep generations
//!
//! The heap keeps a sweep generation `sg` that advances by two at every
//! mark termination. A span's own generation, relative to `sg`, says who
//! may touch it:
//!
//! | span generation | meaning                                   |
//! |-----------------|-------------------------------------------|
//! | `sg - 2`        | needs sweeping                            |
//! | `sg - 1`        | being swept                               |
//! | `sg`            | swept, ready to use                       |
//! | `sg + 1`        | cached before the flip, still unswept     |
//! | `sg + 3`        | swept and cached                          |
//!
//! Claiming a span for sweeping is a CAS from `sg - 2` to `sg - 1`, so each
//! span is swept exactly once per generation no matter how many sweepers
//! race for it.
//!
//! Every in-use span sits in one of two sweep buffers. Sweeping or
//! allocating a span pushes it onto the swept buffer; the flip swaps the
//! roles of the two buffers.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::Backoff;
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};

use crate::fatal;
use crate::gc::pacer::SweepProgress;
use crate::gc::GcPhase;
use crate::heap::arena::{HeapArena, PAGES_PER_ARENA};
use crate::heap::span::{Span, SpanState};
use crate::heap::HeapCore;
use crate::tracing::internal as trace;

/// Spans swept by the background sweeper between yields.
const SWEEP_BATCH: usize = 16;

/// How long the background thread sleeps when there is nothing to sweep.
const BACKGROUND_PARK: Duration = Duration::from_millis(50);

/// What sweeping one span produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Pages of the swept span.
    pub npages: usize,
    /// Objects that survived.
    pub live_objects: usize,
    /// Objects freed.
    pub freed_objects: usize,
    /// Bytes freed.
    pub freed_bytes: usize,
    /// The span was empty and went back to the page heap.
    pub released: bool,
}

impl SweepOutcome {
    /// Whether any object was reclaimed.
    #[must_use]
    pub const fn freed_anything(&self) -> bool {
        self.freed_objects > 0
    }
}

/// Sweep generation, sweep buffers and reclaim bookkeeping.
#[derive(Debug)]
pub struct SweepState {
    sweep_gen: AtomicU32,
    sweep_done: AtomicBool,
    pages_swept: AtomicU64,
    reclaim_index: AtomicUsize,
    reclaim_credit: AtomicUsize,
    bufs: [SegQueue<Arc<Span>>; 2],
    /// Held shared by every sweep operation and exclusively by the flip.
    generation: RwLock<()>,
    wake: Mutex<bool>,
    wake_cond: Condvar,
}

impl Default for SweepState {
    fn default() -> Self {
        Self::new()
    }
}

impl SweepState {
    /// Creates the state for a heap with nothing to sweep.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sweep_gen: AtomicU32::new(0),
            sweep_done: AtomicBool::new(true),
            pages_swept: AtomicU64::new(0),
            reclaim_index: AtomicUsize::new(0),
            reclaim_credit: AtomicUsize::new(0),
            bufs: [SegQueue::new(), SegQueue::new()],
            generation: RwLock::new(()),
            wake: Mutex::new(false),
            wake_cond: Condvar::new(),
        }
    }

    /// Current heap sweep generation.
    #[must_use]
    pub fn sweep_gen(&self) -> u32 {
        self.sweep_gen.load(Ordering::Acquire)
    }

    /// Whether the unswept buffer of this generation has been drained.
    #[must_use]
    pub fn sweep_done(&self) -> bool {
        self.sweep_done.load(Ordering::Acquire)
    }

    /// Pages swept in this generation.
    #[must_use]
    pub fn pages_swept(&self) -> u64 {
        self.pages_swept.load(Ordering::Acquire)
    }

    /// Pages freed by reclaim beyond what its callers needed.
    #[must_use]
    pub fn reclaim_credit(&self) -> usize {
        self.reclaim_credit.load(Ordering::Acquire)
    }

    /// Spans waiting in the unswept buffer.
    #[must_use]
    pub fn unswept_len(&self) -> usize {
        self.unswept(self.sweep_gen()).len()
    }

    /// Pins the sweep generation for the duration of a sweep operation.
    pub(crate) fn read_generation(&self) -> RwLockReadGuard<'_, ()> {
        self.generation.read_recursive()
    }

    fn swept(&self, sg: u32) -> &SegQueue<Arc<Span>> {
        &self.bufs[(sg / 2 % 2) as usize]
    }

    fn unswept(&self, sg: u32) -> &SegQueue<Arc<Span>> {
        &self.bufs[(1 - sg / 2 % 2) as usize]
    }

    pub(crate) fn push_swept(&self, sg: u32, span: Arc<Span>) {
        self.swept(sg).push(span);
    }

    /// Wakes the background sweeper.
    pub(crate) fn wake(&self) {
        let mut woken = self.wake.lock();
        *woken = true;
        self.wake_cond.notify_one();
    }

    fn park(&self, timeout: Duration) {
        let mut woken = self.wake.lock();
        if !*woken {
            let _ = self.wake_cond.wait_for(&mut woken, timeout);
        }
        *woken = false;
    }
}

impl HeapCore {
    /// Progress of the current sweep generation, for the pacer.
    pub(crate) fn sweep_progress(&self) -> SweepProgress {
        SweepProgress {
            sweep_done: self.sweep.sweep_done(),
            pages_in_use: self.pages.pages_in_use() as u64,
            pages_swept: self.sweep.pages_swept(),
        }
    }

    /// Sweeps one span from the unswept buffer.
    ///
    /// Returns `None`, and records that sweeping is done, once no span of
    /// this generation is left to claim.
    pub(crate) fn sweep_one(&self) -> Option<SweepOutcome> {
        let _gen = self.sweep.read_generation();
        let sg = self.sweep.sweep_gen();
        loop {
            let Some(span) = self.sweep.unswept(sg).pop() else {
                if !self.sweep.sweep_done.swap(true, Ordering::AcqRel) {
                    self.pacer.clear_sweep_pacing();
                    trace::log_sweep_done(sg, self.pages.pages_in_use());
                }
                return None;
            };
            if span.state() != SpanState::InUse {
                continue;
            }
            // Spans swept, being swept or cached elsewhere are filed by
            // whoever owns them.
            if span.sweep_gen() == sg.wrapping_sub(2)
                && span.cas_sweep_gen(sg.wrapping_sub(2), sg.wrapping_sub(1))
            {
                return Some(self.sweep_span(&span, false));
            }
        }
    }

    /// Sweeps a span the caller has claimed (generation `sg - 1`).
    ///
    /// Dead slots become free, the mark bits become the allocation bits, and
    /// an empty span goes back to the page heap. Unless `preserve` is set, a
    /// surviving small span is filed in its central list; with `preserve`
    /// the caller keeps it.
    pub(crate) fn sweep_span(&self, span: &Arc<Span>, preserve: bool) -> SweepOutcome {
        let sg = self.sweep.sweep_gen();
        if span.state() != SpanState::InUse {
            fatal!("sweeping {span:?}, which is not in use");
        }
        if span.sweep_gen() != sg.wrapping_sub(1) {
            fatal!("sweeping {span:?} without claiming it (heap generation {sg})");
        }

        let counts = span.sweep_bits();
        let freed_bytes = counts.freed * span.elem_size();
        self.counters
            .add_freed(freed_bytes as u64, counts.freed as u64);
        self.sweep
            .pages_swept
            .fetch_add(span.npages() as u64, Ordering::AcqRel);

        let mut outcome = SweepOutcome {
            npages: span.npages(),
            live_objects: counts.live,
            freed_objects: counts.freed,
            freed_bytes,
            released: false,
        };

        let span_class = span.span_class();
        if span_class.is_large() || preserve {
            span.store_sweep_gen(sg);
            if counts.live == 0 && !preserve {
                self.pages.free_span(span, SpanState::InUse);
                outcome.released = true;
            } else {
                self.sweep.push_swept(sg, Arc::clone(span));
            }
            return outcome;
        }

        let (order, mut sets) = self.central(span_class).lock();
        let _ = sets.remove(span.base());
        span.store_sweep_gen(sg);
        if counts.live == 0 {
            drop(sets);
            drop(order);
            self.pages.free_span(span, SpanState::InUse);
            outcome.released = true;
        } else {
            sets.insert(Arc::clone(span));
            drop(sets);
            drop(order);
            self.sweep.push_swept(sg, Arc::clone(span));
        }
        outcome
    }

    /// Makes sure `span` has been swept in the current generation,
    /// sweeping it or waiting for its sweeper as needed.
    ///
    /// Calling this on a span cached by a thread before the current
    /// generation began is fatal.
    pub(crate) fn ensure_swept(&self, span: &Arc<Span>) {
        let _gen = self.sweep.read_generation();
        if span.state() != SpanState::InUse {
            return;
        }
        let sg = self.sweep.sweep_gen();
        let span_sg = span.sweep_gen();
        if span_sg == sg || span_sg == sg.wrapping_add(3) {
            return;
        }
        if span_sg == sg.wrapping_add(1) {
            fatal!("ensure_swept({span:?}) of a span cached before sweep generation {sg}");
        }
        if span_sg == sg.wrapping_sub(2)
            && span.cas_sweep_gen(sg.wrapping_sub(2), sg.wrapping_sub(1))
        {
            self.sweep_span(span, false);
            return;
        }
        let backoff = Backoff::new();
        while span.sweep_gen() == sg.wrapping_sub(1) && span.state() == SpanState::InUse {
            backoff.snooze();
        }
    }

    /// Sweeps everything left in the unswept buffer and waits for
    /// concurrent sweepers to finish their spans.
    pub(crate) fn finish_sweep(&self) {
        while self.sweep_one().is_some() {}
        drop(self.sweep.generation.write());
    }

    /// Checks that no in-use span is left unswept. Only meaningful with the
    /// world stopped, right after [`finish_sweep`](Self::finish_sweep).
    #[cfg(feature = "paranoid-sweep")]
    pub(crate) fn verify_swept(&self) {
        let sg = self.sweep.sweep_gen();
        for arena in self.pages.arenas().arenas() {
            for page in 0..PAGES_PER_ARENA {
                if !arena.page_in_use(page) {
                    continue;
                }
                if let Some(span) = arena.span_at(page) {
                    let span_sg = span.sweep_gen();
                    if span_sg != sg && span_sg != sg.wrapping_add(3) {
                        fatal!("{span:?} is unswept after finishing sweep generation {sg}");
                    }
                }
            }
        }
    }

    /// Sweeps spans without marked objects until `npages` pages have been
    /// freed, drawing on and topping up the shared reclaim credit.
    pub(crate) fn reclaim(&self, npages: usize) {
        let _gen = self.sweep.read_generation();
        if self.sweep.sweep_done() {
            return;
        }
        let mut need = npages;
        let _ = self
            .sweep
            .reclaim_credit
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |credit| {
                (credit > 0).then(|| credit - credit.min(npages))
            })
            .map(|credit| need -= credit.min(npages));

        let sg = self.sweep.sweep_gen();
        let arenas = self.pages.arenas().arenas();
        while need > 0 {
            let idx = self.sweep.reclaim_index.fetch_add(1, Ordering::AcqRel);
            let Some(arena) = arenas.get(idx) else {
                self.sweep.reclaim_index.store(usize::MAX >> 1, Ordering::Release);
                break;
            };
            let found = self.reclaim_chunk(arena, sg);
            if found <= need {
                need -= found;
            } else {
                self.sweep
                    .reclaim_credit
                    .fetch_add(found - need, Ordering::AcqRel);
                need = 0;
            }
        }
    }

    /// Sweeps the spans of one arena that hold no marked object; returns
    /// the pages freed.
    fn reclaim_chunk(&self, arena: &HeapArena, sg: u32) -> usize {
        let mut found = 0;
        for page in 0..PAGES_PER_ARENA {
            if !arena.page_in_use(page) || arena.page_marked(page) {
                continue;
            }
            let Some(span) = arena.span_at(page) else {
                continue;
            };
            if span.sweep_gen() == sg.wrapping_sub(2)
                && span.cas_sweep_gen(sg.wrapping_sub(2), sg.wrapping_sub(1))
            {
                let npages = span.npages();
                if self.sweep_span(&span, false).released {
                    found += npages;
                }
            }
        }
        found
    }

    /// Sweeps enough pages before allocating `span_bytes` that sweeping
    /// completes before `heap_live` reaches the next trigger.
    pub(crate) fn deduct_sweep_credit(&self, span_bytes: u64) {
        let heap_live = self.counters.heap_live().saturating_add(span_bytes);
        let Some(target) = self.pacer.sweep_pages_target(heap_live) else {
            return;
        };
        while self.sweep.pages_swept() < target {
            if self.sweep_one().is_none() {
                self.pacer.clear_sweep_pacing();
                break;
            }
        }
    }

    /// Advances the sweep generation. Runs at mark termination with the
    /// world stopped.
    pub(crate) fn flip_sweep_generation(&self) {
        let _flip = self.sweep.generation.write();
        self.sweep.sweep_gen.fetch_add(2, Ordering::AcqRel);
        self.sweep.sweep_done.store(false, Ordering::Release);
        self.sweep.pages_swept.store(0, Ordering::Release);
        self.sweep.reclaim_index.store(0, Ordering::Release);
        self.sweep.reclaim_credit.store(0, Ordering::Release);
    }

    /// Body of the background thread: services deferred cycle requests and
    /// the periodic trigger, and sweeps while no cycle is running.
    pub(crate) fn run_background_sweeper(&self) {
        while !self.gc.is_shutdown() {
            self.service_triggers();
            if self.config.background_sweep {
                let mut batch = 0;
                while !self.gc.is_shutdown()
                    && self.phase() == GcPhase::Off
                    && self.sweep_one().is_some()
                {
                    batch += 1;
                    if batch % SWEEP_BATCH == 0 {
                        std::thread::yield_now();
                        self.service_triggers();
                    }
                }
            }
            self.sweep.park(BACKGROUND_PARK);
        }
    }
}
