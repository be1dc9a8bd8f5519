//! Per-thread mutator handles.
//!
//! A [`Mutator`] owns a thread cache, a grey work cache for the write
//! barrier and the thread's assist balance. It polls for stop requests on
//! every allocation and publishes its private state when it parks, so a
//! stopped world never has grey work or statistics hidden in a mutator.
//!
//! Operations that may stop the world themselves (starting a cycle,
//! forced collections, termination attempts) run in the blocking state:
//! the mutator gives back its cached spans, publishes its work and counts
//! as stopped until the operation returns.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::address::{word_in_object, Address};
use crate::error::Result;
use crate::fatal;
use crate::gc::work::GcWork;
use crate::gc::{GcPhase, GcTrigger};
use crate::heap::cache::{Allocation, ThreadCache};
use crate::heap::span::{Span, SpanState};
use crate::heap::HeapCore;

/// A registered mutator thread.
///
/// Dropping the handle returns its cached spans and unregisters it.
pub struct Mutator {
    heap: Arc<HeapCore>,
    cache: ThreadCache,
    gcw: GcWork,
    /// Bytes this mutator may still allocate during the current cycle
    /// before it must assist. Negative means debt.
    assist_balance: i64,
    assist_cycle: u32,
    /// The heap trigger was reached by the last refill.
    start_pending: bool,
}

impl Mutator {
    pub(crate) fn new(heap: Arc<HeapCore>) -> Self {
        heap.world.register_mutator();
        let cache = ThreadCache::new(&heap);
        Self {
            heap,
            cache,
            gcw: GcWork::new(),
            assist_balance: 0,
            assist_cycle: 0,
            start_pending: false,
        }
    }

    /// The thread cache.
    #[must_use]
    pub const fn cache(&self) -> &ThreadCache {
        &self.cache
    }

    /// Current assist balance in bytes; negative is debt.
    #[must_use]
    pub const fn assist_balance(&self) -> i64 {
        self.assist_balance
    }

    // ------------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------------

    /// Allocates `size` bytes that may hold pointers.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::OutOfMemory`](crate::GcError::OutOfMemory) when
    /// the heap cannot grow, and
    /// [`GcError::SizeOverflow`](crate::GcError::SizeOverflow) for sizes no
    /// span can hold.
    pub fn allocate(&mut self, size: usize, needs_zero: bool) -> Result<Address> {
        self.allocate_with(size, false, needs_zero).map(|a| a.addr)
    }

    /// Allocates `size` bytes that are never scanned for pointers.
    ///
    /// # Errors
    ///
    /// As for [`allocate`](Self::allocate).
    pub fn allocate_noscan(&mut self, size: usize, needs_zero: bool) -> Result<Address> {
        self.allocate_with(size, true, needs_zero).map(|a| a.addr)
    }

    /// Allocates and reports how the allocation was served.
    ///
    /// # Errors
    ///
    /// As for [`allocate`](Self::allocate).
    pub fn allocate_with(&mut self, size: usize, noscan: bool, needs_zero: bool) -> Result<Allocation> {
        self.safepoint();
        if std::mem::take(&mut self.start_pending) && self.heap.test_trigger(GcTrigger::Heap) {
            self.blocking(|heap| {
                heap.gc_start(GcTrigger::Heap);
            });
        }
        if self.heap.phase() == GcPhase::Mark {
            self.assist(size);
        }
        // An assist may have finished the cycle. Past this point the phase
        // only changes inside `after_refill`.
        let phase = self.heap.phase();
        let black = phase == GcPhase::Mark;
        let alloc = self
            .cache
            .allocate(&self.heap, size, noscan, needs_zero, black)?;
        if alloc.black {
            self.gcw.bytes_marked += alloc.size as u64;
        }
        if alloc.refilled {
            self.after_refill(phase);
        }
        Ok(alloc)
    }

    /// Notes a reached heap trigger, and tries to end marking when nobody
    /// else will.
    ///
    /// The cycle itself starts on the next allocation: the object being
    /// returned is white and unreachable until the caller stores it.
    fn after_refill(&mut self, phase: GcPhase) {
        match phase {
            GcPhase::Off => {
                if self.heap.test_trigger(GcTrigger::Heap) {
                    self.start_pending = true;
                }
            }
            GcPhase::Mark if self.heap.config.mark_worker_count() == 0 => {
                self.gcw.dispose(&self.heap.grey);
                self.heap.flush_mark_stats(&mut self.gcw, false);
                if self.heap.mark_work_drained() {
                    self.blocking(|heap| {
                        heap.mark_done();
                    });
                }
            }
            _ => {}
        }
    }

    /// Pays for an allocation of `size` bytes during marking.
    fn assist(&mut self, size: usize) {
        let heap = Arc::clone(&self.heap);
        let cycle = heap.gc.started_cycles();
        if self.assist_cycle != cycle {
            self.assist_cycle = cycle;
            self.assist_balance = 0;
        }
        self.assist_balance -= i64::try_from(size).unwrap_or(i64::MAX);
        if self.assist_balance >= 0 {
            return;
        }

        let bytes_per_work = heap.pacer.assist_bytes_per_work();
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let mut work = {
            let debt = -self.assist_balance;
            ((debt as f64 * heap.pacer.assist_work_per_byte()) as i64)
                .max(heap.pacer.config().over_assist_work)
        };

        let stolen = heap.pacer.steal_background_credit(work);
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        {
            self.assist_balance += (stolen as f64 * bytes_per_work) as i64;
        }
        work -= stolen;
        if work <= 0 {
            return;
        }

        let start = Instant::now();
        heap.gc.assists.fetch_add(1, Ordering::SeqCst);
        let done = if heap.gc.blackening() {
            heap.drain(&mut self.gcw, Some(work), false, &mut || true)
        } else {
            0
        };
        self.gcw.dispose(&heap.grey);
        heap.flush_mark_stats(&mut self.gcw, false);
        heap.gc.assists.fetch_sub(1, Ordering::SeqCst);
        heap.pacer.add_assist_time(start.elapsed());
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        {
            self.assist_balance += (done as f64 * bytes_per_work) as i64;
        }

        if heap.mark_work_drained() {
            self.blocking(|heap| {
                heap.mark_done();
            });
        } else if done < work {
            // Out of reachable work for now; let the workers find the rest.
            heap.grey.notify_all();
        }
    }

    // ------------------------------------------------------------------------
    // Pointer stores
    // ------------------------------------------------------------------------

    /// Stores `new` into `slot` through the write barrier.
    ///
    /// # Safety
    ///
    /// `slot` must be a valid, word-aligned pointer slot: a word of an
    /// object allocated from this heap, or a root word registered with the
    /// root set.
    pub unsafe fn write_barrier(&mut self, slot: *mut Address, new: Address) {
        // SAFETY: forwarded from the caller.
        unsafe { self.heap.write_barrier(&mut self.gcw, slot, new) };
    }

    /// Stores `value` into the word at `offset` of the object at `obj`.
    ///
    /// `obj` must be the start of an allocated object and `offset` a word
    /// offset inside it; anything else is fatal.
    pub fn store_pointer(&mut self, obj: Address, offset: usize, value: Address) {
        let slot = self.checked_slot(obj, offset);
        // SAFETY: `checked_slot` validated the word.
        unsafe { self.write_barrier(slot.as_ptr(), value) };
    }

    /// Loads the word at `offset` of the object at `obj`, validated as for
    /// [`store_pointer`](Self::store_pointer).
    #[must_use]
    pub fn load_pointer(&self, obj: Address, offset: usize) -> Address {
        let slot = self.checked_slot(obj, offset);
        // SAFETY: `checked_slot` validated the word; stores are atomic.
        let word = unsafe { (*slot.as_ptr::<AtomicUsize>()).load(Ordering::Acquire) };
        Address::from_usize(word)
    }

    fn checked_slot(&self, obj: Address, offset: usize) -> Address {
        let Some(span) = self.heap.pages.span_of(obj) else {
            fatal!("{obj} is not a heap object");
        };
        if span.state() != SpanState::InUse {
            fatal!("{obj} lies in {span:?}, which is not in use");
        }
        let idx = match span.object_index(obj) {
            Some(idx) if span.object_base(idx) == obj && span.is_allocated(idx) => idx,
            _ => fatal!("{obj} is not the start of an allocated object in {span:?}"),
        };
        if !word_in_object(offset, span.elem_size()) {
            fatal!(
                "offset {offset} is not a word inside the {}-byte object {obj}",
                span.elem_size()
            );
        }
        span.object_base(idx).offset(offset)
    }

    // ------------------------------------------------------------------------
    // Cooperation with the collector
    // ------------------------------------------------------------------------

    /// Parks here if the world is being stopped.
    pub fn safepoint(&mut self) {
        if !self.heap.world.stop_requested() {
            return;
        }
        self.publish();
        self.heap.world.safepoint();
        self.cache.prepare_for_sweep(&self.heap);
    }

    /// Publishes grey work and statistics held by this mutator.
    pub fn flush(&mut self) {
        self.publish();
    }

    fn publish(&mut self) {
        self.gcw.dispose(&self.heap.grey);
        self.heap.flush_mark_stats(&mut self.gcw, false);
        self.cache.flush_stats(&self.heap);
    }

    /// Runs `f` in the blocking state.
    fn blocking<R>(&mut self, f: impl FnOnce(&HeapCore) -> R) -> R {
        self.publish();
        self.cache.release_all(&self.heap);
        self.heap.world.enter_blocking();
        let result = f(&self.heap);
        self.heap.world.exit_blocking();
        self.cache.prepare_for_sweep(&self.heap);
        result
    }

    /// Runs a full cycle. Blocking waits for it to finish, helping to mark;
    /// non-blocking hands the request to the background thread.
    pub fn force_gc(&mut self, blocking: bool) {
        if blocking {
            self.blocking(|heap| heap.force_gc(true));
        } else {
            self.heap.force_gc(false);
        }
    }

    /// Starts a cycle unless one is running. Returns whether this call
    /// started one.
    pub fn start_gc(&mut self) -> bool {
        self.blocking(|heap| {
            let next = heap.gc.started_cycles().wrapping_add(1);
            heap.gc_start(GcTrigger::Cycle(next))
        })
    }

    /// Helps the running cycle (if any) to completion.
    pub fn finish_gc(&mut self) {
        self.blocking(|heap| heap.wait_for_cycle_helping(heap.gc.started_cycles()));
    }

    /// Sets the growth percentage and returns the previous one.
    pub fn set_gc_percent(&mut self, pct: i32) -> i32 {
        self.blocking(|heap| heap.set_gc_percent(pct))
    }

    // ------------------------------------------------------------------------
    // Explicit spans
    // ------------------------------------------------------------------------

    /// Allocates a zeroed manual span of `npages` pages.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::ZeroSize`](crate::GcError::ZeroSize) for
    /// `npages == 0` and [`GcError::OutOfMemory`](crate::GcError::OutOfMemory)
    /// when the heap cannot grow.
    pub fn alloc_manual(&mut self, npages: usize) -> Result<Arc<Span>> {
        self.safepoint();
        self.heap.alloc_manual(npages)
    }

    /// Frees a manual span, or a large object while no cycle is running.
    pub fn free_large(&mut self, span: &Arc<Span>) {
        self.safepoint();
        self.cache.free_large(&self.heap, span);
    }
}

impl std::fmt::Debug for Mutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutator")
            .field("cache", &self.cache)
            .field("assist_balance", &self.assist_balance)
            .finish_non_exhaustive()
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.publish();
        self.cache.release_all(&self.heap);
        self.heap.world.unregister_mutator();
    }
}
