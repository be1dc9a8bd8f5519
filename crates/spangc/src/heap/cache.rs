//! Per-thread span cache.
//!
//! Each mutator owns one [`ThreadCache`] holding at most one span per span
//! class. Allocating from a cached span needs no lock: the cache is the
//! span's only owner until it is handed back to its central list.

use std::sync::Arc;

use crate::address::Address;
use crate::error::{GcError, Result};
use crate::fatal;
use crate::gc::GcPhase;
use crate::heap::span::{Span, SpanState};
use crate::heap::HeapCore;
use crate::size_class::{SizeClassTable, SpanClass, NUM_SPAN_CLASSES, PAGE_SIZE};

/// Result of one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// First byte of the object.
    pub addr: Address,
    /// Bytes reserved for the object (its slot size).
    pub size: usize,
    /// The slow path ran: a span was refilled or a large span allocated.
    pub refilled: bool,
    /// The object was allocated marked.
    pub black: bool,
}

/// Statistics not yet published to the heap counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalStats {
    /// Bytes allocated.
    pub bytes: u64,
    /// Objects allocated.
    pub count: u64,
    /// Bytes allocated in scannable spans.
    pub scan_bytes: u64,
}

/// A thread's private cache of spans, one slot per span class.
#[derive(Debug)]
pub struct ThreadCache {
    alloc: Box<[Option<Arc<Span>>]>,
    flush_gen: u32,
    stats: LocalStats,
}

impl ThreadCache {
    /// Creates an empty cache for the heap's current sweep generation.
    pub(crate) fn new(heap: &HeapCore) -> Self {
        Self {
            alloc: (0..NUM_SPAN_CLASSES).map(|_| None).collect(),
            flush_gen: heap.sweep.sweep_gen(),
            stats: LocalStats::default(),
        }
    }

    /// Unpublished statistics.
    #[must_use]
    pub const fn local_stats(&self) -> LocalStats {
        self.stats
    }

    /// Number of span classes with a cached span.
    #[must_use]
    pub fn cached_spans(&self) -> usize {
        self.alloc.iter().filter(|s| s.is_some()).count()
    }

    /// Allocates `size` bytes.
    ///
    /// Small requests come from the cached span of their class; requests
    /// above the largest size class get a dedicated span. Objects allocated
    /// while marking (`black`) are marked before they are returned.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::OutOfMemory`] when the page heap cannot grow, and
    /// [`GcError::SizeOverflow`] for sizes no span can hold.
    pub(crate) fn allocate(
        &mut self,
        heap: &HeapCore,
        size: usize,
        noscan: bool,
        needs_zero: bool,
        black: bool,
    ) -> Result<Allocation> {
        match SizeClassTable::get().class_for(size) {
            Some(class) => self.allocate_small(heap, SpanClass::new(class, noscan), needs_zero, black),
            None => self.allocate_large(heap, size, noscan, needs_zero, black),
        }
    }

    fn allocate_small(
        &mut self,
        heap: &HeapCore,
        span_class: SpanClass,
        needs_zero: bool,
        black: bool,
    ) -> Result<Allocation> {
        let i = span_class.index();
        let mut refilled = false;
        let found = self.alloc[i].as_ref().and_then(|s| s.next_free());
        let (idx, addr) = match found {
            Some(slot) => slot,
            None => {
                self.refill(heap, span_class)?;
                refilled = true;
                self.alloc[i]
                    .as_ref()
                    .and_then(|s| s.next_free())
                    .unwrap_or_else(|| fatal!("refilled span of class {span_class:?} has no free slot"))
            }
        };
        let Some(span) = self.alloc[i].as_ref() else {
            fatal!("span of class {span_class:?} vanished from the cache");
        };

        let size = span.elem_size();
        if needs_zero && span.needs_zero() {
            // SAFETY: the slot was just claimed from a span this cache owns.
            unsafe { Span::zero_slot(addr, size) };
        }
        if black {
            span.mark(idx);
            heap.pages.arenas().mark_page(span.base());
        }
        self.stats.bytes += size as u64;
        self.stats.count += 1;
        if !span_class.noscan() {
            self.stats.scan_bytes += size as u64;
        }
        Ok(Allocation {
            addr,
            size,
            refilled,
            black,
        })
    }

    fn allocate_large(
        &mut self,
        heap: &HeapCore,
        size: usize,
        noscan: bool,
        needs_zero: bool,
        black: bool,
    ) -> Result<Allocation> {
        let npages = size.div_ceil(PAGE_SIZE);
        let bytes = npages
            .checked_mul(PAGE_SIZE)
            .filter(|&b| isize::try_from(b).is_ok())
            .ok_or(GcError::SizeOverflow { requested: size })?;

        if heap.phase() == GcPhase::Off {
            heap.deduct_sweep_credit(bytes as u64);
        }
        let span = heap.alloc_pages(npages, SpanClass::large(noscan))?;
        span.init_large();
        if needs_zero && span.needs_zero() {
            // SAFETY: the span is fresh and owned by this allocation.
            unsafe { Span::zero_slot(span.base(), bytes) };
        }
        if black {
            span.mark(0);
            heap.pages.arenas().mark_page(span.base());
        }

        heap.counters.add_heap_live(i64::try_from(bytes).unwrap_or(i64::MAX));
        heap.counters.add_alloc(bytes as u64, 1);
        if !noscan {
            heap.counters.add_heap_scan(bytes as u64);
        }
        Ok(Allocation {
            addr: span.base(),
            size: bytes,
            refilled: true,
            black,
        })
    }

    /// Swaps the exhausted span of `span_class` for one with free slots.
    fn refill(&mut self, heap: &HeapCore, span_class: SpanClass) -> Result<()> {
        let central = heap.central(span_class);
        if let Some(old) = self.alloc[span_class.index()].take() {
            if old.has_free() {
                fatal!("refilling {old:?} while it has free slots");
            }
            central.give_span(heap, old);
        }
        self.flush_stats(heap);

        let class = SizeClassTable::get().class(span_class.size_class());
        if heap.phase() == GcPhase::Off {
            heap.deduct_sweep_credit(class.span_bytes() as u64);
        }
        let span = match central.take_span(heap) {
            Some(span) => span,
            None => central.grow(heap)?,
        };
        {
            let _gen = heap.sweep.read_generation();
            span.store_sweep_gen(heap.sweep.sweep_gen().wrapping_add(3));
        }
        let used = span.alloc_count() * span.elem_size();
        heap.counters
            .add_heap_live(i64::try_from(span.bytes() - used).unwrap_or(i64::MAX));
        self.alloc[span_class.index()] = Some(span);
        Ok(())
    }

    /// Frees a manual span, or a large span while no cycle is running.
    ///
    /// A large span that turns out to be garbage already reclaimed by the
    /// sweeper is left alone. Anything else is fatal misuse.
    #[allow(clippy::unused_self)]
    pub(crate) fn free_large(&mut self, heap: &HeapCore, span: &Arc<Span>) {
        match span.state() {
            SpanState::Manual => heap.free_manual(span),
            SpanState::InUse if span.span_class().is_large() => {
                if heap.phase() != GcPhase::Off {
                    fatal!("free_large({span:?}) while the collector is in {:?}", heap.phase());
                }
                heap.ensure_swept(span);
                if span.state() == SpanState::Dead {
                    return;
                }
                heap.free_large_span(span);
            }
            state => fatal!("free_large({span:?}) of a {state:?} span"),
        }
    }

    /// Releases every cached span once the heap's sweep generation moved.
    pub(crate) fn prepare_for_sweep(&mut self, heap: &HeapCore) {
        let sg = heap.sweep.sweep_gen();
        if self.flush_gen == sg {
            return;
        }
        self.release_all(heap);
        self.flush_gen = sg;
    }

    /// Returns every cached span to its central list and flushes statistics.
    pub(crate) fn release_all(&mut self, heap: &HeapCore) {
        for (i, slot) in self.alloc.iter_mut().enumerate() {
            if let Some(span) = slot.take() {
                heap.central(SpanClass::from_index(i)).give_span(heap, span);
            }
        }
        self.flush_stats(heap);
    }

    /// Publishes local statistics to the heap counters.
    pub(crate) fn flush_stats(&mut self, heap: &HeapCore) {
        let stats = std::mem::take(&mut self.stats);
        heap.counters.add_alloc(stats.bytes, stats.count);
        heap.counters.add_heap_scan(stats.scan_bytes);
    }
}
