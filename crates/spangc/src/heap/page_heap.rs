//! Page heap: free page ranges and OS memory.
//!
//! Free memory is kept as maximal runs of pages indexed twice, by base
//! address (for coalescing) and by `(npages, base)` (for best fit). All
//! structural changes happen under one `parking_lot::Mutex`.
//!
//! New memory comes from [`sys_alloc`] in [`ARENA_BYTES`]-aligned chunks.
//! Each mapping is placed, when the OS honours the hint, directly after the
//! previous one so that free ranges can coalesce across arenas.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sys_alloc::{Mmap, MmapOptions};

use crate::address::Address;
use crate::error::{GcError, Result};
use crate::gc::sync::{LockGuard, LockOrder};
use crate::heap::arena::{ArenaIndex, ARENA_BYTES};
use crate::heap::span::{Span, SpanState};
use crate::size_class::{SpanClass, PAGE_SIZE};
use crate::tracing::internal as trace;

/// A run of free pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRange {
    npages: usize,
    /// Some page may hold stale data.
    needs_zero: bool,
    /// Pages currently returned to the OS.
    released: usize,
}

#[derive(Default)]
struct PageHeapInner {
    free_by_base: BTreeMap<Address, FreeRange>,
    free_by_size: BTreeSet<(usize, Address)>,
    mappings: Vec<Mmap>,
    next_hint: usize,
}

impl PageHeapInner {
    fn insert(&mut self, base: Address, range: FreeRange) {
        self.free_by_base.insert(base, range);
        self.free_by_size.insert((range.npages, base));
    }

    fn remove(&mut self, base: Address) -> Option<FreeRange> {
        let range = self.free_by_base.remove(&base)?;
        self.free_by_size.remove(&(range.npages, base));
        Some(range)
    }

    /// Inserts a range and merges it with free neighbours.
    fn insert_coalesced(&mut self, mut base: Address, mut range: FreeRange) {
        let prev = self
            .free_by_base
            .range(..base)
            .next_back()
            .map(|(&b, r)| (b, *r));
        if let Some((prev_base, prev)) = prev {
            if prev_base.offset(prev.npages * PAGE_SIZE) == base {
                self.remove(prev_base);
                base = prev_base;
                range = merge(prev, range);
            }
        }
        let next_base = base.offset(range.npages * PAGE_SIZE);
        if let Some(next) = self.remove(next_base) {
            range = merge(range, next);
        }
        self.insert(base, range);
    }

    /// Removes the smallest range of at least `npages` and splits it.
    fn take_best_fit(&mut self, npages: usize) -> Option<(Address, FreeRange)> {
        let &(_, base) = self.free_by_size.range((npages, Address::NULL)..).next()?;
        let range = self.remove(base)?;
        let released = range.released.min(npages);
        if range.npages > npages {
            self.insert(
                base.offset(npages * PAGE_SIZE),
                FreeRange {
                    npages: range.npages - npages,
                    needs_zero: range.needs_zero,
                    released: range.released - released,
                },
            );
        }
        Some((
            base,
            FreeRange {
                npages,
                needs_zero: range.needs_zero,
                released,
            },
        ))
    }
}

const fn merge(a: FreeRange, b: FreeRange) -> FreeRange {
    FreeRange {
        npages: a.npages + b.npages,
        needs_zero: a.needs_zero || b.needs_zero,
        released: a.released + b.released,
    }
}

/// Page-granular allocator backed by OS mappings.
pub struct PageHeap {
    inner: Mutex<PageHeapInner>,
    arenas: ArenaIndex,
    heap_limit: Option<usize>,
    heap_sys: AtomicUsize,
    heap_released: AtomicUsize,
    free_pages: AtomicUsize,
    pages_in_use: AtomicUsize,
    pages_manual: AtomicUsize,
}

impl PageHeap {
    /// Creates an empty page heap. `heap_limit` caps the bytes mapped from
    /// the OS.
    #[must_use]
    pub fn new(heap_limit: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(PageHeapInner::default()),
            arenas: ArenaIndex::new(),
            heap_limit,
            heap_sys: AtomicUsize::new(0),
            heap_released: AtomicUsize::new(0),
            free_pages: AtomicUsize::new(0),
            pages_in_use: AtomicUsize::new(0),
            pages_manual: AtomicUsize::new(0),
        }
    }

    /// The arena index.
    #[must_use]
    pub const fn arenas(&self) -> &ArenaIndex {
        &self.arenas
    }

    /// Span covering `addr`, whatever its state.
    #[must_use]
    pub fn span_of(&self, addr: Address) -> Option<Arc<Span>> {
        self.arenas.span_of(addr)
    }

    /// Bytes mapped from the OS.
    #[must_use]
    pub fn heap_sys(&self) -> usize {
        self.heap_sys.load(Ordering::Acquire)
    }

    /// Bytes of free pages currently returned to the OS.
    #[must_use]
    pub fn heap_released(&self) -> usize {
        self.heap_released.load(Ordering::Acquire)
    }

    /// Free pages.
    #[must_use]
    pub fn free_pages(&self) -> usize {
        self.free_pages.load(Ordering::Acquire)
    }

    /// Pages held by in-use spans.
    #[must_use]
    pub fn pages_in_use(&self) -> usize {
        self.pages_in_use.load(Ordering::Acquire)
    }

    /// Pages held by manual spans.
    #[must_use]
    pub fn pages_manual(&self) -> usize {
        self.pages_manual.load(Ordering::Acquire)
    }

    /// Carves a span of `npages` pages, growing the heap if no free range
    /// fits. The span is published in the arena index and is in `state`.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::OutOfMemory`] when the OS refuses more memory or
    /// the heap limit would be exceeded.
    pub(crate) fn alloc_span(
        &self,
        npages: usize,
        span_class: SpanClass,
        state: SpanState,
        sweep_gen: u32,
    ) -> Result<Arc<Span>> {
        debug_assert!(npages > 0);
        let requested = npages
            .checked_mul(PAGE_SIZE)
            .ok_or(GcError::SizeOverflow { requested: usize::MAX })?;

        let _guard = LockGuard::new(LockOrder::PageHeap);
        let mut inner = self.inner.lock();
        let (base, range) = match inner.take_best_fit(npages) {
            Some(found) => found,
            None => {
                if !self.grow(&mut inner, npages) {
                    trace::log_out_of_memory(requested, self.heap_sys());
                    return Err(GcError::OutOfMemory { requested });
                }
                match inner.take_best_fit(npages) {
                    Some(found) => found,
                    None => crate::fatal!("heap grew by {npages} pages but no range fits"),
                }
            }
        };
        self.free_pages.fetch_sub(npages, Ordering::AcqRel);
        if range.released > 0 {
            self.heap_released
                .fetch_sub(range.released * PAGE_SIZE, Ordering::AcqRel);
        }

        let span = Arc::new(Span::new(base, npages, span_class, range.needs_zero, sweep_gen));
        span.transition(SpanState::Dead, state);
        self.arenas.publish(&span, state == SpanState::InUse);
        match state {
            SpanState::Manual => self.pages_manual.fetch_add(npages, Ordering::AcqRel),
            _ => self.pages_in_use.fetch_add(npages, Ordering::AcqRel),
        };
        Ok(span)
    }

    /// Returns a span's pages to the free structure and coalesces them.
    ///
    /// The span must be in `expected` state; anything else is fatal.
    pub(crate) fn free_span(&self, span: &Span, expected: SpanState) {
        if expected == SpanState::InUse && span.alloc_count() != 0 {
            crate::fatal!("freeing {span:?} with live objects");
        }
        span.transition(expected, SpanState::Dead);
        self.arenas.unpublish(span);

        let npages = span.npages();
        match expected {
            SpanState::Manual => self.pages_manual.fetch_sub(npages, Ordering::AcqRel),
            _ => self.pages_in_use.fetch_sub(npages, Ordering::AcqRel),
        };

        let _guard = LockGuard::new(LockOrder::PageHeap);
        let mut inner = self.inner.lock();
        inner.insert_coalesced(
            span.base(),
            FreeRange {
                npages,
                needs_zero: true,
                released: 0,
            },
        );
        self.free_pages.fetch_add(npages, Ordering::AcqRel);
    }

    /// Maps at least `min_pages` more pages from the OS.
    ///
    /// Returns `false` if the OS refuses or the heap limit would be exceeded.
    fn grow(&self, inner: &mut PageHeapInner, min_pages: usize) -> bool {
        let Some(bytes) = min_pages
            .checked_mul(PAGE_SIZE)
            .and_then(|b| b.checked_next_multiple_of(ARENA_BYTES))
        else {
            return false;
        };
        let bytes = bytes.max(ARENA_BYTES);
        if let Some(limit) = self.heap_limit {
            if self.heap_sys().saturating_add(bytes) > limit {
                return false;
            }
        }

        let Some((mmap, start)) = Self::map_aligned(inner.next_hint, bytes) else {
            return false;
        };
        let base = Address::from_usize(start);
        for offset in (0..bytes).step_by(ARENA_BYTES) {
            self.arenas.install(base.offset(offset));
        }
        inner.mappings.push(mmap);
        inner.next_hint = start + bytes;
        let npages = bytes / PAGE_SIZE;
        inner.insert_coalesced(
            base,
            FreeRange {
                npages,
                needs_zero: false,
                released: 0,
            },
        );
        self.free_pages.fetch_add(npages, Ordering::AcqRel);
        self.heap_sys.fetch_add(bytes, Ordering::AcqRel);
        trace::log_arena_growth(start, bytes, self.heap_sys());
        true
    }

    /// Maps `bytes` at an [`ARENA_BYTES`]-aligned address, trying the hint
    /// first and over-mapping when the OS places the region elsewhere.
    fn map_aligned(hint: usize, bytes: usize) -> Option<(Mmap, usize)> {
        if hint != 0 {
            // SAFETY: the mapping is owned by the returned `Mmap`.
            let exact = unsafe {
                MmapOptions::new()
                    .len(bytes)
                    .with_hint(hint)
                    .no_reserve(true)
                    .map_anon()
            };
            if let Ok(mmap) = exact {
                if let Some(start) = mmap.aligned_start(ARENA_BYTES, bytes) {
                    return Some((mmap, start));
                }
            }
        }
        let len = bytes.checked_add(ARENA_BYTES)?;
        // SAFETY: as above.
        let mmap = unsafe { MmapOptions::new().len(len).no_reserve(true).map_anon() }.ok()?;
        let start = mmap.aligned_start(ARENA_BYTES, bytes)?;
        Some((mmap, start))
    }

    /// Returns every free page to the OS; returns the number of bytes released.
    ///
    /// Released ranges read back as zero, so they no longer need zeroing.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::Os`] if the OS rejects the request.
    pub fn release_os_memory(&self) -> Result<usize> {
        let _guard = LockGuard::new(LockOrder::PageHeap);
        let mut inner = self.inner.lock();
        let candidates: Vec<(Address, FreeRange)> = inner
            .free_by_base
            .iter()
            .filter(|(_, r)| r.released < r.npages)
            .map(|(&b, &r)| (b, r))
            .collect();

        let mut released = 0;
        for (base, range) in candidates {
            let bytes = range.npages * PAGE_SIZE;
            // SAFETY: free ranges lie inside live mappings and no span uses them
            // while the page heap lock is held.
            let zeroed = unsafe { sys_alloc::decommit(base.as_ptr(), bytes)? };
            let newly = (range.npages - range.released) * PAGE_SIZE;
            released += newly;
            self.heap_released.fetch_add(newly, Ordering::AcqRel);
            if let Some(r) = inner.free_by_base.get_mut(&base) {
                r.released = r.npages;
                r.needs_zero = r.needs_zero && !zeroed;
            }
        }
        trace::log_scavenge(released, self.heap_released());
        Ok(released)
    }

    /// Largest free range, in pages.
    #[must_use]
    pub fn largest_free_range(&self) -> usize {
        self.inner
            .lock()
            .free_by_size
            .iter()
            .next_back()
            .map_or(0, |&(n, _)| n)
    }
}
