//! Spans: runs of pages managed as one allocation unit.
//!
//! A small-object span is carved into `nelems` equal slots of one size
//! class. A large span holds exactly one object. Manual spans are owned by
//! the runtime (for example thread stacks) and are invisible to marking.
//!
//! # Slot state
//!
//! Slot `i` is allocated when `i < free_index` or `alloc_bits[i]` is set.
//! Allocation only ever advances `free_index`; the sweeper rebuilds
//! `alloc_bits` from `mark_bits` and rewinds `free_index` to zero.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use crate::address::{Address, WORD_SIZE};
use crate::fatal;
use crate::gc::mark::bitmap::{low_mask, GcBits};
use crate::size_class::{SizeClassTable, SpanClass, PAGE_SIZE};

// ============================================================================
// SpanState
// ============================================================================

/// Lifecycle state of a span.
///
/// The only legal transitions are `Dead -> InUse -> Dead` and
/// `Dead -> Manual -> Dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SpanState {
    /// Not published, or already returned to the page heap.
    Dead = 0,
    /// Holds garbage-collected objects.
    InUse = 1,
    /// Owned by the runtime and never scanned.
    Manual = 2,
}

impl SpanState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::InUse,
            2 => Self::Manual,
            _ => Self::Dead,
        }
    }
}

/// Live and freed object counts produced by sweeping one span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SweepCounts {
    pub live: usize,
    pub freed: usize,
}

// ============================================================================
// Span
// ============================================================================

/// A contiguous run of pages.
pub struct Span {
    base: Address,
    npages: usize,
    span_class: SpanClass,
    elem_size: usize,
    nelems: usize,
    state: AtomicU8,
    sweep_gen: AtomicU32,
    free_index: AtomicUsize,
    alloc_count: AtomicUsize,
    needs_zero: AtomicBool,
    alloc_bits: GcBits,
    mark_bits: GcBits,
}

impl Span {
    /// Creates a dead span over `npages` pages at `base`.
    ///
    /// Small classes get `objects_per_span` slots; large and manual spans
    /// get a single slot covering every page.
    pub(crate) fn new(
        base: Address,
        npages: usize,
        span_class: SpanClass,
        needs_zero: bool,
        sweep_gen: u32,
    ) -> Self {
        let (elem_size, nelems) = if span_class.is_large() {
            (npages * PAGE_SIZE, 1)
        } else {
            let class = SizeClassTable::get().class(span_class.size_class());
            debug_assert_eq!(class.span_pages, npages);
            (class.object_size, class.objects_per_span)
        };
        Self {
            base,
            npages,
            span_class,
            elem_size,
            nelems,
            state: AtomicU8::new(SpanState::Dead as u8),
            sweep_gen: AtomicU32::new(sweep_gen),
            free_index: AtomicUsize::new(0),
            alloc_count: AtomicUsize::new(0),
            needs_zero: AtomicBool::new(needs_zero),
            alloc_bits: GcBits::new(nelems),
            mark_bits: GcBits::new(nelems),
        }
    }

    /// First byte of the span.
    #[must_use]
    pub const fn base(&self) -> Address {
        self.base
    }

    /// One past the last byte of the span.
    #[must_use]
    pub const fn limit(&self) -> Address {
        self.base.offset(self.npages * PAGE_SIZE)
    }

    /// Number of pages.
    #[must_use]
    pub const fn npages(&self) -> usize {
        self.npages
    }

    /// Size in bytes.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.npages * PAGE_SIZE
    }

    /// Span class.
    #[must_use]
    pub const fn span_class(&self) -> SpanClass {
        self.span_class
    }

    /// Bytes per slot.
    #[must_use]
    pub const fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Number of slots.
    #[must_use]
    pub const fn nelems(&self) -> usize {
        self.nelems
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SpanState {
        SpanState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Sweep generation last recorded on this span.
    #[must_use]
    pub fn sweep_gen(&self) -> u32 {
        self.sweep_gen.load(Ordering::Acquire)
    }

    /// Number of allocated slots.
    #[must_use]
    pub fn alloc_count(&self) -> usize {
        self.alloc_count.load(Ordering::Acquire)
    }

    /// Index of the first slot the next allocation will look at.
    #[must_use]
    pub fn free_index(&self) -> usize {
        self.free_index.load(Ordering::Acquire)
    }

    /// Whether free slots may hold stale data.
    #[must_use]
    pub fn needs_zero(&self) -> bool {
        self.needs_zero.load(Ordering::Acquire)
    }

    /// Whether at least one slot is free.
    #[must_use]
    pub fn has_free(&self) -> bool {
        self.alloc_count() < self.nelems
    }

    /// Number of free slots.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.nelems - self.alloc_count()
    }

    /// Returns `true` if `addr` lies inside the span.
    #[must_use]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.base && addr < self.limit()
    }

    pub(crate) fn store_sweep_gen(&self, sg: u32) {
        self.sweep_gen.store(sg, Ordering::Release);
    }

    pub(crate) fn cas_sweep_gen(&self, current: u32, new: u32) -> bool {
        self.sweep_gen
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set_needs_zero(&self, value: bool) {
        self.needs_zero.store(value, Ordering::Release);
    }

    /// Moves the span from `from` to `to`, aborting on any other state.
    pub(crate) fn transition(&self, from: SpanState, to: SpanState) {
        let legal = matches!(
            (from, to),
            (SpanState::Dead, SpanState::InUse | SpanState::Manual)
                | (SpanState::InUse | SpanState::Manual, SpanState::Dead)
        );
        if !legal {
            fatal!("illegal span transition {from:?} -> {to:?} for {self:?}");
        }
        if let Err(actual) =
            self.state
                .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
        {
            fatal!(
                "span {self:?} is {:?}, expected {from:?} for transition to {to:?}",
                SpanState::from_u8(actual)
            );
        }
    }

    // ------------------------------------------------------------------------
    // Object lookup
    // ------------------------------------------------------------------------

    /// Slot index for an address inside the span, interior pointers included.
    #[must_use]
    pub fn object_index(&self, addr: Address) -> Option<usize> {
        if !self.contains(addr) {
            return None;
        }
        let idx = addr.offset_from(self.base) / self.elem_size;
        (idx < self.nelems).then_some(idx)
    }

    /// First byte of slot `idx`.
    #[must_use]
    pub const fn object_base(&self, idx: usize) -> Address {
        self.base.offset(idx * self.elem_size)
    }

    /// Whether slot `idx` holds an allocated object.
    #[must_use]
    pub fn is_allocated(&self, idx: usize) -> bool {
        idx < self.free_index() || self.alloc_bits.get(idx)
    }

    /// Whether slot `idx` is marked in the current cycle.
    #[must_use]
    pub fn is_marked(&self, idx: usize) -> bool {
        self.mark_bits.get(idx)
    }

    /// Marks slot `idx`; returns `true` if it was white.
    pub(crate) fn mark(&self, idx: usize) -> bool {
        self.mark_bits.set(idx)
    }

    /// Number of marked slots.
    #[must_use]
    pub fn marked_count(&self) -> usize {
        self.mark_bits.count_ones()
    }

    // ------------------------------------------------------------------------
    // Allocation (owner only)
    // ------------------------------------------------------------------------

    /// Claims the next free slot. Only the span's current owner may call this.
    pub(crate) fn next_free(&self) -> Option<(usize, Address)> {
        let start = self.free_index.load(Ordering::Relaxed);
        let idx = self.alloc_bits.next_clear_from(start)?;
        self.free_index.store(idx + 1, Ordering::Release);
        self.alloc_count.fetch_add(1, Ordering::AcqRel);
        Some((idx, self.object_base(idx)))
    }

    /// Marks the single slot of a fresh large span allocated.
    pub(crate) fn init_large(&self) {
        debug_assert_eq!(self.nelems, 1);
        self.free_index.store(1, Ordering::Release);
        self.alloc_count.store(1, Ordering::Release);
    }

    /// Drops the object of a large span that is being freed explicitly.
    pub(crate) fn clear_large(&self) {
        debug_assert_eq!(self.nelems, 1);
        self.free_index.store(0, Ordering::Release);
        self.alloc_count.store(0, Ordering::Release);
        self.alloc_bits.clear_all();
        self.mark_bits.clear_all();
    }

    /// Zeroes `len` bytes at `addr` with word-sized atomic stores, so that
    /// concurrent conservative scans of the slot never race with plain writes.
    ///
    /// # Safety
    ///
    /// `addr..addr+len` must lie inside this span and be word aligned.
    pub(crate) unsafe fn zero_slot(addr: Address, len: usize) {
        debug_assert!(addr.is_aligned(WORD_SIZE));
        let mut p = addr;
        let end = addr.offset(len);
        while p < end {
            // SAFETY: the caller guarantees `p` is an aligned word of mapped
            // span memory; atomics tolerate concurrent readers.
            unsafe { (*p.as_ptr::<AtomicUsize>()).store(0, Ordering::Relaxed) };
            p = p.offset(WORD_SIZE);
        }
    }

    // ------------------------------------------------------------------------
    // Sweeping (sweeper only)
    // ------------------------------------------------------------------------

    /// Turns this cycle's marks into the allocation state.
    ///
    /// The caller must own the span for sweeping (sweep generation `sg - 1`).
    pub(crate) fn sweep_bits(&self) -> SweepCounts {
        let free_index = self.free_index.load(Ordering::Acquire);
        let mut live = 0;
        for w in 0..self.mark_bits.word_count() {
            let valid = self.mark_bits.valid_mask(w);
            let allocated = self.alloc_bits.load_word(w) | below_mask(free_index, w);
            let marks = self.mark_bits.load_word(w) & valid;
            if marks & !allocated != 0 {
                fatal!(
                    "span {self:?}: marked but unallocated slots in word {w} ({:#x})",
                    marks & !allocated
                );
            }
            live += marks.count_ones() as usize;
            self.alloc_bits.store_word(w, marks);
            self.mark_bits.store_word(w, 0);
        }

        let alloc_count = self.alloc_count.load(Ordering::Acquire);
        if live > alloc_count {
            fatal!("span {self:?}: {live} live objects but only {alloc_count} allocated");
        }
        let freed = alloc_count - live;
        self.free_index.store(0, Ordering::Release);
        self.alloc_count.store(live, Ordering::Release);
        if freed > 0 {
            self.needs_zero.store(true, Ordering::Release);
        }
        SweepCounts { live, freed }
    }
}

/// Bits of word `w` whose slot index is below `free_index`.
fn below_mask(free_index: usize, w: usize) -> u64 {
    let start = w * 64;
    if free_index <= start {
        0
    } else if free_index >= start + 64 {
        u64::MAX
    } else {
        low_mask(free_index - start)
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("base", &self.base)
            .field("npages", &self.npages)
            .field("class", &self.span_class)
            .field("state", &self.state())
            .field("sweep_gen", &self.sweep_gen())
            .field("alloc_count", &self.alloc_count())
            .field("nelems", &self.nelems)
            .finish()
    }
}
