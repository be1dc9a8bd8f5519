//! Arena index: address to span lookup.
//!
//! Heap memory is mapped in [`ARENA_BYTES`]-aligned arenas. A two-level
//! sparse table, indexed by the arena number of an address, finds the
//! [`HeapArena`] holding per-page metadata. Table slots are populated once
//! and never cleared, so readers need no lock to walk the table.

use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::address::Address;
use crate::gc::mark::bitmap::GcBits;
use crate::gc::sync::{LockGuard, LockOrder};
use crate::heap::span::Span;
use crate::size_class::{PAGE_SHIFT, PAGE_SIZE};

/// log2 of [`ARENA_BYTES`].
pub const ARENA_SHIFT: usize = 22;
/// Size and alignment of an arena.
pub const ARENA_BYTES: usize = 1 << ARENA_SHIFT;
/// Pages per arena.
pub const PAGES_PER_ARENA: usize = ARENA_BYTES / PAGE_SIZE;

const ADDRESS_BITS: usize = 48;
const ARENA_INDEX_BITS: usize = ADDRESS_BITS - ARENA_SHIFT;
const L1_BITS: usize = ARENA_INDEX_BITS / 2;
const L2_BITS: usize = ARENA_INDEX_BITS - L1_BITS;

type L2 = Box<[OnceLock<Arc<HeapArena>>]>;

/// Per-arena page metadata.
pub struct HeapArena {
    base: Address,
    spans: RwLock<Box<[Option<Arc<Span>>]>>,
    /// First page of every in-use span.
    page_in_use: GcBits,
    /// First page of every span holding a marked object this cycle.
    page_marks: GcBits,
}

impl HeapArena {
    fn new(base: Address) -> Self {
        Self {
            base,
            spans: RwLock::new((0..PAGES_PER_ARENA).map(|_| None).collect()),
            page_in_use: GcBits::new(PAGES_PER_ARENA),
            page_marks: GcBits::new(PAGES_PER_ARENA),
        }
    }

    /// First byte of the arena.
    #[must_use]
    pub const fn base(&self) -> Address {
        self.base
    }

    /// Page index of `addr` within this arena.
    fn page_of(&self, addr: Address) -> usize {
        addr.offset_from(self.base) >> PAGE_SHIFT
    }

    /// Span covering page `page`, if any.
    #[must_use]
    pub fn span_at(&self, page: usize) -> Option<Arc<Span>> {
        self.spans.read()[page].clone()
    }

    /// Whether page `page` starts an in-use span.
    #[must_use]
    pub fn page_in_use(&self, page: usize) -> bool {
        self.page_in_use.get(page)
    }

    /// Whether the span starting at page `page` holds a marked object.
    #[must_use]
    pub fn page_marked(&self, page: usize) -> bool {
        self.page_marks.get(page)
    }

    /// Number of pages whose span was marked this cycle.
    #[must_use]
    pub fn marked_pages(&self) -> usize {
        self.page_marks.count_ones()
    }
}

/// Two-level sparse table over the address space.
pub struct ArenaIndex {
    l1: Box<[OnceLock<L2>]>,
    all: RwLock<Vec<Arc<HeapArena>>>,
}

impl ArenaIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self {
            l1: (0..1usize << L1_BITS).map(|_| OnceLock::new()).collect(),
            all: RwLock::new(Vec::new()),
        }
    }

    fn split(addr: Address) -> Option<(usize, usize)> {
        let arena = addr.as_usize() >> ARENA_SHIFT;
        if arena >> ARENA_INDEX_BITS != 0 {
            return None;
        }
        Some((arena >> L2_BITS, arena & ((1 << L2_BITS) - 1)))
    }

    /// Arena containing `addr`, if it has been installed.
    #[must_use]
    pub fn arena_of(&self, addr: Address) -> Option<&Arc<HeapArena>> {
        let (i1, i2) = Self::split(addr)?;
        self.l1[i1].get()?[i2].get()
    }

    /// Installs metadata for the arena starting at `base`. Installing an
    /// existing arena is a no-op.
    pub(crate) fn install(&self, base: Address) {
        debug_assert!(base.is_aligned(ARENA_BYTES));
        let Some((i1, i2)) = Self::split(base) else {
            crate::fatal!("arena {base} outside the {ADDRESS_BITS}-bit address space");
        };
        let l2 = self.l1[i1].get_or_init(|| (0..1usize << L2_BITS).map(|_| OnceLock::new()).collect());
        let mut created = false;
        l2[i2].get_or_init(|| {
            created = true;
            Arc::new(HeapArena::new(base))
        });
        if created {
            if let Some(arena) = l2[i2].get() {
                self.all.write().push(Arc::clone(arena));
            }
        }
    }

    /// Snapshot of every installed arena, in installation order.
    #[must_use]
    pub fn arenas(&self) -> Vec<Arc<HeapArena>> {
        self.all.read().clone()
    }

    /// Number of installed arenas.
    #[must_use]
    pub fn len(&self) -> usize {
        self.all.read().len()
    }

    /// Returns `true` before the first arena is installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Span covering `addr`, whatever its state.
    #[must_use]
    pub fn span_of(&self, addr: Address) -> Option<Arc<Span>> {
        let arena = self.arena_of(addr)?;
        arena.span_at(arena.page_of(addr))
    }

    /// Points every page of `span` at it and flags its first page in use
    /// when `in_use` is set.
    pub(crate) fn publish(&self, span: &Arc<Span>, in_use: bool) {
        self.for_each_page(span.base(), span.npages(), |arena, page, first| {
            let _guard = LockGuard::new(LockOrder::Arena);
            arena.spans.write()[page] = Some(Arc::clone(span));
            if first && in_use {
                arena.page_in_use.set(page);
            }
        });
    }

    /// Clears the pages of a span that is being freed.
    pub(crate) fn unpublish(&self, span: &Span) {
        self.for_each_page(span.base(), span.npages(), |arena, page, first| {
            let _guard = LockGuard::new(LockOrder::Arena);
            arena.spans.write()[page] = None;
            if first {
                arena.page_in_use.clear(page);
                arena.page_marks.clear(page);
            }
        });
    }

    /// Records that the span starting at `span_base` holds a marked object.
    pub(crate) fn mark_page(&self, span_base: Address) {
        if let Some(arena) = self.arena_of(span_base) {
            let page = arena.page_of(span_base);
            if !arena.page_marks.get(page) {
                arena.page_marks.set(page);
            }
        }
    }

    /// Clears the page marks of every arena.
    pub(crate) fn clear_page_marks(&self) {
        for arena in self.all.read().iter() {
            arena.page_marks.clear_all();
        }
    }

    fn for_each_page(&self, base: Address, npages: usize, mut f: impl FnMut(&HeapArena, usize, bool)) {
        for i in 0..npages {
            let addr = base.offset(i * PAGE_SIZE);
            match self.arena_of(addr) {
                Some(arena) => f(arena, arena.page_of(addr), i == 0),
                None => crate::fatal!("page {addr} has no arena"),
            }
        }
    }
}

impl Default for ArenaIndex {
    fn default() -> Self {
        Self::new()
    }
}
