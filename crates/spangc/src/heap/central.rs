//! Central free lists: one per span class, shared by every thread cache.
//!
//! Spans not held by a cache live in one of two address-ordered sets:
//! `partial` (at least one free slot) or `full`. Either set may hold spans
//! that have not been swept in the current generation; such spans are
//! claimed and swept before they are handed out, never handed out as is.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::address::Address;
use crate::error::Result;
use crate::gc::sync::{LockGuard, LockOrder};
use crate::heap::span::Span;
use crate::heap::HeapCore;
use crate::size_class::{SizeClassTable, SpanClass};

/// Full spans examined for sweeping per [`CentralFreeList::take_span`].
const SPAN_BUDGET: usize = 100;

#[derive(Debug, Default)]
pub(crate) struct SpanSets {
    partial: BTreeMap<Address, Arc<Span>>,
    full: BTreeMap<Address, Arc<Span>>,
}

impl SpanSets {
    /// Files `span` under the set matching its free count.
    pub(crate) fn insert(&mut self, span: Arc<Span>) {
        let set = if span.has_free() {
            &mut self.partial
        } else {
            &mut self.full
        };
        set.insert(span.base(), span);
    }

    /// Removes the span at `base` from whichever set holds it.
    pub(crate) fn remove(&mut self, base: Address) -> Option<Arc<Span>> {
        self.partial.remove(&base).or_else(|| self.full.remove(&base))
    }
}

enum Claim {
    Swept(Arc<Span>),
    Unswept(Arc<Span>),
}

/// Spans of one span class not currently cached by any thread.
#[derive(Debug)]
pub struct CentralFreeList {
    span_class: SpanClass,
    sets: Mutex<SpanSets>,
}

impl CentralFreeList {
    /// Creates an empty list for `span_class`.
    #[must_use]
    pub fn new(span_class: SpanClass) -> Self {
        Self {
            span_class,
            sets: Mutex::new(SpanSets::default()),
        }
    }

    /// The span class served by this list.
    #[must_use]
    pub const fn span_class(&self) -> SpanClass {
        self.span_class
    }

    /// Spans with at least one free slot.
    #[must_use]
    pub fn partial_len(&self) -> usize {
        self.sets.lock().partial.len()
    }

    /// Spans with no free slot.
    #[must_use]
    pub fn full_len(&self) -> usize {
        self.sets.lock().full.len()
    }

    pub(crate) fn lock(&self) -> (LockGuard, MutexGuard<'_, SpanSets>) {
        let order = LockGuard::new(LockOrder::Central);
        (order, self.sets.lock())
    }

    /// Returns a swept span with at least one free slot, or `None` if the
    /// list has none to offer without growing.
    ///
    /// Partial spans are preferred. A partial span still awaiting its sweep
    /// is claimed and swept first; one being swept by someone else is
    /// skipped. Then up to [`SPAN_BUDGET`] unswept full spans are swept in
    /// the hope that they free a slot.
    pub(crate) fn take_span(&self, heap: &HeapCore) -> Option<Arc<Span>> {
        let _gen = heap.sweep.read_generation();
        let sg = heap.sweep.sweep_gen();

        let claim = {
            let (_order, mut sets) = self.lock();
            let mut found = None;
            for span in sets.partial.values() {
                let span_sg = span.sweep_gen();
                if span_sg == sg.wrapping_sub(2) {
                    if span.cas_sweep_gen(span_sg, sg.wrapping_sub(1)) {
                        found = Some(Claim::Unswept(Arc::clone(span)));
                        break;
                    }
                    continue;
                }
                if span_sg == sg.wrapping_sub(1) {
                    continue;
                }
                found = Some(Claim::Swept(Arc::clone(span)));
                break;
            }
            if let Some(Claim::Swept(span) | Claim::Unswept(span)) = &found {
                sets.partial.remove(&span.base());
            }
            found
        };
        match claim {
            Some(Claim::Swept(span)) => return Some(span),
            Some(Claim::Unswept(span)) => {
                heap.sweep_span(&span, true);
                return Some(span);
            }
            None => {}
        }

        for _ in 0..SPAN_BUDGET {
            let span = {
                let (_order, mut sets) = self.lock();
                let candidate = sets
                    .full
                    .values()
                    .find(|s| s.sweep_gen() == sg.wrapping_sub(2))
                    .map(Arc::clone)?;
                if !candidate.cas_sweep_gen(sg.wrapping_sub(2), sg.wrapping_sub(1)) {
                    continue;
                }
                sets.full.remove(&candidate.base());
                candidate
            };
            heap.sweep_span(&span, true);
            if span.has_free() {
                return Some(span);
            }
            let (_order, mut sets) = self.lock();
            sets.insert(span);
        }
        None
    }

    /// Takes a fresh span from the page heap.
    pub(crate) fn grow(&self, heap: &HeapCore) -> Result<Arc<Span>> {
        let class = SizeClassTable::get().class(self.span_class.size_class());
        heap.alloc_pages(class.span_pages, self.span_class)
    }

    /// Returns a span from a thread cache.
    ///
    /// A span cached before the current sweep generation began is swept on
    /// the spot; otherwise its unused slots leave `heap_live` and the span
    /// is filed by its free count.
    pub(crate) fn give_span(&self, heap: &HeapCore, span: Arc<Span>) {
        let _gen = heap.sweep.read_generation();
        let sg = heap.sweep.sweep_gen();
        let stale = span.sweep_gen() == sg.wrapping_add(1);
        if stale {
            span.store_sweep_gen(sg.wrapping_sub(1));
            heap.sweep_span(&span, false);
            return;
        }
        span.store_sweep_gen(sg);
        let unused = span.free_count() * span.elem_size();
        if unused > 0 {
            heap.counters.add_heap_live(-i64::try_from(unused).unwrap_or(i64::MAX));
        }
        let (_order, mut sets) = self.lock();
        sets.insert(span);
    }
}
