//! Conservative marking.
//!
//! Any word that points into an allocated slot of an in-use span keeps
//! that object alive, interior pointers included. Marked objects of
//! scannable spans turn grey and are later scanned word by word.

pub mod bitmap;

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::address::{Address, WORD_SIZE};
use crate::fatal;
use crate::gc::work::GcWork;
use crate::heap::span::SpanState;
use crate::heap::HeapCore;
use crate::roots::RootVisitor;

/// Objects scanned between checks of a drain's stop condition.
const DRAIN_CHECK_INTERVAL: usize = 64;

impl HeapCore {
    /// Marks the object `addr` points into, if any. Returns `true` if this
    /// call turned it from white to marked.
    pub(crate) fn shade(&self, addr: Address, gcw: &mut GcWork) -> bool {
        if addr.is_null() {
            return false;
        }
        let Some(span) = self.pages.span_of(addr) else {
            return false;
        };
        if span.state() != SpanState::InUse {
            return false;
        }
        let Some(idx) = span.object_index(addr) else {
            return false;
        };
        if !span.is_allocated(idx) || !span.mark(idx) {
            return false;
        }
        self.pages.arenas().mark_page(span.base());
        gcw.bytes_marked += span.elem_size() as u64;
        if !span.span_class().noscan() {
            gcw.put(&self.grey, span.object_base(idx));
        }
        true
    }

    /// Shades every word of the grey object at `obj`; returns the bytes
    /// scanned.
    pub(crate) fn scan_object(&self, obj: Address, gcw: &mut GcWork) -> usize {
        let Some(span) = self.pages.span_of(obj) else {
            fatal!("grey object {obj} is outside the heap");
        };
        if span.state() != SpanState::InUse {
            fatal!("grey object {obj} lies in {span:?}");
        }
        let size = span.elem_size();
        let mut p = obj;
        let end = obj.offset(size);
        while p < end {
            // SAFETY: `p` is an aligned word of an allocated slot, which
            // stays mapped while its span is in use; mutators write slots
            // with atomic stores.
            let word = unsafe { (*p.as_ptr::<AtomicUsize>()).load(Ordering::Relaxed) };
            self.shade(Address::from_usize(word), gcw);
            p = p.offset(WORD_SIZE);
        }
        gcw.scan_work += i64::try_from(size).unwrap_or(i64::MAX);
        size
    }

    /// Scans grey objects until the work runs out, `budget` bytes have been
    /// scanned, blackening is switched off, or `keep_going` says stop.
    /// Returns the bytes scanned.
    ///
    /// Statistics are flushed every `credit_slack` bytes of work, as
    /// background credit when `background` is set.
    pub(crate) fn drain(
        &self,
        gcw: &mut GcWork,
        budget: Option<i64>,
        background: bool,
        keep_going: &mut dyn FnMut() -> bool,
    ) -> i64 {
        let budget = budget.unwrap_or(i64::MAX);
        let slack = self.pacer.config().credit_slack;
        let mut done = 0i64;
        let mut since_check = 0;
        while done < budget && self.gc.blackening() {
            let Some(obj) = gcw.try_get(&self.grey) else {
                break;
            };
            done += i64::try_from(self.scan_object(obj, gcw)).unwrap_or(i64::MAX);
            if gcw.scan_work >= slack {
                self.flush_mark_stats(gcw, background);
            }
            since_check += 1;
            if since_check == DRAIN_CHECK_INTERVAL {
                since_check = 0;
                if !keep_going() {
                    break;
                }
            }
        }
        done
    }

    /// Shades everything the root set points at. Runs in the start pause.
    pub(crate) fn mark_roots(&self) {
        let mut gcw = GcWork::new();
        let mut visitor = MarkVisitor {
            heap: self,
            gcw: &mut gcw,
            scanned: 0,
        };
        self.roots.for_each_global_root(&mut visitor);
        self.roots.for_each_thread_stack(&mut visitor);
        let scanned = visitor.scanned;
        gcw.scan_work += i64::try_from(scanned).unwrap_or(i64::MAX);
        gcw.dispose(&self.grey);
        self.flush_mark_stats(&mut gcw, false);
    }
}

/// Root visitor that shades every candidate pointer.
struct MarkVisitor<'a> {
    heap: &'a HeapCore,
    gcw: &'a mut GcWork,
    scanned: usize,
}

impl RootVisitor for MarkVisitor<'_> {
    fn visit(&mut self, addr: Address) {
        self.scanned += WORD_SIZE;
        self.heap.shade(addr, self.gcw);
    }
}
