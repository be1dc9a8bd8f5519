//! Root enumeration.
//!
//! The collector never walks thread stacks or globals itself. It asks a
//! [`RootSet`] to feed every root word to a [`RootVisitor`] during the
//! start pause. Roots are scanned once per cycle: anything a root holds
//! at that point stays alive, and values stored into roots later are
//! either allocated black or reached through the write barrier.
//!
//! [`StaticRoots`] is the stock implementation: a table of root slots plus
//! memory regions scanned conservatively, word by word.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::address::{Address, WORD_SIZE};

/// Receives candidate pointers from a [`RootSet`].
pub trait RootVisitor {
    /// Visits one word that may point into the heap.
    fn visit(&mut self, addr: Address);

    /// Visits every aligned word of a memory region conservatively.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reading `len` bytes. Words that other
    /// threads may write concurrently must only be written atomically.
    unsafe fn visit_region(&mut self, ptr: *const u8, len: usize) {
        let start = Address::from(ptr);
        let end = start.offset(len);
        let mut p = start.align_up(WORD_SIZE);
        while p.offset(WORD_SIZE) <= end {
            // SAFETY: the caller guarantees the region is readable; the
            // word is aligned.
            let word = unsafe { (*p.as_ptr::<AtomicUsize>()).load(Ordering::Relaxed) };
            self.visit(Address::from_usize(word));
            p = p.offset(WORD_SIZE);
        }
    }
}

/// Source of roots for marking.
pub trait RootSet: Send + Sync {
    /// Visits global roots.
    fn for_each_global_root(&self, visitor: &mut dyn RootVisitor);

    /// Visits the stacks (or stack-like regions) of mutator threads.
    fn for_each_thread_stack(&self, visitor: &mut dyn RootVisitor);
}

/// Handle to a root slot of a [`StaticRoots`] table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootId(usize);

/// Handle to a region registered with [`StaticRoots::register_region`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(usize);

#[derive(Debug, Default)]
struct RootTable {
    slots: Vec<Option<Address>>,
    free_slots: Vec<usize>,
    regions: Vec<Option<(usize, usize)>>,
    free_regions: Vec<usize>,
}

/// A registry of root slots and conservatively scanned regions.
///
/// ```
/// use spangc::address::Address;
/// use spangc::roots::StaticRoots;
///
/// let roots = StaticRoots::new();
/// let id = roots.add(Address::from_usize(0x1000));
/// assert_eq!(roots.get(id), Some(Address::from_usize(0x1000)));
/// roots.set(id, Address::NULL);
/// assert_eq!(roots.remove(id), Some(Address::NULL));
/// assert!(roots.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct StaticRoots {
    table: Mutex<RootTable>,
}

impl StaticRoots {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a root slot holding `addr`.
    pub fn add(&self, addr: Address) -> RootId {
        let mut table = self.table.lock();
        match table.free_slots.pop() {
            Some(i) => {
                table.slots[i] = Some(addr);
                RootId(i)
            }
            None => {
                table.slots.push(Some(addr));
                RootId(table.slots.len() - 1)
            }
        }
    }

    /// Overwrites a root slot. Setting a removed slot is ignored.
    pub fn set(&self, id: RootId, addr: Address) {
        if let Some(slot) = self.table.lock().slots.get_mut(id.0).and_then(Option::as_mut) {
            *slot = addr;
        }
    }

    /// Value of a root slot.
    #[must_use]
    pub fn get(&self, id: RootId) -> Option<Address> {
        self.table.lock().slots.get(id.0).copied().flatten()
    }

    /// Removes a root slot and returns its last value.
    pub fn remove(&self, id: RootId) -> Option<Address> {
        let mut table = self.table.lock();
        let old = table.slots.get_mut(id.0)?.take();
        if old.is_some() {
            table.free_slots.push(id.0);
        }
        old
    }

    /// Number of live root slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().slots.iter().flatten().count()
    }

    /// Returns `true` if no root slot is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers `len` bytes at `ptr` to be scanned as a thread stack.
    ///
    /// # Safety
    ///
    /// The region must stay readable until it is unregistered, and words
    /// in it that change while the heap is live must be written atomically.
    pub unsafe fn register_region(&self, ptr: *const u8, len: usize) -> RegionId {
        let region = Some((ptr as usize, len));
        let mut table = self.table.lock();
        match table.free_regions.pop() {
            Some(i) => {
                table.regions[i] = region;
                RegionId(i)
            }
            None => {
                table.regions.push(region);
                RegionId(table.regions.len() - 1)
            }
        }
    }

    /// Stops scanning a region.
    pub fn unregister_region(&self, id: RegionId) {
        let mut table = self.table.lock();
        if let Some(region) = table.regions.get_mut(id.0) {
            if region.take().is_some() {
                table.free_regions.push(id.0);
            }
        }
    }
}

impl RootSet for StaticRoots {
    fn for_each_global_root(&self, visitor: &mut dyn RootVisitor) {
        let table = self.table.lock();
        for addr in table.slots.iter().flatten() {
            visitor.visit(*addr);
        }
    }

    fn for_each_thread_stack(&self, visitor: &mut dyn RootVisitor) {
        let table = self.table.lock();
        for &(ptr, len) in table.regions.iter().flatten() {
            // SAFETY: `register_region` requires the region to stay readable
            // until it is unregistered.
            unsafe { visitor.visit_region(ptr as *const u8, len) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect(Vec<Address>);

    impl RootVisitor for Collect {
        fn visit(&mut self, addr: Address) {
            self.0.push(addr);
        }
    }

    #[test]
    fn test_slots_are_reused() {
        let roots = StaticRoots::new();
        let a = roots.add(Address::from_usize(8));
        let b = roots.add(Address::from_usize(16));
        assert_eq!(roots.remove(a), Some(Address::from_usize(8)));
        assert_eq!(roots.remove(a), None);
        let c = roots.add(Address::from_usize(24));
        assert_eq!(c, a);
        assert_eq!(roots.len(), 2);

        let mut seen = Collect::default();
        roots.for_each_global_root(&mut seen);
        seen.0.sort();
        assert_eq!(seen.0, vec![Address::from_usize(16), Address::from_usize(24)]);
        roots.set(b, Address::NULL);
        assert_eq!(roots.get(b), Some(Address::NULL));
    }

    #[test]
    fn test_region_scan_skips_unaligned_tail() {
        let words: [usize; 3] = [0x10, 0x20, 0x30];
        let roots = StaticRoots::new();
        // SAFETY: `words` outlives the registration.
        let id = unsafe { roots.register_region(words.as_ptr().cast(), 3 * WORD_SIZE - 1) };
        let mut seen = Collect::default();
        roots.for_each_thread_stack(&mut seen);
        assert_eq!(seen.0, vec![Address::from_usize(0x10), Address::from_usize(0x20)]);

        roots.unregister_region(id);
        let mut seen = Collect::default();
        roots.for_each_thread_stack(&mut seen);
        assert!(seen.0.is_empty());
    }
}
