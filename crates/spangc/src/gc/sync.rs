//! # Lock ordering
//!
//! The collector takes its locks in one global order:
//!
//! | Level | Lock            | Protects                                      |
//! |-------|-----------------|-----------------------------------------------|
//! | 1     | `Transition`    | phase changes and stop-the-world sequencing   |
//! | 2     | `Central`       | one span class's partial/full sets            |
//! | 3     | `PageHeap`      | free ranges and OS mappings                   |
//! | 4     | `Arena`         | an arena's page-to-span table                 |
//!
//! A thread holding a lock may only take locks of the same or a higher
//! level. Central locks are never nested in practice, so the "same level"
//! allowance only covers re-entrance through different heaps in tests.
//!
//! In debug builds every guarded acquisition is checked against the highest
//! level the thread already holds; release builds compile the checks away.
//!
//! ```
//! use spangc::gc::sync::{held_level, LockGuard, LockOrder};
//!
//! let _transition = LockGuard::new(LockOrder::Transition);
//! let _page_heap = LockGuard::new(LockOrder::PageHeap);
//! # #[cfg(debug_assertions)]
//! assert_eq!(held_level(), Some(LockOrder::PageHeap));
//! ```

use std::cell::RefCell;

const MAX_LOCK_DEPTH: usize = 16;

thread_local!(static HELD: RefCell<Vec<LockOrder>> = RefCell::new(Vec::with_capacity(MAX_LOCK_DEPTH)));

/// Lock order tags, in acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockOrder {
    /// Collector transition lock (level 1).
    Transition = 1,
    /// Per-span-class central free list lock (level 2).
    Central = 2,
    /// Page heap lock (level 3).
    PageHeap = 3,
    /// Arena span-table lock (level 4).
    Arena = 4,
}

impl LockOrder {
    /// Numeric level; higher levels are taken later.
    #[must_use]
    pub const fn level(self) -> u8 {
        self as u8
    }
}

/// RAII marker recording that the current thread holds a lock of `tag`'s level.
///
/// Create it right before taking the real lock and keep it alive for as
/// long as the lock is held.
#[must_use = "LockGuard must be held for the duration of the critical section"]
#[derive(Debug)]
pub struct LockGuard {
    _tag: LockOrder,
}

impl LockGuard {
    /// Validates `tag` against the locks already held and records it.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if a lock of a higher level is already held.
    pub fn new(tag: LockOrder) -> Self {
        #[cfg(debug_assertions)]
        {
            validate_lock_order(tag);
            let _ = HELD.try_with(|held| held.borrow_mut().push(tag));
        }
        Self { _tag: tag }
    }
}

#[cfg(debug_assertions)]
impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = HELD.try_with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&t| t == self._tag) {
                held.remove(pos);
            }
        });
    }
}

/// Highest lock level the current thread holds, if any.
///
/// Always `None` in release builds.
#[must_use]
pub fn held_level() -> Option<LockOrder> {
    HELD.try_with(|held| held.borrow().iter().copied().max())
        .ok()
        .flatten()
}

/// Checks that `tag` may be acquired now.
///
/// # Panics
///
/// Panics if the thread holds a lock of a higher level than `tag`.
#[inline]
pub fn validate_lock_order(tag: LockOrder) {
    if let Some(held) = held_level() {
        assert!(
            tag >= held,
            "lock ordering violation: {tag:?} (level {}) acquired while holding {held:?} (level {})",
            tag.level(),
            held.level()
        );
    }
}
