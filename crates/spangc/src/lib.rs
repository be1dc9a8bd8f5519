//! A concurrent mark-sweep garbage collector over a span allocator.
//!
//! `spangc` manages a heap of fixed-size pages grouped into **spans**. Small
//! requests are rounded to one of a fixed set of size classes and served
//! from per-thread caches backed by per-class central free lists; large
//! requests get a span of their own. Collection is **non-moving**,
//! tri-colour mark-sweep:
//!
//! - a short stop-the-world pause scans the roots and turns on the write
//!   barrier,
//! - background workers and allocating mutators (assists) mark
//!   concurrently, paced by a feedback controller so marking finishes
//!   before the heap reaches its goal,
//! - a second short pause confirms termination and flips the sweep
//!   generation,
//! - spans are then swept lazily, by allocation and by a background
//!   sweeper.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use spangc::{GcConfig, Heap, StaticRoots};
//!
//! let roots = Arc::new(StaticRoots::new());
//! let mut config = GcConfig::new();
//! config.set_mark_workers(1);
//! let heap = Heap::new(config, roots.clone()).unwrap();
//!
//! let mut mutator = heap.mutator();
//! let node = mutator.allocate(32, true).unwrap();
//! let root = roots.add(node);
//!
//! mutator.force_gc(true);
//! assert!(heap.is_allocated(node));
//!
//! roots.remove(root);
//! ```
//!
//! # Objects and pointers
//!
//! Objects are untyped: every word of a scannable object is a candidate
//! pointer, and words that point into an allocated slot keep it alive.
//! Pointer words must be written through [`Mutator::store_pointer`] or
//! [`Mutator::write_barrier`] so concurrent marking never loses an object.
//!
//! # Threads
//!
//! Each thread that allocates needs its own [`Mutator`]. Mutators poll for
//! stop requests on every allocation; a thread that stops allocating for a
//! long time should call [`Mutator::safepoint`] or drop its handle.
//!
//! A freshly allocated object is only protected until its mutator's next
//! allocation or safepoint: store it into a root or a reachable object
//! before then.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod address;
pub mod config;
pub mod error;
pub mod gc;
pub mod heap;
pub mod metrics;
pub mod mutator;
pub mod roots;
pub mod size_class;
pub mod tracing;
pub mod world;

// Re-export public API
pub use address::Address;
pub use config::{GcConfig, PacerConfig};
pub use error::{GcError, Result};
pub use gc::mark::bitmap::GcBits;
pub use gc::pacer::GcController;
pub use gc::sweep::SweepOutcome;
pub use gc::{GcPhase, GcTrigger};
pub use heap::cache::Allocation;
pub use heap::span::{Span, SpanState};
pub use heap::Heap;
pub use metrics::{GcHistory, GcMetrics, MemStats, PauseHistogram};
pub use mutator::Mutator;
pub use roots::{RootSet, RootVisitor, StaticRoots};
pub use world::{SafepointWorld, World};

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::{GcConfig, Heap, Result, StaticRoots};

    /// A configuration for deterministic tests: no background sweeping, no
    /// periodic collections and a small heap minimum so cycles start early.
    #[must_use]
    pub fn test_config(mark_workers: usize) -> GcConfig {
        let mut config = GcConfig::new();
        config
            .set_procs(2)
            .set_mark_workers(mark_workers)
            .set_heap_minimum(256 << 10)
            .set_background_sweep(false)
            .set_force_gc_period(None);
        config
    }

    /// A heap over a fresh [`StaticRoots`] table.
    ///
    /// # Errors
    ///
    /// Fails if a collector thread cannot be spawned.
    pub fn heap_with_roots(config: GcConfig) -> Result<(Heap, Arc<StaticRoots>)> {
        let roots = Arc::new(StaticRoots::new());
        let heap = Heap::new(config, roots.clone())?;
        Ok((heap, roots))
    }

    /// Waits up to `timeout` for `cond` to hold.
    pub fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        cond()
    }
}
