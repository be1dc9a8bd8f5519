//! The collector: phase state machine, marking, pacing and sweeping.

pub mod coordinator;
pub mod mark;
pub(crate) mod marker;
pub mod pacer;
pub mod sweep;
pub mod sync;
pub mod work;

use std::sync::atomic::{AtomicU8, Ordering};

/// Collector phase.
///
/// `Off -> Mark -> MarkTermination -> Off`. Both transitions happen with
/// the world stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GcPhase {
    /// No cycle is running; the write barrier is disabled.
    Off = 0,
    /// Concurrent marking; the write barrier shades and new objects are
    /// allocated black.
    Mark = 1,
    /// Marking is complete and the cycle is being finalized.
    MarkTermination = 2,
}

impl GcPhase {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Mark,
            2 => Self::MarkTermination,
            _ => Self::Off,
        }
    }
}

/// Atomic cell holding a [`GcPhase`].
#[derive(Debug)]
pub(crate) struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub(crate) const fn new() -> Self {
        Self(AtomicU8::new(GcPhase::Off as u8))
    }

    pub(crate) fn load(&self) -> GcPhase {
        GcPhase::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn store(&self, phase: GcPhase) {
        self.0.store(phase as u8, Ordering::SeqCst);
    }
}

/// Reason for starting a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcTrigger {
    /// `heap_live` reached the pacer's trigger.
    Heap,
    /// The periodic force interval elapsed since the last cycle.
    Time,
    /// Explicit request to start cycle number `n` if it has not started.
    Cycle(u32),
}

impl GcTrigger {
    /// Short label used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Heap => "heap",
            Self::Time => "time",
            Self::Cycle(_) => "cycle",
        }
    }

    /// Whether the trigger came from an explicit request.
    #[must_use]
    pub const fn is_forced(self) -> bool {
        matches!(self, Self::Cycle(_))
    }
}
