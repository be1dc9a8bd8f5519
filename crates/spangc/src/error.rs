//! Recoverable errors and the fatal-error path.
//!
//! A mutator can observe running out of memory and requests no span can
//! satisfy. Everything else that goes wrong inside the collector means the
//! heap is corrupt, and the process is aborted through
//! [`fatal!`](crate::fatal).

use std::fmt;
use std::io;

/// Errors returned by allocation entry points.
#[derive(Debug)]
#[non_exhaustive]
pub enum GcError {
    /// The page heap could not obtain more memory from the OS, or growing
    /// would exceed the configured heap limit.
    OutOfMemory {
        /// Bytes the failing request asked for.
        requested: usize,
    },
    /// The requested size cannot be represented as a page count.
    SizeOverflow {
        /// Bytes the failing request asked for.
        requested: usize,
    },
    /// The request asked for an empty span.
    ZeroSize,
    /// The OS rejected a virtual memory operation that is not an allocation,
    /// such as returning pages during scavenging.
    Os(io::Error),
}

impl fmt::Display for GcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "out of memory allocating {requested} bytes")
            }
            Self::SizeOverflow { requested } => {
                write!(f, "allocation size {requested} overflows the page heap")
            }
            Self::ZeroSize => f.write_str("span of zero pages requested"),
            Self::Os(err) => write!(f, "virtual memory operation failed: {err}"),
        }
    }
}

impl std::error::Error for GcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Os(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for GcError {
    fn from(err: io::Error) -> Self {
        Self::Os(err)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GcError>;

/// Aborts the process after reporting a broken collector invariant.
///
/// Continuing after a heap invariant fails risks freeing live memory, so the
/// report is written to stderr (and to `tracing` when enabled) and the process
/// aborts without unwinding.
#[cold]
#[inline(never)]
pub fn throw(msg: &str) -> ! {
    crate::tracing::log_fatal(msg);
    eprintln!("fatal error: {msg}");
    eprintln!("{}", std::backtrace::Backtrace::force_capture());
    std::process::abort()
}

/// Formats a message and aborts via [`throw`].
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::error::throw(&::std::format!($($arg)*))
    };
}
