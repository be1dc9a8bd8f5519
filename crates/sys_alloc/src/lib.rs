//! Virtual memory primitives used by the `spangc` page heap.
//!
//! The page heap reserves large aligned regions ("arenas") from the OS, hands
//! out page ranges from them, and occasionally returns idle ranges to the OS
//! while keeping the address range reserved.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// A handle to an anonymous memory mapping.
///
/// The region is unmapped when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the memory mapping.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the memory mapping in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Returns the first address inside the mapping that is a multiple of
    /// `align`, if the mapping still has `len` bytes left from there.
    pub fn aligned_start(&self, align: usize, len: usize) -> Option<usize> {
        debug_assert!(align.is_power_of_two());
        let start = self.ptr() as usize;
        let aligned = start.checked_add(align - 1)? & !(align - 1);
        let end = start.checked_add(self.len())?;
        (aligned.checked_add(len)? <= end).then_some(aligned)
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

/// Configuration for creating a memory mapping.
#[derive(Debug, Clone)]
pub struct MmapOptions {
    len: usize,
    hint_addr: usize,
    no_reserve: bool,
}

impl MmapOptions {
    /// Creates a new `MmapOptions` with default settings (length 0).
    /// You must set a length before mapping.
    pub const fn new() -> Self {
        Self {
            len: 0,
            hint_addr: 0,
            no_reserve: false,
        }
    }

    /// Sets the length of the mapping in bytes.
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Sets a hint address for the mapping.
    ///
    /// The OS may ignore the hint. The page heap uses it to keep successive
    /// arenas contiguous, which lets free ranges coalesce across arenas.
    pub const fn with_hint(mut self, addr: usize) -> Self {
        self.hint_addr = addr;
        self
    }

    /// Sets whether to skip reserving swap space (on supported platforms).
    ///
    /// On Linux, this adds `MAP_NORESERVE`.
    pub const fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Creates an anonymous read/write memory map.
    ///
    /// # Safety
    ///
    /// The returned mapping owns the memory; pointers derived from
    /// [`Mmap::ptr`] are only valid while the `Mmap` is alive.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }

        let inner = unsafe { os::MmapInner::map_anon(self.hint_addr, self.len, self.no_reserve)? };

        Ok(Mmap { inner })
    }
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the physical pages backing `[ptr, ptr + len)` to the OS.
///
/// The address range stays reserved and readable; subsequent reads observe
/// zeroes. Returns `Ok(true)` when that zero-fill guarantee holds.
///
/// # Safety
///
/// `ptr` must be page aligned, `len` a multiple of the page size, and the
/// range must lie inside a live mapping that nothing else is using.
pub unsafe fn decommit(ptr: *mut u8, len: usize) -> io::Result<bool> {
    if len == 0 {
        return Ok(true);
    }
    unsafe { os::decommit(ptr, len) }
}
