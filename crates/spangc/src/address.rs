//! Word-sized heap addresses.

use std::fmt;

/// Size of a machine word in bytes. Object slots are scanned in word steps.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// A raw address inside (or outside) the collected heap.
///
/// `Address` is a plain integer: it carries no provenance and is never
/// dereferenced by the collector except through the span that owns it.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Address(usize);

impl Address {
    /// The null address. Never allocated, ignored by marking.
    pub const NULL: Self = Self(0);

    /// Wraps a raw integer address.
    #[inline]
    #[must_use]
    pub const fn from_usize(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the raw integer address.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns `true` for [`Address::NULL`].
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the address `bytes` past `self`.
    #[inline]
    #[must_use]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    /// Returns the distance in bytes from `base` to `self`.
    #[inline]
    #[must_use]
    pub const fn offset_from(self, base: Self) -> usize {
        self.0.wrapping_sub(base.0)
    }

    /// Rounds down to a multiple of `align` (a power of two).
    #[inline]
    #[must_use]
    pub const fn align_down(self, align: usize) -> Self {
        Self(self.0 & !(align - 1))
    }

    /// Rounds up to a multiple of `align` (a power of two).
    #[inline]
    #[must_use]
    pub const fn align_up(self, align: usize) -> Self {
        Self(self.0.wrapping_add(align - 1) & !(align - 1))
    }

    /// Returns `true` if the address is a multiple of `align`.
    #[inline]
    #[must_use]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Converts the address into a raw pointer.
    #[inline]
    #[must_use]
    pub const fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

/// Returns `true` if a word at byte `offset` lies wholly inside an object
/// of `size` bytes and is word aligned.
#[inline]
#[must_use]
pub const fn word_in_object(offset: usize, size: usize) -> bool {
    if offset % WORD_SIZE != 0 {
        return false;
    }
    match offset.checked_add(WORD_SIZE) {
        Some(end) => end <= size,
        None => false,
    }
}

impl<T> From<*mut T> for Address {
    fn from(ptr: *mut T) -> Self {
        Self(ptr as usize)
    }
}

impl<T> From<*const T> for Address {
    fn from(ptr: *const T) -> Self {
        Self(ptr as usize)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::{word_in_object, Address, WORD_SIZE};

    #[test]
    fn test_alignment_helpers() {
        let a = Address::from_usize(0x1234);
        assert_eq!(a.align_down(0x1000).as_usize(), 0x1000);
        assert_eq!(a.align_up(0x1000).as_usize(), 0x2000);
        assert!(Address::from_usize(0x2000).is_aligned(0x1000));
        assert!(!a.is_aligned(8));
    }

    #[test]
    fn test_offsets() {
        let base = Address::from_usize(0x1000);
        let p = base.offset(24);
        assert_eq!(p.offset_from(base), 24);
        assert!(Address::NULL.is_null());
        assert_eq!(format!("{p:?}"), "0x1018");
    }

    #[test]
    fn test_word_in_object() {
        assert!(word_in_object(0, 32));
        assert!(word_in_object(32 - WORD_SIZE, 32));
        assert!(!word_in_object(32, 32));
        assert!(!word_in_object(3, 32));
        assert!(!word_in_object(0, WORD_SIZE - 1));
        // Offsets whose end wraps around the address space.
        assert!(!word_in_object(usize::MAX - 7, 32));
        assert!(!word_in_object(usize::MAX - (WORD_SIZE - 1), usize::MAX));
        assert!(!word_in_object(usize::MAX & !(WORD_SIZE - 1), 64));
    }
}
