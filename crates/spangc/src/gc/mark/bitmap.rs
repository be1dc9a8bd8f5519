//! Atomic bit vectors for allocation and mark state.
//!
//! Each span carries two of these: one bit per object slot for "allocated"
//! and one for "marked this cycle". Arenas use the same type for their
//! per-page `page_in_use` / `page_marks` summaries.

use std::sync::atomic::{AtomicU64, Ordering};

const BITS_PER_WORD: usize = 64;

/// A fixed-length bit vector whose bits can be set concurrently.
///
/// Setting is a single `fetch_or`, so many markers can race on the same word
/// without losing updates. Word-level accessors are crate-private and used
/// by the sweeper, which owns the span exclusively while it rewrites bits.
///
/// # Example
///
/// ```
/// use spangc::GcBits;
///
/// let bits = GcBits::new(100);
/// assert!(!bits.get(3));
/// assert!(bits.set(3));
/// assert!(!bits.set(3));
/// assert_eq!(bits.count_ones(), 1);
/// assert_eq!(bits.next_clear_from(3), Some(4));
/// ```
#[derive(Debug)]
pub struct GcBits {
    words: Box<[AtomicU64]>,
    len: usize,
}

impl GcBits {
    /// Creates a zeroed bit vector of `len` bits.
    #[must_use]
    pub fn new(len: usize) -> Self {
        let words = (0..len.div_ceil(BITS_PER_WORD))
            .map(|_| AtomicU64::new(0))
            .collect();
        Self { words, len }
    }

    /// Number of bits.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the vector holds no bits at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads bit `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= len`.
    #[inline]
    #[must_use]
    pub fn get(&self, i: usize) -> bool {
        assert!(i < self.len, "bit index {i} out of range {}", self.len);
        let word = self.words[i / BITS_PER_WORD].load(Ordering::Acquire);
        word >> (i % BITS_PER_WORD) & 1 != 0
    }

    /// Sets bit `i`; returns `true` if this call changed it from 0 to 1.
    ///
    /// # Panics
    ///
    /// Panics if `i >= len`.
    #[inline]
    pub fn set(&self, i: usize) -> bool {
        assert!(i < self.len, "bit index {i} out of range {}", self.len);
        let mask = 1u64 << (i % BITS_PER_WORD);
        self.words[i / BITS_PER_WORD].fetch_or(mask, Ordering::AcqRel) & mask == 0
    }

    /// Clears bit `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= len`.
    #[inline]
    pub fn clear(&self, i: usize) {
        assert!(i < self.len, "bit index {i} out of range {}", self.len);
        let mask = 1u64 << (i % BITS_PER_WORD);
        self.words[i / BITS_PER_WORD].fetch_and(!mask, Ordering::AcqRel);
    }

    /// Clears every bit.
    pub fn clear_all(&self) {
        for word in &*self.words {
            word.store(0, Ordering::Release);
        }
    }

    /// Number of set bits.
    #[must_use]
    pub fn count_ones(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    /// Index of the first clear bit at or after `from`, if any.
    #[must_use]
    pub fn next_clear_from(&self, from: usize) -> Option<usize> {
        if from >= self.len {
            return None;
        }
        let mut idx = from / BITS_PER_WORD;
        // Pretend the bits below `from` are set.
        let mut word = self.words[idx].load(Ordering::Acquire) | low_mask(from % BITS_PER_WORD);
        loop {
            if word != u64::MAX {
                let bit = idx * BITS_PER_WORD + (!word).trailing_zeros() as usize;
                return (bit < self.len).then_some(bit);
            }
            idx += 1;
            if idx >= self.words.len() {
                return None;
            }
            word = self.words[idx].load(Ordering::Acquire);
        }
    }

    /// Number of backing words.
    pub(crate) fn word_count(&self) -> usize {
        self.words.len()
    }

    /// Reads backing word `w`.
    pub(crate) fn load_word(&self, w: usize) -> u64 {
        self.words[w].load(Ordering::Acquire)
    }

    /// Overwrites backing word `w`.
    pub(crate) fn store_word(&self, w: usize, value: u64) {
        self.words[w].store(value, Ordering::Release);
    }

    /// Mask of the bits of word `w` that correspond to valid indices.
    pub(crate) fn valid_mask(&self, w: usize) -> u64 {
        let start = w * BITS_PER_WORD;
        let valid = self.len.saturating_sub(start).min(BITS_PER_WORD);
        if valid == BITS_PER_WORD {
            u64::MAX
        } else {
            low_mask(valid)
        }
    }
}

/// Mask with the low `n` bits set, for `n < 64`.
#[inline]
pub(crate) const fn low_mask(n: usize) -> u64 {
    (1u64 << n) - 1
}
