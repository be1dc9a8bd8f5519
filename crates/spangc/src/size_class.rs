//! Size classes for small objects.
//!
//! Requests up to [`MAX_SMALL_SIZE`] bytes are rounded up to one of
//! [`NUM_SIZE_CLASSES`] object sizes. Every span of a class holds
//! `objects_per_span` slots of `object_size` bytes carved out of
//! `span_pages` pages. Class 0 is reserved for large objects, which get a
//! span of their own.

use std::sync::LazyLock;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 13;
/// Size of a heap page. Spans are whole numbers of pages.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Largest request served from a size class.
pub const MAX_SMALL_SIZE: usize = 32768;
/// Number of size classes, class 0 included.
pub const NUM_SIZE_CLASSES: usize = 67;
/// Number of span classes: every size class in a scan and a noscan flavour.
pub const NUM_SPAN_CLASSES: usize = NUM_SIZE_CLASSES << 1;

const SMALL_SIZE_DIV: usize = 8;
const SMALL_SIZE_MAX: usize = 1024;
const LARGE_SIZE_DIV: usize = 128;

#[rustfmt::skip]
const CLASS_TO_SIZE: [u16; NUM_SIZE_CLASSES] = [
    0, 8, 16, 32, 48, 64, 80, 96, 112, 128,
    144, 160, 176, 192, 208, 224, 240, 256, 288, 320,
    352, 384, 416, 448, 480, 512, 576, 640, 704, 768,
    896, 1024, 1152, 1280, 1408, 1536, 1792, 2048, 2304, 2688,
    3072, 3200, 3456, 4096, 4864, 5376, 6144, 6528, 6784, 6912,
    8192, 9472, 9728, 10240, 10880, 12288, 13568, 14336, 16384, 18432,
    19072, 20480, 21760, 24576, 27264, 28672, 32768,
];

#[rustfmt::skip]
const CLASS_TO_PAGES: [u8; NUM_SIZE_CLASSES] = [
    0, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    3, 2, 3, 1, 3, 2, 3, 4, 5, 6,
    1, 7, 6, 5, 4, 3, 5, 7, 2, 9,
    7, 5, 8, 3, 10, 7, 4,
];

/// One entry of the size-class table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
    /// Index into the table; 0 is the large-object class.
    pub class_id: u8,
    /// Bytes per object slot.
    pub object_size: usize,
    /// Pages per span of this class.
    pub span_pages: usize,
    /// Object slots per span.
    pub objects_per_span: usize,
}

impl SizeClass {
    const LARGE: Self = Self {
        class_id: 0,
        object_size: 0,
        span_pages: 0,
        objects_per_span: 0,
    };

    /// Bytes per span of this class.
    #[must_use]
    pub const fn span_bytes(&self) -> usize {
        self.span_pages * PAGE_SIZE
    }

    /// Bytes at the end of each span that no slot covers.
    #[must_use]
    pub const fn tail_waste(&self) -> usize {
        self.span_bytes() - self.objects_per_span * self.object_size
    }
}

/// Immutable lookup table from request size to size class.
#[derive(Debug)]
pub struct SizeClassTable {
    classes: [SizeClass; NUM_SIZE_CLASSES],
    size_to_class8: [u8; SMALL_SIZE_MAX / SMALL_SIZE_DIV + 1],
    size_to_class128: [u8; (MAX_SMALL_SIZE - SMALL_SIZE_MAX) / LARGE_SIZE_DIV + 1],
}

static TABLE: LazyLock<SizeClassTable> = LazyLock::new(SizeClassTable::build);

impl SizeClassTable {
    /// Returns the process-wide table, building it on first use.
    #[must_use]
    pub fn get() -> &'static Self {
        &TABLE
    }

    fn build() -> Self {
        let mut classes = [SizeClass::LARGE; NUM_SIZE_CLASSES];
        for (id, class) in classes.iter_mut().enumerate().skip(1) {
            let object_size = usize::from(CLASS_TO_SIZE[id]);
            let span_pages = usize::from(CLASS_TO_PAGES[id]);
            #[allow(clippy::cast_possible_truncation)]
            let class_id = id as u8;
            *class = SizeClass {
                class_id,
                object_size,
                span_pages,
                objects_per_span: span_pages * PAGE_SIZE / object_size,
            };
        }

        let smallest_fitting = |size: usize| -> u8 {
            let id = CLASS_TO_SIZE
                .iter()
                .skip(1)
                .position(|&s| usize::from(s) >= size)
                .map_or(NUM_SIZE_CLASSES - 1, |i| i + 1);
            #[allow(clippy::cast_possible_truncation)]
            let id = id as u8;
            id
        };

        let mut size_to_class8 = [0u8; SMALL_SIZE_MAX / SMALL_SIZE_DIV + 1];
        for (i, slot) in size_to_class8.iter_mut().enumerate() {
            *slot = smallest_fitting(i * SMALL_SIZE_DIV);
        }
        let mut size_to_class128 = [0u8; (MAX_SMALL_SIZE - SMALL_SIZE_MAX) / LARGE_SIZE_DIV + 1];
        for (i, slot) in size_to_class128.iter_mut().enumerate() {
            *slot = smallest_fitting(SMALL_SIZE_MAX + i * LARGE_SIZE_DIV);
        }

        Self {
            classes,
            size_to_class8,
            size_to_class128,
        }
    }

    /// Returns the size class serving a request of `size` bytes, or `None`
    /// when the request needs a large span. A zero-byte request is served
    /// by the smallest class.
    #[inline]
    #[must_use]
    pub fn class_for(&self, size: usize) -> Option<u8> {
        if size <= SMALL_SIZE_MAX - 8 {
            Some(self.size_to_class8[size.div_ceil(SMALL_SIZE_DIV)])
        } else if size <= MAX_SMALL_SIZE {
            Some(self.size_to_class128[(size + LARGE_SIZE_DIV - 1 - SMALL_SIZE_MAX) / LARGE_SIZE_DIV])
        } else {
            None
        }
    }

    /// Returns the table entry for `class_id`.
    ///
    /// # Panics
    ///
    /// Panics if `class_id >= NUM_SIZE_CLASSES`.
    #[inline]
    #[must_use]
    pub fn class(&self, class_id: u8) -> &SizeClass {
        &self.classes[usize::from(class_id)]
    }

    /// Returns the number of bytes actually reserved for a request of `size`
    /// bytes: the object size of its class, or whole pages for large objects.
    #[must_use]
    pub fn roundup_size(&self, size: usize) -> usize {
        match self.class_for(size) {
            Some(class) => self.class(class).object_size,
            None => size.div_ceil(PAGE_SIZE).saturating_mul(PAGE_SIZE),
        }
    }

    /// Iterates over the small size classes (class 0 excluded).
    pub fn iter(&self) -> impl Iterator<Item = &SizeClass> {
        self.classes.iter().skip(1)
    }
}

/// A size class paired with a "contains no pointers" flag.
///
/// Objects in `noscan` spans are marked but never scanned, so allocating
/// pointer-free data there keeps the mark phase short.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanClass(u8);

impl SpanClass {
    /// Large-object span class whose objects may contain pointers.
    pub const LARGE: Self = Self(0);
    /// Large-object span class whose objects contain no pointers.
    pub const LARGE_NOSCAN: Self = Self(1);

    /// Builds a span class from a size class and the noscan flag.
    #[must_use]
    pub const fn new(size_class: u8, noscan: bool) -> Self {
        Self((size_class << 1) | noscan as u8)
    }

    /// The large-object class for the given noscan flag.
    #[must_use]
    pub const fn large(noscan: bool) -> Self {
        Self::new(0, noscan)
    }

    /// The size class part.
    #[must_use]
    pub const fn size_class(self) -> u8 {
        self.0 >> 1
    }

    /// Whether objects of this class are skipped by scanning.
    #[must_use]
    pub const fn noscan(self) -> bool {
        self.0 & 1 != 0
    }

    /// Whether this is a large-object class.
    #[must_use]
    pub const fn is_large(self) -> bool {
        self.size_class() == 0
    }

    /// Dense index in `0..NUM_SPAN_CLASSES`.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Inverse of [`SpanClass::index`].
    ///
    /// # Panics
    ///
    /// Panics if `index >= NUM_SPAN_CLASSES`.
    #[must_use]
    pub fn from_index(index: usize) -> Self {
        assert!(index < NUM_SPAN_CLASSES, "span class index out of range");
        #[allow(clippy::cast_possible_truncation)]
        let raw = index as u8;
        Self(raw)
    }
}

impl std::fmt::Debug for SpanClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SpanClass({}{})",
            self.size_class(),
            if self.noscan() { ", noscan" } else { "" }
        )
    }
}
