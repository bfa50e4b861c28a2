//! Spaces: the partition of the heap into size-class page sets.
//!
//! The raw heap is four normal-page spaces (bucketed by allocation size) plus
//! one large-object space. Each normal space owns its pages, a free list and
//! the linear allocation buffer the allocator bumps from.

use std::ptr::NonNull;

use super::page::{HeapObjectHeader, LargePage, NormalPage, HEADER_SIZE};

/// Number of normal (size-class) spaces.
pub const NORMAL_SPACE_COUNT: usize = 4;

/// Identity of a space within the raw heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    /// Allocations up to 32 bytes (header included).
    Normal1,
    /// Allocations up to 64 bytes.
    Normal2,
    /// Allocations up to 128 bytes.
    Normal3,
    /// Allocations above 128 bytes below the large-object threshold.
    Normal4,
    /// One-object-per-page allocations above the threshold.
    Large,
}

impl SpaceKind {
    /// Stable name used in statistics snapshots.
    pub fn name(self) -> &'static str {
        match self {
            SpaceKind::Normal1 => "normal1",
            SpaceKind::Normal2 => "normal2",
            SpaceKind::Normal3 => "normal3",
            SpaceKind::Normal4 => "normal4",
            SpaceKind::Large => "large",
        }
    }

}

/// Index of the normal space responsible for an allocation of `size` bytes
/// (header included).
pub(crate) fn normal_space_index(size: usize) -> usize {
    match size {
        0..=32 => 0,
        33..=64 => 1,
        65..=128 => 2,
        _ => 3,
    }
}

/// One entry of free memory, already carrying a free header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FreeEntry {
    pub ptr: NonNull<u8>,
    pub size: usize,
}

/// Free memory within one normal space.
///
/// Entries always point at memory with a free header written over the whole
/// span, so a page walk stays coherent whether or not the entry has been
/// reused.
#[derive(Default)]
pub(crate) struct FreeList {
    entries: Vec<FreeEntry>,
}

impl FreeList {
    /// Add a span. The caller must have written a free header at `ptr`.
    pub fn add(&mut self, ptr: NonNull<u8>, size: usize) {
        debug_assert!(size >= HEADER_SIZE);
        self.entries.push(FreeEntry { ptr, size });
    }

    /// Remove and return the first entry of at least `min_size` bytes.
    pub fn take(&mut self, min_size: usize) -> Option<FreeEntry> {
        let index = self.entries.iter().position(|e| e.size >= min_size)?;
        Some(self.entries.swap_remove(index))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn total_size(&self) -> usize {
        self.entries.iter().map(|e| e.size).sum()
    }
}

/// The bump-allocation span the allocator currently carves objects from.
///
/// At most one per normal space; its bytes carry no headers until either an
/// object is bumped out of it or the remainder is reset back to the free
/// list.
#[derive(Debug)]
pub(crate) struct LinearAllocationBuffer {
    start: *mut u8,
    size: usize,
}

impl LinearAllocationBuffer {
    pub fn new() -> Self {
        Self {
            start: std::ptr::null_mut(),
            size: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn start(&self) -> *mut u8 {
        self.start
    }

    /// Bump `bytes` off the front, or fail if the buffer is too small.
    pub fn allocate(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        if bytes > self.size {
            return None;
        }
        let result = self.start;
        self.start = self.start.wrapping_add(bytes);
        self.size -= bytes;
        NonNull::new(result)
    }

    /// Replace the buffer with a new span.
    pub fn set(&mut self, start: NonNull<u8>, size: usize) {
        self.start = start.as_ptr();
        self.size = size;
    }

    /// Empty the buffer, returning the remaining span if any.
    pub fn reset(&mut self) -> Option<(NonNull<u8>, usize)> {
        if self.size == 0 {
            self.start = std::ptr::null_mut();
            return None;
        }
        let span = (NonNull::new(self.start)?, self.size);
        self.start = std::ptr::null_mut();
        self.size = 0;
        Some(span)
    }
}

/// A size-class space of normal pages.
pub struct NormalPageSpace {
    kind: SpaceKind,
    pages: Vec<NormalPage>,
    free_list: FreeList,
    lab: LinearAllocationBuffer,
}

impl NormalPageSpace {
    pub(crate) fn new(kind: SpaceKind) -> Self {
        Self {
            kind,
            pages: Vec::new(),
            free_list: FreeList::default(),
            lab: LinearAllocationBuffer::new(),
        }
    }

    /// This space's identity.
    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    /// Number of pages owned by this space.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Size of the active linear allocation buffer; zero when reset.
    pub fn linear_allocation_buffer_size(&self) -> usize {
        self.lab.size()
    }

    pub(crate) fn pages(&self) -> &[NormalPage] {
        &self.pages
    }

    pub(crate) fn pages_mut(&mut self) -> &mut Vec<NormalPage> {
        &mut self.pages
    }

    pub(crate) fn add_page(&mut self, page: NormalPage) {
        self.pages.push(page);
    }

    pub(crate) fn lab_mut(&mut self) -> &mut LinearAllocationBuffer {
        &mut self.lab
    }

    pub(crate) fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    pub(crate) fn free_list_mut(&mut self) -> &mut FreeList {
        &mut self.free_list
    }

    /// The LAB span if it currently sits on `page`.
    pub(crate) fn lab_span_on(&self, page: &NormalPage) -> Option<(*mut u8, usize)> {
        if self.lab.is_empty() || !page.contains(self.lab.start()) {
            return None;
        }
        Some((self.lab.start(), self.lab.size()))
    }

    /// Write the LAB remainder back as free memory and clear the buffer.
    pub(crate) fn reset_linear_allocation_buffer(&mut self) {
        if let Some((start, size)) = self.lab.reset() {
            // SAFETY: the span came out of this space's pages and is unused.
            unsafe { HeapObjectHeader::write_free(start.as_ptr(), size) };
            self.free_list.add(start, size);
        }
    }
}

/// The large-object space: one object per page.
pub struct LargePageSpace {
    pages: Vec<LargePage>,
}

impl LargePageSpace {
    pub(crate) fn new() -> Self {
        Self { pages: Vec::new() }
    }

    /// Number of large pages.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub(crate) fn pages(&self) -> &[LargePage] {
        &self.pages
    }

    pub(crate) fn pages_mut(&mut self) -> &mut Vec<LargePage> {
        &mut self.pages
    }

    pub(crate) fn add_page(&mut self, page: LargePage) {
        self.pages.push(page);
    }
}

/// The partition of heap memory into spaces. Owned exclusively by the heap
/// controller through its object allocator.
pub struct RawHeap {
    normal_spaces: [NormalPageSpace; NORMAL_SPACE_COUNT],
    large_space: LargePageSpace,
}

impl RawHeap {
    pub(crate) fn new() -> Self {
        Self {
            normal_spaces: [
                NormalPageSpace::new(SpaceKind::Normal1),
                NormalPageSpace::new(SpaceKind::Normal2),
                NormalPageSpace::new(SpaceKind::Normal3),
                NormalPageSpace::new(SpaceKind::Normal4),
            ],
            large_space: LargePageSpace::new(),
        }
    }

    /// The normal spaces in size-class order.
    pub fn normal_spaces(&self) -> &[NormalPageSpace] {
        &self.normal_spaces
    }

    pub(crate) fn normal_spaces_mut(&mut self) -> &mut [NormalPageSpace; NORMAL_SPACE_COUNT] {
        &mut self.normal_spaces
    }

    /// The large-object space.
    pub fn large_space(&self) -> &LargePageSpace {
        &self.large_space
    }

    pub(crate) fn large_space_mut(&mut self) -> &mut LargePageSpace {
        &mut self.large_space
    }

    pub(crate) fn normal_space_mut(&mut self, index: usize) -> &mut NormalPageSpace {
        &mut self.normal_spaces[index]
    }
}
