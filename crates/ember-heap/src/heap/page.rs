//! Pages and object headers.
//!
//! Normal pages are fixed-size and carved into objects by the allocator;
//! large pages hold exactly one object. Every allocation is prefixed by a
//! [`HeapObjectHeader`]. Pages own their raw memory but not its lifecycle:
//! reservation and release always go through the
//! [`PageBackend`](crate::backend::PageBackend).

use std::ptr::NonNull;

/// Size of a normal page in bytes.
pub const PAGE_SIZE: usize = 16 * 1024;

/// Allocations whose total size (header included) exceeds this go to the
/// large-object space.
pub const LARGE_OBJECT_THRESHOLD: usize = PAGE_SIZE / 2;

/// Every allocation size is rounded up to this granularity, which also keeps
/// the low bits of the encoded header size free for flags.
pub const ALLOCATION_GRANULARITY: usize = 8;

const FREE_BIT: u32 = 1;
const MARK_BIT: u32 = 2;
const FLAG_MASK: u32 = (ALLOCATION_GRANULARITY as u32) - 1;

/// Round `size` up to the allocation granularity.
pub(crate) const fn round_up(size: usize) -> usize {
    (size + ALLOCATION_GRANULARITY - 1) & !(ALLOCATION_GRANULARITY - 1)
}

/// Total allocation size for a payload of `payload_size` bytes: header plus
/// the granularity-rounded payload. `None` when the request cannot be
/// represented, either through arithmetic overflow or because it exceeds the
/// encodable object size.
pub(crate) fn checked_total_size(payload_size: usize) -> Option<usize> {
    let rounded = payload_size.checked_add(ALLOCATION_GRANULARITY - 1)?
        & !(ALLOCATION_GRANULARITY - 1);
    let total = rounded.checked_add(HEADER_SIZE)?;
    if total > u32::MAX as usize {
        return None;
    }
    Some(total)
}

/// Metadata prefixed to every managed allocation.
///
/// The size is encoded together with the flag bits: sizes are always
/// multiples of the allocation granularity, so the low bits carry the "free"
/// and "marked" flags. Objects on large pages encode size zero; their true
/// size lives on the owning [`LargePage`] and is decoded via [`ObjectView`].
#[derive(Debug)]
#[repr(C, align(8))]
pub struct HeapObjectHeader {
    encoded: u32,
    _reserved: u32,
}

/// Size of the header prefix, in bytes.
pub const HEADER_SIZE: usize = std::mem::size_of::<HeapObjectHeader>();

impl HeapObjectHeader {
    /// Encoded size of this allocation, header included. Zero for objects on
    /// large pages.
    #[inline]
    pub fn size(&self) -> usize {
        (self.encoded & !FLAG_MASK) as usize
    }

    /// Whether this header describes free-list memory rather than an object.
    #[inline]
    pub fn is_free(&self) -> bool {
        self.encoded & FREE_BIT != 0
    }

    /// Whether the last marking pass found this object reachable.
    #[inline]
    pub fn is_marked(&self) -> bool {
        self.encoded & MARK_BIT != 0
    }

    /// Set or clear the mark bit. Called by the external tracer during
    /// marking and by the sweeper when it retires a cycle's marks.
    #[inline]
    pub fn set_marked(&mut self, marked: bool) {
        if marked {
            self.encoded |= MARK_BIT;
        } else {
            self.encoded &= !MARK_BIT;
        }
    }

    /// Pointer to the object payload following this header.
    #[inline]
    pub fn payload(&self) -> *mut u8 {
        (self as *const Self as *mut u8).wrapping_add(HEADER_SIZE)
    }

    /// Recover the header from an object payload pointer.
    ///
    /// # Safety
    ///
    /// `payload` must be a payload pointer previously handed out by the heap,
    /// and the object must not have been swept.
    #[inline]
    pub unsafe fn from_payload<'a>(payload: *mut u8) -> &'a mut HeapObjectHeader {
        &mut *(payload.sub(HEADER_SIZE) as *mut HeapObjectHeader)
    }

    /// Write an object header for an allocation of `size` bytes at `at`.
    ///
    /// # Safety
    ///
    /// `at` must point to at least `size` bytes of heap-owned memory;
    /// `size` must be granularity-aligned (or zero for large objects).
    pub(crate) unsafe fn write_object(at: *mut u8, size: usize) {
        debug_assert_eq!(size % ALLOCATION_GRANULARITY, 0);
        (at as *mut HeapObjectHeader).write(HeapObjectHeader {
            encoded: size as u32,
            _reserved: 0,
        });
    }

    /// Write a free-memory header covering `size` bytes at `at`.
    ///
    /// # Safety
    ///
    /// Same contract as [`HeapObjectHeader::write_object`]; `size` must be at
    /// least [`HEADER_SIZE`].
    pub(crate) unsafe fn write_free(at: *mut u8, size: usize) {
        debug_assert!(size >= HEADER_SIZE);
        debug_assert_eq!(size % ALLOCATION_GRANULARITY, 0);
        (at as *mut HeapObjectHeader).write(HeapObjectHeader {
            encoded: size as u32 | FREE_BIT,
            _reserved: 0,
        });
    }
}

/// Decoder pairing a header with enough page context to compute true sizes.
#[derive(Clone, Copy)]
pub struct ObjectView<'a> {
    header: &'a HeapObjectHeader,
    large_object_size: Option<usize>,
}

impl<'a> ObjectView<'a> {
    pub(crate) fn normal(header: &'a HeapObjectHeader) -> Self {
        Self {
            header,
            large_object_size: None,
        }
    }

    pub(crate) fn large(header: &'a HeapObjectHeader, object_size: usize) -> Self {
        Self {
            header,
            large_object_size: Some(object_size),
        }
    }

    /// The header under view.
    pub fn header(&self) -> &'a HeapObjectHeader {
        self.header
    }

    /// Total allocation size, header included.
    pub fn size(&self) -> usize {
        self.large_object_size.unwrap_or_else(|| self.header.size())
    }

    /// Payload size of the allocation.
    pub fn payload_size(&self) -> usize {
        self.size() - HEADER_SIZE
    }
}

/// A fixed-size page of the normal object spaces.
#[derive(Debug)]
pub struct NormalPage {
    memory: NonNull<u8>,
}

impl NormalPage {
    pub(crate) fn new(memory: NonNull<u8>) -> Self {
        Self { memory }
    }

    pub(crate) fn memory(&self) -> NonNull<u8> {
        self.memory
    }

    /// First byte usable for objects.
    pub(crate) fn payload_start(&self) -> *mut u8 {
        self.memory.as_ptr()
    }

    /// One past the last usable byte.
    pub(crate) fn payload_end(&self) -> *mut u8 {
        self.memory.as_ptr().wrapping_add(PAGE_SIZE)
    }

    /// Whether `addr` falls inside this page's payload.
    pub(crate) fn contains(&self, addr: *const u8) -> bool {
        let addr = addr as usize;
        addr >= self.payload_start() as usize && addr < self.payload_end() as usize
    }

    /// Walk every header on this page in address order.
    ///
    /// `lab` is the span of this space's linear allocation buffer if it
    /// currently sits on this page; the span carries no headers yet and is
    /// skipped. Everything else on the page is covered by object or free
    /// headers back to back, which is the invariant the allocator maintains.
    pub(crate) fn for_each_header(
        &self,
        lab: Option<(*mut u8, usize)>,
        mut f: impl FnMut(&HeapObjectHeader),
    ) {
        let mut current = self.payload_start();
        let end = self.payload_end();
        while current < end {
            if let Some((lab_start, lab_size)) = lab {
                if current == lab_start {
                    current = current.wrapping_add(lab_size);
                    continue;
                }
            }
            // SAFETY: current points at a header by the page layout invariant.
            let header = unsafe { &*(current as *const HeapObjectHeader) };
            let size = header.size();
            debug_assert!(size >= HEADER_SIZE, "corrupt header during page walk");
            f(header);
            current = current.wrapping_add(size);
        }
        debug_assert_eq!(current, end, "page walk overran the payload");
    }
}

/// A page holding exactly one large object.
pub struct LargePage {
    memory: NonNull<u8>,
    /// Reserved size of the page, which is what the backend must be given
    /// back on release.
    reserved_size: usize,
    /// Size of the single object, header included.
    object_size: usize,
}

impl LargePage {
    pub(crate) fn new(memory: NonNull<u8>, reserved_size: usize, object_size: usize) -> Self {
        Self {
            memory,
            reserved_size,
            object_size,
        }
    }

    pub(crate) fn memory(&self) -> NonNull<u8> {
        self.memory
    }

    pub(crate) fn reserved_size(&self) -> usize {
        self.reserved_size
    }

    pub(crate) fn object_size(&self) -> usize {
        self.object_size
    }

    /// The one object header on this page.
    pub(crate) fn header(&self) -> &HeapObjectHeader {
        // SAFETY: the allocator wrote a header at the page base.
        unsafe { &*(self.memory.as_ptr() as *const HeapObjectHeader) }
    }

    pub(crate) fn header_mut(&mut self) -> &mut HeapObjectHeader {
        // SAFETY: as above, and we hold exclusive access to the page.
        unsafe { &mut *(self.memory.as_ptr() as *mut HeapObjectHeader) }
    }
}
