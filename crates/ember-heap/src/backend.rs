//! Page backend: the heap's only source of raw memory.
//!
//! Thin wrapper over the [`PageAllocator`] capability. Reservation failures
//! are reported as [`HeapError::OutOfMemory`]; the allocator decides whether
//! that is fatal.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::heap::page::{LargePage, NormalPage, PAGE_SIZE};
use crate::platform::{PageAllocator, PAGE_ALIGNMENT};
use crate::{HeapError, HeapResult};

/// Allocate and free pages for the object allocator and the sweeper.
pub struct PageBackend {
    page_allocator: Arc<dyn PageAllocator>,
}

impl PageBackend {
    pub(crate) fn new(page_allocator: Arc<dyn PageAllocator>) -> Self {
        Self { page_allocator }
    }

    /// Reserve one normal page.
    pub(crate) fn allocate_normal_page(&mut self) -> HeapResult<NormalPage> {
        let memory = self
            .page_allocator
            .allocate_pages(PAGE_SIZE)
            .ok_or(HeapError::OutOfMemory { size: PAGE_SIZE })?;
        Ok(NormalPage::new(memory))
    }

    /// Return a normal page's memory to the allocator.
    pub(crate) fn free_normal_page(&mut self, page: NormalPage) {
        // SAFETY: the page's memory came from this backend's allocator with
        // PAGE_SIZE and is released exactly once, here.
        unsafe { self.page_allocator.free_pages(page.memory(), PAGE_SIZE) };
    }

    /// Reserve a page for one large object of `object_size` bytes (header
    /// included).
    pub(crate) fn allocate_large_page(&mut self, object_size: usize) -> HeapResult<LargePage> {
        let reserved_size = (object_size + PAGE_ALIGNMENT - 1) & !(PAGE_ALIGNMENT - 1);
        let memory = self
            .page_allocator
            .allocate_pages(reserved_size)
            .ok_or(HeapError::OutOfMemory {
                size: reserved_size,
            })?;
        Ok(LargePage::new(memory, reserved_size, object_size))
    }

    /// Return a large page's memory to the allocator.
    pub(crate) fn free_large_page(&mut self, page: LargePage) {
        // SAFETY: same single-release contract as free_normal_page.
        unsafe {
            self.page_allocator
                .free_pages(page.memory(), page.reserved_size())
        };
    }

    #[cfg(test)]
    pub(crate) fn page_allocator(&self) -> &Arc<dyn PageAllocator> {
        &self.page_allocator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::SystemPageAllocator;

    fn backend() -> PageBackend {
        PageBackend::new(Arc::new(SystemPageAllocator))
    }

    #[test]
    fn normal_page_round_trip() {
        let mut backend = backend();
        let page = backend.allocate_normal_page().unwrap();
        assert!(page.contains(page.payload_start()));
        assert!(!page.contains(page.payload_end()));
        backend.free_normal_page(page);
    }

    #[test]
    fn large_page_records_object_size() {
        let mut backend = backend();
        let page = backend.allocate_large_page(40 * 1024 + 8).unwrap();
        assert_eq!(page.object_size(), 40 * 1024 + 8);
        assert_eq!(page.reserved_size() % PAGE_ALIGNMENT, 0);
        assert!(page.reserved_size() >= page.object_size());
        backend.free_large_page(page);
    }

    #[test]
    fn failing_allocator_reports_oom() {
        struct FailingAllocator;
        impl PageAllocator for FailingAllocator {
            fn allocate_pages(&self, _size: usize) -> Option<NonNull<u8>> {
                None
            }
            unsafe fn free_pages(&self, _ptr: NonNull<u8>, _size: usize) {}
        }

        let mut backend = PageBackend::new(Arc::new(FailingAllocator));
        let err = backend.allocate_normal_page().unwrap_err();
        assert!(matches!(err, HeapError::OutOfMemory { size } if size == PAGE_SIZE));
    }
}
