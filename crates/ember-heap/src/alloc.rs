//! Object allocation.
//!
//! The allocator owns the raw heap and its page backend. Normal-sized
//! allocations bump through per-size-class linear allocation buffers; buffer
//! refills come from the space's free list or, failing that, a fresh page.
//! Oversized allocations get a large page of their own.

use std::cell::Cell;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::Arc;

use crate::backend::PageBackend;
use crate::heap::page::{
    checked_total_size, HeapObjectHeader, LargePage, NormalPage, HEADER_SIZE,
    LARGE_OBJECT_THRESHOLD, PAGE_SIZE,
};
use crate::heap::space::{normal_space_index, RawHeap};
use crate::heap::visitor::AllLabsAreEmpty;
use crate::platform::FatalOutOfMemoryHandler;
use crate::prefinalizer::PreFinalizerHandler;
use crate::stats::StatsCollector;
use crate::HeapError;

/// Allocate managed objects out of the raw heap.
///
/// Out-of-memory from the page backend is routed to the fatal handler and
/// does not return. Allocation is forbidden inside prefinalizers unless the
/// heap was built with that explicitly allowed, and forever after
/// termination.
pub struct ObjectAllocator {
    raw_heap: RawHeap,
    backend: PageBackend,
    stats: Rc<StatsCollector>,
    prefinalizers: Rc<PreFinalizerHandler>,
    oom_handler: Arc<FatalOutOfMemoryHandler>,
    no_allocation_count: Cell<usize>,
    terminated: bool,
}

impl ObjectAllocator {
    pub(crate) fn new(
        backend: PageBackend,
        stats: Rc<StatsCollector>,
        prefinalizers: Rc<PreFinalizerHandler>,
        oom_handler: Arc<FatalOutOfMemoryHandler>,
    ) -> Self {
        Self {
            raw_heap: RawHeap::new(),
            backend,
            stats,
            prefinalizers,
            oom_handler,
            no_allocation_count: Cell::new(0),
            terminated: false,
        }
    }

    pub(crate) fn raw_heap(&self) -> &RawHeap {
        &self.raw_heap
    }

    /// Split borrow for the sweeper, which walks the raw heap while
    /// releasing empty pages through the backend.
    pub(crate) fn heap_and_backend(&mut self) -> (&mut RawHeap, &mut PageBackend) {
        (&mut self.raw_heap, &mut self.backend)
    }

    pub(crate) fn enter_no_allocation_scope(&self) {
        self.no_allocation_count.set(self.no_allocation_count.get() + 1);
    }

    pub(crate) fn exit_no_allocation_scope(&self) {
        let count = self.no_allocation_count.get();
        debug_assert!(count > 0);
        self.no_allocation_count.set(count - 1);
    }

    /// Allocate `payload_size` bytes of object payload and return a pointer
    /// to it. The returned memory is header-prefixed, granularity-aligned and
    /// unmarked.
    pub fn allocate(&mut self, payload_size: usize) -> NonNull<u8> {
        assert!(!self.terminated, "allocation on a terminated heap");
        assert_eq!(
            self.no_allocation_count.get(),
            0,
            "allocation while allocations are disallowed"
        );

        let total = match checked_total_size(payload_size) {
            Some(total) => total,
            None => {
                let err = HeapError::ObjectTooLarge { size: payload_size };
                self.oom_handler.fatal(&err.to_string())
            }
        };
        let payload = if total > LARGE_OBJECT_THRESHOLD {
            self.allocate_large(total)
        } else {
            self.allocate_normal(total)
        };

        self.stats.notify_allocation(total);
        if self.prefinalizers.is_invoking() {
            self.prefinalizers.notify_allocation(total);
        }
        payload
    }

    fn allocate_normal(&mut self, total: usize) -> NonNull<u8> {
        let index = normal_space_index(total);
        if let Some(at) = self.raw_heap.normal_space_mut(index).lab_mut().allocate(total) {
            return finish_object(at, total);
        }

        self.refill_lab(index, total);
        match self.raw_heap.normal_space_mut(index).lab_mut().allocate(total) {
            Some(at) => finish_object(at, total),
            None => unreachable!("refilled linear allocation buffer is too small"),
        }
    }

    /// Points the space's LAB at a span of at least `total` free bytes,
    /// taking the remainder of the old buffer back onto the free list first.
    fn refill_lab(&mut self, index: usize, total: usize) {
        let space = self.raw_heap.normal_space_mut(index);
        space.reset_linear_allocation_buffer();

        if let Some(entry) = space.free_list_mut().take(total) {
            space.lab_mut().set(entry.ptr, entry.size);
            return;
        }

        let page = match self.backend.allocate_normal_page() {
            Ok(page) => page,
            Err(err) => self.oom_handler.fatal(&err.to_string()),
        };
        self.stats.notify_allocated_memory(PAGE_SIZE);
        let start = page.payload_start();
        let space = self.raw_heap.normal_space_mut(index);
        space.add_page(page);
        // SAFETY: the fresh page's payload is exclusively ours.
        space
            .lab_mut()
            .set(unsafe { NonNull::new_unchecked(start) }, PAGE_SIZE);
    }

    fn allocate_large(&mut self, total: usize) -> NonNull<u8> {
        let page = match self.backend.allocate_large_page(total) {
            Ok(page) => page,
            Err(err) => self.oom_handler.fatal(&err.to_string()),
        };
        self.stats.notify_allocated_memory(page.reserved_size());

        let at = page.memory().as_ptr();
        // SAFETY: the page base is ours; large objects encode size zero and
        // carry their true size on the page.
        unsafe { HeapObjectHeader::write_object(at, 0) };
        let payload = page.header().payload();
        self.raw_heap.large_space_mut().add_page(page);
        // SAFETY: payload points HEADER_SIZE bytes into a live reservation.
        unsafe { NonNull::new_unchecked(payload) }
    }

    /// Abandon every space's linear allocation buffer, returning the unused
    /// spans to their free lists.
    pub(crate) fn reset_linear_allocation_buffers(&mut self) {
        for space in self.raw_heap.normal_spaces_mut() {
            space.reset_linear_allocation_buffer();
        }
        debug_assert!(AllLabsAreEmpty::check(&self.raw_heap));
    }

    /// Release every page and refuse all further allocation. Called once,
    /// at the end of heap termination.
    pub(crate) fn terminate(&mut self) {
        assert!(!self.terminated, "allocator terminated twice");
        self.reset_linear_allocation_buffers();
        self.release_all_pages();
        self.terminated = true;
    }

    fn release_all_pages(&mut self) {
        for space in self.raw_heap.normal_spaces_mut() {
            space.reset_linear_allocation_buffer();
            space.free_list_mut().clear();
            for page in space.pages_mut().drain(..).collect::<Vec<NormalPage>>() {
                self.stats.notify_freed_memory(PAGE_SIZE);
                self.backend.free_normal_page(page);
            }
        }
        for page in self
            .raw_heap
            .large_space_mut()
            .pages_mut()
            .drain(..)
            .collect::<Vec<LargePage>>()
        {
            self.stats.notify_freed_memory(page.reserved_size());
            self.backend.free_large_page(page);
        }
    }
}

impl Drop for ObjectAllocator {
    fn drop(&mut self) {
        if !self.terminated {
            self.release_all_pages();
        }
    }
}

fn finish_object(at: NonNull<u8>, total: usize) -> NonNull<u8> {
    // SAFETY: `at` spans `total` bytes handed out by the LAB.
    unsafe {
        HeapObjectHeader::write_object(at.as_ptr(), total);
        NonNull::new_unchecked(at.as_ptr().add(HEADER_SIZE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::SystemPageAllocator;

    fn allocator() -> ObjectAllocator {
        ObjectAllocator::new(
            PageBackend::new(Arc::new(SystemPageAllocator)),
            Rc::new(StatsCollector::new()),
            Rc::new(PreFinalizerHandler::new()),
            Arc::new(FatalOutOfMemoryHandler::new()),
        )
    }

    #[test]
    fn small_allocations_share_a_page() {
        let mut allocator = allocator();
        let a = allocator.allocate(16);
        let b = allocator.allocate(16);

        let distance = (b.as_ptr() as usize) - (a.as_ptr() as usize);
        assert_eq!(distance, HEADER_SIZE + 16);

        let index = normal_space_index(HEADER_SIZE + 16);
        assert_eq!(allocator.raw_heap().normal_spaces()[index].page_count(), 1);
    }

    #[test]
    fn size_classes_route_to_distinct_spaces() {
        let mut allocator = allocator();
        allocator.allocate(8);
        allocator.allocate(200);

        let spaces = allocator.raw_heap().normal_spaces();
        let populated = spaces.iter().filter(|s| s.page_count() > 0).count();
        assert_eq!(populated, 2);
    }

    #[test]
    fn oversized_allocations_get_a_large_page() {
        let mut allocator = allocator();
        allocator.allocate(LARGE_OBJECT_THRESHOLD + 1);

        assert_eq!(allocator.raw_heap().large_space().page_count(), 1);
        let page = &allocator.raw_heap().large_space().pages()[0];
        assert_eq!(page.header().size(), 0);
        assert!(page.object_size() > LARGE_OBJECT_THRESHOLD);
    }

    #[test]
    fn header_size_matches_allocation() {
        let mut allocator = allocator();
        let payload = allocator.allocate(24);

        let header = unsafe { HeapObjectHeader::from_payload(payload.as_ptr()) };
        assert_eq!(header.size(), HEADER_SIZE + 24);
        assert!(!header.is_free());
    }

    #[test]
    fn reset_returns_lab_to_free_list() {
        let mut allocator = allocator();
        allocator.allocate(16);
        let index = normal_space_index(HEADER_SIZE + 16);
        assert!(allocator.raw_heap().normal_spaces()[index].linear_allocation_buffer_size() > 0);

        allocator.reset_linear_allocation_buffers();
        let space = &allocator.raw_heap().normal_spaces()[index];
        assert_eq!(space.linear_allocation_buffer_size(), 0);
        assert!(space.free_list().total_size() > 0);
    }

    #[test]
    #[should_panic(expected = "fatal process out of memory")]
    fn unrepresentable_allocation_size_is_fatal_oom() {
        let mut allocator = allocator();
        allocator.allocate(usize::MAX);
    }

    #[test]
    #[should_panic(expected = "fatal process out of memory")]
    fn allocation_above_encodable_size_is_fatal_oom() {
        let mut allocator = allocator();
        allocator.allocate(u32::MAX as usize);
    }

    #[test]
    #[should_panic(expected = "allocation on a terminated heap")]
    fn allocation_after_terminate_is_fatal() {
        let mut allocator = allocator();
        allocator.terminate();
        allocator.allocate(8);
    }

    #[test]
    #[should_panic(expected = "allocations are disallowed")]
    fn allocation_in_no_allocation_scope_is_fatal() {
        let mut allocator = allocator();
        allocator.enter_no_allocation_scope();
        allocator.allocate(8);
    }

    #[test]
    fn stats_track_object_and_page_bytes() {
        let stats = Rc::new(StatsCollector::new());
        let mut allocator = ObjectAllocator::new(
            PageBackend::new(Arc::new(SystemPageAllocator)),
            stats.clone(),
            Rc::new(PreFinalizerHandler::new()),
            Arc::new(FatalOutOfMemoryHandler::new()),
        );

        allocator.allocate(64);
        assert_eq!(stats.allocated_object_size(), HEADER_SIZE + 64);
        assert_eq!(stats.allocated_memory_size(), PAGE_SIZE);

        allocator.terminate();
        assert_eq!(stats.allocated_memory_size(), 0);
    }
}
