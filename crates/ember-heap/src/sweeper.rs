//! Sweeping.
//!
//! The sweeper walks every page after a marking pass, coalesces dead objects
//! and existing free slots into free-list entries, unmarks survivors, and
//! returns fully empty pages to the backend. An atomic sweep does all of
//! this inline; an incremental sweep queues the spaces and drains them lazily
//! on allocation or when explicitly finished.

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::backend::PageBackend;
use crate::config::SweepingType;
use crate::heap::page::{HeapObjectHeader, LargePage, NormalPage, PAGE_SIZE};
use crate::heap::space::{RawHeap, NORMAL_SPACE_COUNT};
use crate::stats::StatsCollector;

/// How custom compactable spaces are treated by a sweep.
///
/// This heap layout has no compactable spaces, so both values currently sweep
/// the same set; the knob is part of the sweep contract for embedders that
/// add them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactableSpaceHandling {
    /// Sweep compactable spaces like any other.
    Sweep,
    /// Leave compactable spaces to the compactor.
    Ignore,
}

/// Per-sweep configuration.
#[derive(Debug, Clone, Copy)]
pub struct SweepingConfig {
    /// Synchronous or lazily drained sweep.
    pub sweeping_type: SweepingType,
    /// Treatment of compactable spaces.
    pub compactable_space_handling: CompactableSpaceHandling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SpaceId {
    Normal(usize),
    Large,
}

enum SweeperState {
    Idle,
    InProgress { remaining: VecDeque<SpaceId> },
    DonePending,
}

/// Reclaim unmarked objects after marking.
pub struct Sweeper {
    stats: Rc<StatsCollector>,
    state: SweeperState,
}

impl Sweeper {
    pub(crate) fn new(stats: Rc<StatsCollector>) -> Self {
        Self {
            stats,
            state: SweeperState::Idle,
        }
    }

    /// Whether a sweep has been started and not yet fully drained.
    pub fn is_in_progress(&self) -> bool {
        matches!(self.state, SweeperState::InProgress { .. })
    }

    /// Start a sweep over every space. Fatal if one is already running.
    pub(crate) fn start(
        &mut self,
        raw_heap: &mut RawHeap,
        backend: &mut PageBackend,
        config: SweepingConfig,
    ) {
        assert!(
            matches!(self.state, SweeperState::Idle),
            "sweep started while a sweep is in progress"
        );
        let _ = config.compactable_space_handling;

        let mut remaining: VecDeque<SpaceId> =
            (0..NORMAL_SPACE_COUNT).map(SpaceId::Normal).collect();
        remaining.push_back(SpaceId::Large);

        match config.sweeping_type {
            SweepingType::Atomic => {
                while let Some(space) = remaining.pop_front() {
                    sweep_space(raw_heap, backend, &self.stats, space);
                }
                self.state = SweeperState::DonePending;
            }
            SweepingType::Incremental => {
                self.state = SweeperState::InProgress { remaining };
            }
        }
    }

    /// Sweep `space` now if it is still queued. Used by the allocator to
    /// lazily reclaim memory in the size class it is about to allocate from.
    pub(crate) fn ensure_swept(
        &mut self,
        raw_heap: &mut RawHeap,
        backend: &mut PageBackend,
        space: SpaceId,
    ) {
        if let SweeperState::InProgress { remaining } = &mut self.state {
            if let Some(position) = remaining.iter().position(|queued| *queued == space) {
                remaining.remove(position);
                let drained = remaining.is_empty();
                sweep_space(raw_heap, backend, &self.stats, space);
                if drained {
                    self.state = SweeperState::DonePending;
                }
            }
        }
    }

    /// Drain any in-progress sweep synchronously and close the cycle.
    pub(crate) fn finish_if_running(&mut self, raw_heap: &mut RawHeap, backend: &mut PageBackend) {
        match std::mem::replace(&mut self.state, SweeperState::Idle) {
            SweeperState::Idle => {}
            SweeperState::InProgress { mut remaining } => {
                while let Some(space) = remaining.pop_front() {
                    sweep_space(raw_heap, backend, &self.stats, space);
                }
                self.stats.notify_sweeping_completed();
            }
            SweeperState::DonePending => {
                self.stats.notify_sweeping_completed();
            }
        }
    }

    /// Close the cycle's bookkeeping if the sweep itself already ran to
    /// completion. No-op while work is still queued.
    pub(crate) fn notify_done_if_needed(&mut self) {
        if matches!(self.state, SweeperState::DonePending) {
            self.state = SweeperState::Idle;
            self.stats.notify_sweeping_completed();
        }
    }
}

fn sweep_space(
    raw_heap: &mut RawHeap,
    backend: &mut PageBackend,
    stats: &StatsCollector,
    space: SpaceId,
) {
    match space {
        SpaceId::Normal(index) => sweep_normal_space(raw_heap, backend, stats, index),
        SpaceId::Large => sweep_large_space(raw_heap, backend, stats),
    }
}

fn sweep_normal_space(
    raw_heap: &mut RawHeap,
    backend: &mut PageBackend,
    stats: &StatsCollector,
    index: usize,
) {
    let space = raw_heap.normal_space_mut(index);
    // The LAB span carries no headers; fold it back into the free list so
    // the page walk below sees wall-to-wall headers.
    space.reset_linear_allocation_buffer();
    space.free_list_mut().clear();

    let pages: Vec<NormalPage> = space.pages_mut().drain(..).collect();
    for page in pages {
        let mut free_runs: Vec<(NonNull<u8>, usize)> = Vec::new();
        let mut live_bytes = 0usize;
        let mut run_start: Option<*mut u8> = None;
        let mut current = page.payload_start();
        let end = page.payload_end();

        while current < end {
            // SAFETY: with the LAB reset, every byte of the payload is
            // covered by back-to-back headers.
            let header = unsafe { &mut *(current as *mut HeapObjectHeader) };
            let size = header.size();
            debug_assert!(size > 0, "corrupt header during sweep");

            if header.is_free() || !header.is_marked() {
                if run_start.is_none() {
                    run_start = Some(current);
                }
            } else {
                if let Some(start) = run_start.take() {
                    let run_size = current as usize - start as usize;
                    // SAFETY: start came from the walk above.
                    free_runs.push((unsafe { NonNull::new_unchecked(start) }, run_size));
                }
                header.set_marked(false);
                live_bytes += size;
            }
            current = current.wrapping_add(size);
        }

        if live_bytes == 0 {
            stats.notify_freed_memory(PAGE_SIZE);
            backend.free_normal_page(page);
            continue;
        }

        if let Some(start) = run_start.take() {
            let run_size = end as usize - start as usize;
            // SAFETY: as above.
            free_runs.push((unsafe { NonNull::new_unchecked(start) }, run_size));
        }

        let space = raw_heap.normal_space_mut(index);
        for (start, run_size) in free_runs {
            // SAFETY: the run lies inside a retained page we own.
            unsafe { HeapObjectHeader::write_free(start.as_ptr(), run_size) };
            space.free_list_mut().add(start, run_size);
        }
        space.add_page(page);
    }
}

fn sweep_large_space(raw_heap: &mut RawHeap, backend: &mut PageBackend, stats: &StatsCollector) {
    let pages: Vec<LargePage> = raw_heap.large_space_mut().pages_mut().drain(..).collect();
    for mut page in pages {
        if page.header().is_marked() {
            page.header_mut().set_marked(false);
            raw_heap.large_space_mut().add_page(page);
        } else {
            stats.notify_freed_memory(page.reserved_size());
            backend.free_large_page(page);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::ObjectAllocator;
    use crate::config::{CollectionType, GcReason};
    use crate::platform::{FatalOutOfMemoryHandler, SystemPageAllocator};
    use crate::prefinalizer::PreFinalizerHandler;
    use std::sync::Arc;

    fn fixture() -> (ObjectAllocator, Sweeper, Rc<StatsCollector>) {
        let stats = Rc::new(StatsCollector::new());
        let allocator = ObjectAllocator::new(
            PageBackend::new(Arc::new(SystemPageAllocator)),
            stats.clone(),
            Rc::new(PreFinalizerHandler::new()),
            Arc::new(FatalOutOfMemoryHandler::new()),
        );
        let sweeper = Sweeper::new(stats.clone());
        (allocator, sweeper, stats)
    }

    fn atomic_config() -> SweepingConfig {
        SweepingConfig {
            sweeping_type: SweepingType::Atomic,
            compactable_space_handling: CompactableSpaceHandling::Sweep,
        }
    }

    fn open_cycle(stats: &StatsCollector) {
        stats.notify_marking_started(CollectionType::Major, GcReason::Requested);
        stats.notify_marking_completed(0);
    }

    #[test]
    fn atomic_sweep_frees_unmarked_pages() {
        let (mut allocator, mut sweeper, stats) = fixture();
        allocator.allocate(32);
        assert_eq!(stats.allocated_memory_size(), PAGE_SIZE);

        open_cycle(&stats);
        let (raw_heap, backend) = allocator.heap_and_backend();
        sweeper.start(raw_heap, backend, atomic_config());
        sweeper.notify_done_if_needed();

        assert_eq!(stats.allocated_memory_size(), 0);
        assert!(allocator.raw_heap().normal_spaces().iter().all(|s| s.page_count() == 0));
    }

    #[test]
    fn marked_objects_survive_and_are_unmarked() {
        let (mut allocator, mut sweeper, stats) = fixture();
        let keep = allocator.allocate(32);
        allocator.allocate(32);

        unsafe { HeapObjectHeader::from_payload(keep.as_ptr()) }.set_marked(true);

        open_cycle(&stats);
        let (raw_heap, backend) = allocator.heap_and_backend();
        sweeper.start(raw_heap, backend, atomic_config());
        sweeper.notify_done_if_needed();

        let header = unsafe { HeapObjectHeader::from_payload(keep.as_ptr()) };
        assert!(!header.is_free());
        assert!(!header.is_marked());

        // The dead neighbor's bytes are back on a free list.
        let free_total: usize = allocator
            .raw_heap()
            .normal_spaces()
            .iter()
            .map(|s| s.free_list().total_size())
            .sum();
        assert!(free_total > 0);
    }

    #[test]
    fn unmarked_large_pages_are_released() {
        let (mut allocator, mut sweeper, stats) = fixture();
        allocator.allocate(crate::heap::page::LARGE_OBJECT_THRESHOLD + 8);
        assert_eq!(allocator.raw_heap().large_space().page_count(), 1);

        open_cycle(&stats);
        let (raw_heap, backend) = allocator.heap_and_backend();
        sweeper.start(raw_heap, backend, atomic_config());
        sweeper.notify_done_if_needed();

        assert_eq!(allocator.raw_heap().large_space().page_count(), 0);
        assert_eq!(stats.allocated_memory_size(), 0);
    }

    #[test]
    fn incremental_sweep_drains_on_finish() {
        let (mut allocator, mut sweeper, stats) = fixture();
        allocator.allocate(32);

        open_cycle(&stats);
        let config = SweepingConfig {
            sweeping_type: SweepingType::Incremental,
            compactable_space_handling: CompactableSpaceHandling::Sweep,
        };
        {
            let (raw_heap, backend) = allocator.heap_and_backend();
            sweeper.start(raw_heap, backend, config);
        }
        assert!(sweeper.is_in_progress());
        // Nothing reclaimed yet.
        assert_eq!(stats.allocated_memory_size(), PAGE_SIZE);

        let (raw_heap, backend) = allocator.heap_and_backend();
        sweeper.finish_if_running(raw_heap, backend);
        assert!(!sweeper.is_in_progress());
        assert_eq!(stats.allocated_memory_size(), 0);
    }

    #[test]
    fn ensure_swept_reclaims_a_single_space() {
        let (mut allocator, mut sweeper, stats) = fixture();
        let payload = allocator.allocate(32);
        let total = crate::heap::page::HEADER_SIZE + 32;
        let index = crate::heap::space::normal_space_index(total);
        let _ = payload;

        open_cycle(&stats);
        let config = SweepingConfig {
            sweeping_type: SweepingType::Incremental,
            compactable_space_handling: CompactableSpaceHandling::Sweep,
        };
        {
            let (raw_heap, backend) = allocator.heap_and_backend();
            sweeper.start(raw_heap, backend, config);
        }

        let (raw_heap, backend) = allocator.heap_and_backend();
        sweeper.ensure_swept(raw_heap, backend, SpaceId::Normal(index));
        assert_eq!(allocator.raw_heap().normal_spaces()[index].page_count(), 0);
        // Other spaces are still queued.
        assert!(sweeper.is_in_progress());

        let (raw_heap, backend) = allocator.heap_and_backend();
        sweeper.finish_if_running(raw_heap, backend);
    }
}
