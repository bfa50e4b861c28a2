//! Statistics collection.
//!
//! The collector keeps cheap running counters updated by allocation and page
//! notifications, fans them out to registered observers, and tracks the
//! marking/sweeping state machine that every collection cycle must bracket —
//! including the degenerate forced cycles the termination protocol runs.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::{CollectionType, GcReason};
use crate::heap::page::{LargePage, NormalPage, ObjectView, PAGE_SIZE};
use crate::heap::space::{LargePageSpace, NormalPageSpace, RawHeap};
use crate::heap::visitor::HeapVisitor;

/// Reporting detail for [`Heap::collect_statistics`](crate::Heap::collect_statistics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailLevel {
    /// Running counters only; O(1) and non-blocking.
    Brief,
    /// Full per-space/per-page breakdown; forces sweep completion and a heap
    /// traversal.
    Detailed,
}

/// Per-page entry of a detailed snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageStatistics {
    /// Bytes committed for this page.
    pub committed_size_bytes: usize,
    /// Bytes resident for this page.
    pub resident_size_bytes: usize,
    /// Bytes occupied by live objects, headers included.
    pub used_size_bytes: usize,
}

/// Per-space entry of a detailed snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceStatistics {
    /// Stable space name, see [`SpaceKind::name`](crate::heap::space::SpaceKind::name).
    pub name: &'static str,
    /// Bytes committed for this space.
    pub committed_size_bytes: usize,
    /// Bytes resident for this space.
    pub resident_size_bytes: usize,
    /// Bytes occupied by live objects in this space.
    pub used_size_bytes: usize,
    /// Bytes sitting on this space's free list.
    pub free_list_size_bytes: usize,
    /// Per-page breakdown.
    pub page_stats: Vec<PageStatistics>,
}

/// Immutable statistics snapshot.
///
/// Brief snapshots carry empty `space_stats`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStatistics {
    /// Bytes committed by the page backend.
    pub committed_size_bytes: usize,
    /// Bytes resident in memory.
    pub resident_size_bytes: usize,
    /// Bytes attributed to live objects.
    pub used_size_bytes: usize,
    /// The detail level this snapshot was taken at.
    pub detail_level: DetailLevel,
    /// Per-space breakdown; empty at brief detail.
    pub space_stats: Vec<SpaceStatistics>,
}

/// Observer of allocation activity. All methods default to no-ops; there is
/// no ordering guarantee between observers.
pub trait AllocationObserver {
    /// The live-object byte estimate grew by `bytes`.
    fn allocated_object_size_increased(&self, bytes: usize) {
        let _ = bytes;
    }

    /// A marking pass completed and rebased the live-object byte estimate.
    fn reset_allocated_object_size(&self, marked_bytes: usize) {
        let _ = marked_bytes;
    }

    /// The committed page memory changed to `committed_bytes`.
    fn allocated_size_changed(&self, committed_bytes: usize) {
        let _ = committed_bytes;
    }
}

static PROCESS_ALLOCATED_OBJECT_SIZE: AtomicUsize = AtomicUsize::new(0);
static PROCESS_ALLOCATED_SPACE: AtomicUsize = AtomicUsize::new(0);

/// Counters aggregated across every heap in the process.
///
/// Values are approximate under concurrent mutation; each heap folds its own
/// deltas in through a registered [`AllocationObserver`].
pub struct ProcessHeapStatistics;

impl ProcessHeapStatistics {
    /// Live object bytes across all heaps.
    pub fn total_allocated_object_size() -> usize {
        PROCESS_ALLOCATED_OBJECT_SIZE.load(Ordering::Relaxed)
    }

    /// Committed page bytes across all heaps.
    pub fn total_allocated_space() -> usize {
        PROCESS_ALLOCATED_SPACE.load(Ordering::Relaxed)
    }
}

/// Forward one heap's allocation activity into [`ProcessHeapStatistics`].
pub(crate) struct ProcessHeapStatisticsUpdater {
    object_size_baseline: Cell<usize>,
    committed_baseline: Cell<usize>,
}

impl ProcessHeapStatisticsUpdater {
    pub(crate) fn new() -> Self {
        Self {
            object_size_baseline: Cell::new(0),
            committed_baseline: Cell::new(0),
        }
    }
}

impl Drop for ProcessHeapStatisticsUpdater {
    fn drop(&mut self) {
        PROCESS_ALLOCATED_OBJECT_SIZE.fetch_sub(self.object_size_baseline.get(), Ordering::Relaxed);
        PROCESS_ALLOCATED_SPACE.fetch_sub(self.committed_baseline.get(), Ordering::Relaxed);
    }
}

impl AllocationObserver for ProcessHeapStatisticsUpdater {
    fn allocated_object_size_increased(&self, bytes: usize) {
        self.object_size_baseline
            .set(self.object_size_baseline.get() + bytes);
        PROCESS_ALLOCATED_OBJECT_SIZE.fetch_add(bytes, Ordering::Relaxed);
    }

    fn reset_allocated_object_size(&self, marked_bytes: usize) {
        let previous = self.object_size_baseline.replace(marked_bytes);
        PROCESS_ALLOCATED_OBJECT_SIZE.fetch_sub(previous, Ordering::Relaxed);
        PROCESS_ALLOCATED_OBJECT_SIZE.fetch_add(marked_bytes, Ordering::Relaxed);
    }

    fn allocated_size_changed(&self, committed_bytes: usize) {
        let previous = self.committed_baseline.replace(committed_bytes);
        if committed_bytes >= previous {
            PROCESS_ALLOCATED_SPACE.fetch_add(committed_bytes - previous, Ordering::Relaxed);
        } else {
            PROCESS_ALLOCATED_SPACE.fetch_sub(previous - committed_bytes, Ordering::Relaxed);
        }
    }
}

/// Collection-cycle phase as seen by the statistics collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GcState {
    NotRunning,
    Marking,
    Sweeping,
}

/// Aggregate allocation and collection counters for one heap.
pub struct StatsCollector {
    allocated_object_size: Cell<usize>,
    committed_memory: Cell<usize>,
    resident_memory: Cell<usize>,
    state: Cell<GcState>,
    current_cycle_is_forced: Cell<bool>,
    collection_count: Cell<usize>,
    forced_collection_count: Cell<usize>,
    observers: RefCell<Vec<Rc<dyn AllocationObserver>>>,
}

impl StatsCollector {
    pub(crate) fn new() -> Self {
        Self {
            allocated_object_size: Cell::new(0),
            committed_memory: Cell::new(0),
            resident_memory: Cell::new(0),
            state: Cell::new(GcState::NotRunning),
            current_cycle_is_forced: Cell::new(false),
            collection_count: Cell::new(0),
            forced_collection_count: Cell::new(0),
            observers: RefCell::new(Vec::new()),
        }
    }

    /// Register an observer. Observers must not mutate the collector from
    /// inside a notification.
    pub fn register_observer(&self, observer: Rc<dyn AllocationObserver>) {
        self.observers.borrow_mut().push(observer);
    }

    /// Unregister a previously registered observer.
    pub fn unregister_observer(&self, observer: &Rc<dyn AllocationObserver>) {
        self.observers
            .borrow_mut()
            .retain(|o| !Rc::ptr_eq(o, observer));
    }

    fn snapshot_observers(&self) -> Vec<Rc<dyn AllocationObserver>> {
        self.observers.borrow().clone()
    }

    /// Running estimate of live object bytes: bytes marked by the last
    /// completed marking pass plus everything allocated since.
    pub fn allocated_object_size(&self) -> usize {
        self.allocated_object_size.get()
    }

    /// Bytes currently committed by the page backend.
    pub fn allocated_memory_size(&self) -> usize {
        self.committed_memory.get()
    }

    /// Bytes currently resident. Matches committed memory until pages are
    /// discommitted, which this backend does not do.
    pub fn resident_memory_size(&self) -> usize {
        self.resident_memory.get()
    }

    /// Completed collection cycles, excluding forced (termination) cycles so
    /// the externally visible total stays meaningful.
    pub fn collection_count(&self) -> usize {
        self.collection_count.get()
    }

    /// Completed forced cycles, i.e. the termination protocol's.
    pub fn forced_collection_count(&self) -> usize {
        self.forced_collection_count.get()
    }

    pub(crate) fn notify_allocation(&self, bytes: usize) {
        self.allocated_object_size
            .set(self.allocated_object_size.get() + bytes);
        for observer in self.snapshot_observers() {
            observer.allocated_object_size_increased(bytes);
        }
    }

    pub(crate) fn notify_allocated_memory(&self, bytes: usize) {
        self.committed_memory.set(self.committed_memory.get() + bytes);
        self.resident_memory.set(self.resident_memory.get() + bytes);
        let committed = self.committed_memory.get();
        for observer in self.snapshot_observers() {
            observer.allocated_size_changed(committed);
        }
    }

    pub(crate) fn notify_freed_memory(&self, bytes: usize) {
        self.committed_memory.set(self.committed_memory.get() - bytes);
        self.resident_memory.set(self.resident_memory.get() - bytes);
        let committed = self.committed_memory.get();
        for observer in self.snapshot_observers() {
            observer.allocated_size_changed(committed);
        }
    }

    /// Open a collection cycle. Fatal if a cycle is already in progress.
    pub fn notify_marking_started(&self, collection_type: CollectionType, reason: GcReason) {
        assert_eq!(
            self.state.get(),
            GcState::NotRunning,
            "marking started while a collection cycle is in progress"
        );
        let _ = collection_type;
        self.current_cycle_is_forced
            .set(reason == GcReason::Forced);
        self.state.set(GcState::Marking);
    }

    /// Close the marking phase: the live-object estimate is rebased to the
    /// marked byte count and sweeping is expected next.
    pub fn notify_marking_completed(&self, marked_bytes: usize) {
        assert_eq!(
            self.state.get(),
            GcState::Marking,
            "marking completed without a marking phase"
        );
        self.allocated_object_size.set(marked_bytes);
        self.state.set(GcState::Sweeping);
        if self.current_cycle_is_forced.get() {
            self.forced_collection_count
                .set(self.forced_collection_count.get() + 1);
        } else {
            self.collection_count.set(self.collection_count.get() + 1);
        }
        for observer in self.snapshot_observers() {
            observer.reset_allocated_object_size(marked_bytes);
        }
    }

    /// Close the cycle once the sweeper's work is exhausted.
    pub fn notify_sweeping_completed(&self) {
        assert_eq!(
            self.state.get(),
            GcState::Sweeping,
            "sweeping completed without a sweeping phase"
        );
        self.state.set(GcState::NotRunning);
    }
}

/// Build the detailed snapshot by traversing the raw heap.
///
/// The caller must have finished any in-flight sweep and reset all linear
/// allocation buffers, so free memory is fully attributed to free lists.
pub(crate) fn collect_detailed_statistics(raw_heap: &RawHeap) -> HeapStatistics {
    struct Builder {
        spaces: Vec<SpaceStatistics>,
        current_page_used: usize,
    }

    impl Builder {
        fn current_space(&mut self) -> &mut SpaceStatistics {
            self.spaces.last_mut().expect("space pushed before pages")
        }

        fn finish_page(&mut self, committed: usize) {
            let used = self.current_page_used;
            self.current_page_used = 0;
            let space = self.current_space();
            space.committed_size_bytes += committed;
            space.resident_size_bytes += committed;
            space.used_size_bytes += used;
            space.page_stats.push(PageStatistics {
                committed_size_bytes: committed,
                resident_size_bytes: committed,
                used_size_bytes: used,
            });
        }
    }

    impl HeapVisitor for Builder {
        fn visit_normal_space(&mut self, space: &NormalPageSpace) -> bool {
            debug_assert_eq!(space.linear_allocation_buffer_size(), 0);
            self.spaces.push(SpaceStatistics {
                name: space.kind().name(),
                committed_size_bytes: 0,
                resident_size_bytes: 0,
                used_size_bytes: 0,
                free_list_size_bytes: space.free_list().total_size(),
                page_stats: Vec::new(),
            });
            true
        }

        fn visit_large_space(&mut self, space: &LargePageSpace) -> bool {
            let _ = space;
            self.spaces.push(SpaceStatistics {
                name: crate::heap::space::SpaceKind::Large.name(),
                committed_size_bytes: 0,
                resident_size_bytes: 0,
                used_size_bytes: 0,
                free_list_size_bytes: 0,
                page_stats: Vec::new(),
            });
            true
        }

        fn visit_normal_page(&mut self, page: &NormalPage) -> bool {
            let _ = page;
            // Headers are visited next; the page entry is closed by the
            // traversal order below.
            true
        }

        fn visit_large_page(&mut self, _page: &LargePage) -> bool {
            true
        }

        fn visit_header(&mut self, object: ObjectView<'_>) {
            if !object.header().is_free() {
                self.current_page_used += object.size();
            }
        }
    }

    // The generic traversal has no page-exit hook, so pages are accumulated
    // manually space by space.
    let mut snapshot = HeapStatistics {
        committed_size_bytes: 0,
        resident_size_bytes: 0,
        used_size_bytes: 0,
        detail_level: DetailLevel::Detailed,
        space_stats: Vec::new(),
    };

    for space in raw_heap.normal_spaces() {
        let mut builder = Builder {
            spaces: Vec::new(),
            current_page_used: 0,
        };
        builder.visit_normal_space(space);
        for page in space.pages() {
            page.for_each_header(space.lab_span_on(page), |header| {
                builder.visit_header(ObjectView::normal(header));
            });
            builder.finish_page(PAGE_SIZE);
        }
        snapshot.space_stats.extend(builder.spaces);
    }

    {
        let mut builder = Builder {
            spaces: Vec::new(),
            current_page_used: 0,
        };
        builder.visit_large_space(raw_heap.large_space());
        for page in raw_heap.large_space().pages() {
            builder.visit_header(ObjectView::large(page.header(), page.object_size()));
            builder.finish_page(page.reserved_size());
        }
        snapshot.space_stats.extend(builder.spaces);
    }

    for space in &snapshot.space_stats {
        snapshot.committed_size_bytes += space.committed_size_bytes;
        snapshot.resident_size_bytes += space.resident_size_bytes;
        snapshot.used_size_bytes += space.used_size_bytes;
    }

    snapshot
}
