//! The heap controller.
//!
//! [`Heap`] owns every subsystem: the object allocator (and through it the
//! raw heap and page backend), the sweeper, the statistics collector, the
//! prefinalizer handler, the four persistent root regions, and the optional
//! remembered set. A collection cycle is driven externally: the embedder
//! starts marking, runs its tracer, finishes marking, executes prefinalizers
//! and starts the sweep. Termination is the one controller-internal loop.

pub mod page;
pub mod space;
pub(crate) mod visitor;

use std::cell::Cell;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::Arc;

use crate::alloc::ObjectAllocator;
use crate::backend::PageBackend;
use crate::config::{
    CollectionType, GcReason, HeapOptions, PageAllocatorKind, SweepingType,
};
use crate::platform::{
    DefaultPlatform, FatalOutOfMemoryHandler, LeakCheckedPageAllocator, PageAllocator, Platform,
};
use crate::prefinalizer::{PreFinalizer, PreFinalizerHandler};
use crate::remembered::RememberedSet;
use crate::roots::{CrossThreadPersistentRegion, PersistentRegion, PersistentRegionLock};
use crate::stats::{
    collect_detailed_statistics, DetailLevel, HeapStatistics, ProcessHeapStatisticsUpdater,
    StatsCollector,
};
use crate::sweeper::{CompactableSpaceHandling, SpaceId, Sweeper, SweepingConfig};

use self::page::LARGE_OBJECT_THRESHOLD;
use self::space::{normal_space_index, RawHeap};
use self::visitor::{traverse, HeapVisitor};

/// Ceiling on collection cycles the termination protocol may run before the
/// root set is declared non-convergent.
pub const MAX_TERMINATION_GCS: usize = 20;

/// A managed heap.
pub struct Heap {
    options: HeapOptions,
    oom_handler: Arc<FatalOutOfMemoryHandler>,
    stats: Rc<StatsCollector>,
    prefinalizers: Rc<PreFinalizerHandler>,
    allocator: ObjectAllocator,
    sweeper: Sweeper,
    strong_persistent_region: Rc<PersistentRegion>,
    weak_persistent_region: Rc<PersistentRegion>,
    strong_cross_thread_region: Arc<CrossThreadPersistentRegion>,
    weak_cross_thread_region: Arc<CrossThreadPersistentRegion>,
    remembered_set: Option<RememberedSet>,
    disallow_gc_count: Rc<Cell<usize>>,
    no_gc_count: Rc<Cell<usize>>,
    marking_in_progress: bool,
    in_atomic_pause: bool,
}

impl Heap {
    /// Build a heap with default options.
    pub fn new() -> Self {
        Self::with_options(HeapOptions::default())
    }

    /// Build a heap from `options` on the default platform.
    pub fn with_options(options: HeapOptions) -> Self {
        Self::with_platform(&DefaultPlatform::new(), options)
    }

    /// Build a heap sourcing pages from `platform`.
    pub fn with_platform(platform: &dyn Platform, options: HeapOptions) -> Self {
        let base = platform.page_allocator();
        let page_allocator: Arc<dyn PageAllocator> = match options.page_allocator {
            PageAllocatorKind::System => base,
            PageAllocatorKind::LeakChecked => Arc::new(LeakCheckedPageAllocator::new(base)),
        };
        let oom_handler = Arc::new(FatalOutOfMemoryHandler::new());
        let stats = Rc::new(StatsCollector::new());
        stats.register_observer(Rc::new(ProcessHeapStatisticsUpdater::new()));
        let prefinalizers = Rc::new(PreFinalizerHandler::new());
        let allocator = ObjectAllocator::new(
            PageBackend::new(page_allocator),
            stats.clone(),
            prefinalizers.clone(),
            oom_handler.clone(),
        );
        let sweeper = Sweeper::new(stats.clone());
        let remembered_set = options.generational.then(RememberedSet::new);

        Self {
            options,
            oom_handler,
            stats,
            prefinalizers,
            allocator,
            sweeper,
            strong_persistent_region: Rc::new(PersistentRegion::new()),
            weak_persistent_region: Rc::new(PersistentRegion::new()),
            strong_cross_thread_region: Arc::new(CrossThreadPersistentRegion::new()),
            weak_cross_thread_region: Arc::new(CrossThreadPersistentRegion::new()),
            remembered_set,
            disallow_gc_count: Rc::new(Cell::new(0)),
            no_gc_count: Rc::new(Cell::new(0)),
            marking_in_progress: false,
            in_atomic_pause: false,
        }
    }

    /// The options this heap was built with.
    pub fn options(&self) -> &HeapOptions {
        &self.options
    }

    /// The statistics collector.
    pub fn stats(&self) -> &StatsCollector {
        &self.stats
    }

    /// The out-of-memory handler shared by every subsystem that reserves
    /// memory.
    pub fn oom_handler(&self) -> &Arc<FatalOutOfMemoryHandler> {
        &self.oom_handler
    }

    /// Same-thread strong root region.
    pub fn strong_persistent_region(&self) -> &PersistentRegion {
        &self.strong_persistent_region
    }

    /// Same-thread weak root region.
    pub fn weak_persistent_region(&self) -> &PersistentRegion {
        &self.weak_persistent_region
    }

    /// Cross-thread strong root region. Clone the `Arc` to register roots
    /// from other threads.
    pub fn strong_cross_thread_persistent_region(&self) -> &Arc<CrossThreadPersistentRegion> {
        &self.strong_cross_thread_region
    }

    /// Cross-thread weak root region.
    pub fn weak_cross_thread_persistent_region(&self) -> &Arc<CrossThreadPersistentRegion> {
        &self.weak_cross_thread_region
    }

    /// The remembered set, present only on generational heaps.
    pub fn remembered_set(&mut self) -> Option<&mut RememberedSet> {
        self.remembered_set.as_mut()
    }

    /// Whether a marking pass is active.
    pub fn is_marking(&self) -> bool {
        self.marking_in_progress
    }

    /// Whether the controller is inside an atomic pause.
    pub fn in_atomic_pause(&self) -> bool {
        self.in_atomic_pause
    }

    /// Register a prefinalizer, invoked between marking and sweeping in
    /// registration order.
    pub fn register_prefinalizer(&self, callback: PreFinalizer) {
        self.prefinalizers.register(callback);
    }

    /// Allocate `payload_size` bytes of managed payload.
    ///
    /// If an incremental sweep still owes the target space a pass, that
    /// space is swept first so free memory is reusable immediately.
    pub fn allocate(&mut self, payload_size: usize) -> NonNull<u8> {
        // Unrepresentable sizes fall through to the allocator, which reports
        // them as a fatal out-of-memory condition.
        if self.sweeper.is_in_progress() {
            if let Some(total) = page::checked_total_size(payload_size) {
                let space = if total > LARGE_OBJECT_THRESHOLD {
                    SpaceId::Large
                } else {
                    SpaceId::Normal(normal_space_index(total))
                };
                let (raw_heap, backend) = self.allocator.heap_and_backend();
                self.sweeper.ensure_swept(raw_heap, backend, space);
                self.sweeper.notify_done_if_needed();
            }
        }
        self.allocator.allocate(payload_size)
    }

    /// Sum the payload bytes of every live object on the heap.
    ///
    /// Free slots contribute nothing. Callers must not run this concurrently
    /// with a sweep; that discipline is not enforced here.
    pub fn object_payload_size(&self) -> usize {
        struct ObjectSizeCounter {
            total: usize,
        }
        impl HeapVisitor for ObjectSizeCounter {
            fn visit_header(&mut self, object: page::ObjectView<'_>) {
                if !object.header().is_free() {
                    self.total += object.payload_size();
                }
            }
        }

        let mut counter = ObjectSizeCounter { total: 0 };
        traverse(self.allocator.raw_heap(), &mut counter);
        counter.total
    }

    /// Take a statistics snapshot.
    ///
    /// Brief snapshots read the running counters and return immediately.
    /// Detailed snapshots first finish any in-flight sweep and reset all
    /// linear allocation buffers, then traverse the whole heap; their cost is
    /// proportional to heap size.
    pub fn collect_statistics(&mut self, detail_level: DetailLevel) -> HeapStatistics {
        match detail_level {
            DetailLevel::Brief => HeapStatistics {
                committed_size_bytes: self.stats.allocated_memory_size(),
                resident_size_bytes: self.stats.resident_memory_size(),
                used_size_bytes: self.stats.allocated_object_size(),
                detail_level: DetailLevel::Brief,
                space_stats: Vec::new(),
            },
            DetailLevel::Detailed => {
                self.finish_sweeping_if_running();
                self.allocator.reset_linear_allocation_buffers();
                collect_detailed_statistics(self.allocator.raw_heap())
            }
        }
    }

    /// Open a collection cycle. Any in-flight sweep is finished first.
    ///
    /// Fatal if marking is already active or garbage collection is currently
    /// forbidden by a scope.
    pub fn start_marking(&mut self, collection_type: CollectionType, reason: GcReason) {
        assert!(!self.marking_in_progress, "marking started twice");
        assert_eq!(
            self.disallow_gc_count.get(),
            0,
            "collection started while garbage collection is disallowed"
        );
        assert_eq!(
            self.no_gc_count.get(),
            0,
            "collection started inside a no-collection scope"
        );
        self.finish_sweeping_if_running();
        self.stats.notify_marking_started(collection_type, reason);
        self.marking_in_progress = true;
    }

    /// Close the marking pass with the tracer's marked byte count.
    ///
    /// Linear allocation buffers are abandoned so the sweeper and any
    /// statistics traversal see wall-to-wall headers, and on generational
    /// heaps the remembered set is dropped.
    pub fn finish_marking(&mut self, marked_bytes: usize) {
        assert!(self.marking_in_progress, "marking finished without starting");
        self.allocator.reset_linear_allocation_buffers();
        if let Some(set) = self.remembered_set.as_mut() {
            set.reset(self.allocator.raw_heap());
        }
        self.stats.notify_marking_completed(marked_bytes);
        self.marking_in_progress = false;
    }

    /// Run every registered prefinalizer and return the bytes allocated
    /// from inside the callbacks.
    ///
    /// Collections are forbidden for the duration. Unless the heap was built
    /// with `allow_allocations_in_prefinalizers`, allocation is too.
    pub fn execute_prefinalizers(&mut self) -> usize {
        let handler = self.prefinalizers.clone();
        let no_gc = self.no_gc_count.clone();
        no_gc.set(no_gc.get() + 1);
        let disallow_allocations = !self.options.allow_allocations_in_prefinalizers;
        if disallow_allocations {
            self.allocator.enter_no_allocation_scope();
        }

        let bytes = handler.invoke(self);

        if disallow_allocations {
            self.allocator.exit_no_allocation_scope();
        }
        no_gc.set(no_gc.get() - 1);
        bytes
    }

    /// Start a sweep with this heap's configured sweeping type.
    pub fn start_sweeping(&mut self) {
        let config = SweepingConfig {
            sweeping_type: self.options.sweeping_support,
            compactable_space_handling: CompactableSpaceHandling::Sweep,
        };
        let (raw_heap, backend) = self.allocator.heap_and_backend();
        self.sweeper.start(raw_heap, backend, config);
    }

    /// Drain any in-progress sweep synchronously.
    pub fn finish_sweeping_if_running(&mut self) {
        let (raw_heap, backend) = self.allocator.heap_and_backend();
        self.sweeper.finish_if_running(raw_heap, backend);
    }

    /// Let the sweeper close its cycle bookkeeping if all work is done.
    pub fn notify_sweeper_done_if_needed(&mut self) {
        self.sweeper.notify_done_if_needed();
    }

    /// Whether a started sweep still has queued work.
    pub fn sweeping_in_progress(&self) -> bool {
        self.sweeper.is_in_progress()
    }

    fn has_persistent_roots(&self) -> bool {
        if self.strong_persistent_region.nodes_in_use() > 0
            || self.weak_persistent_region.nodes_in_use() > 0
        {
            return true;
        }
        let lock = PersistentRegionLock::guard();
        self.strong_cross_thread_region.nodes_in_use(&lock) > 0
            || self.weak_cross_thread_region.nodes_in_use(&lock) > 0
    }

    /// Shut the heap down unconditionally.
    ///
    /// Run forced collection cycles until clearing the persistent root
    /// regions produces no new roots, then releases every page and forbids
    /// collection and allocation forever. Fatal if marking is active, if
    /// garbage collection is disallowed, or if the root set has not drained
    /// after [`MAX_TERMINATION_GCS`] cycles.
    pub fn terminate(&mut self) {
        assert!(!self.marking_in_progress, "heap terminated during marking");
        assert_eq!(
            self.disallow_gc_count.get(),
            0,
            "heap terminated while garbage collection is disallowed"
        );
        self.finish_sweeping_if_running();

        let mut cycles = 0usize;
        loop {
            cycles += 1;
            assert!(
                cycles <= MAX_TERMINATION_GCS,
                "persistent roots did not drain after {MAX_TERMINATION_GCS} collection cycles"
            );

            self.strong_persistent_region.clear_all_used_nodes();
            self.weak_persistent_region.clear_all_used_nodes();
            {
                let lock = PersistentRegionLock::guard();
                self.strong_cross_thread_region.clear_all_used_nodes(&lock);
                self.weak_cross_thread_region.clear_all_used_nodes(&lock);
            }

            // One forced cycle: everything is unreachable once the roots are
            // gone, so marking completes with zero marked bytes and the
            // atomic sweep reclaims the whole heap.
            self.in_atomic_pause = true;
            self.stats
                .notify_marking_started(CollectionType::Major, GcReason::Forced);
            self.allocator.reset_linear_allocation_buffers();
            if let Some(set) = self.remembered_set.as_mut() {
                set.reset(self.allocator.raw_heap());
            }
            self.stats.notify_marking_completed(0);
            self.execute_prefinalizers();
            {
                let config = SweepingConfig {
                    sweeping_type: SweepingType::Atomic,
                    compactable_space_handling: CompactableSpaceHandling::Sweep,
                };
                let (raw_heap, backend) = self.allocator.heap_and_backend();
                self.sweeper.start(raw_heap, backend, config);
            }
            self.in_atomic_pause = false;
            self.sweeper.notify_done_if_needed();

            if !self.has_persistent_roots() {
                break;
            }
        }

        self.allocator.terminate();
        // Permanent: terminated heaps never collect again.
        self.disallow_gc_count.set(self.disallow_gc_count.get() + 1);

        assert_eq!(0, self.strong_persistent_region.nodes_in_use());
        assert_eq!(0, self.weak_persistent_region.nodes_in_use());
        let lock = PersistentRegionLock::guard();
        assert_eq!(0, self.strong_cross_thread_region.nodes_in_use(&lock));
        assert_eq!(0, self.weak_cross_thread_region.nodes_in_use(&lock));
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// Scope forbidding garbage collection.
///
/// While at least one such scope is alive, starting a collection or
/// terminating the heap is a fatal error. Holds no borrow of the heap, so
/// allocation stays possible inside the scope.
pub struct DisallowGarbageCollectionScope {
    count: Rc<Cell<usize>>,
}

impl DisallowGarbageCollectionScope {
    /// Enter the scope on `heap`.
    pub fn enter(heap: &Heap) -> Self {
        heap.disallow_gc_count.set(heap.disallow_gc_count.get() + 1);
        Self {
            count: heap.disallow_gc_count.clone(),
        }
    }
}

impl Drop for DisallowGarbageCollectionScope {
    fn drop(&mut self) {
        let current = self.count.get();
        debug_assert!(current > 0);
        self.count.set(current - 1);
    }
}

/// Scope suppressing garbage collection without making it an error to ask.
///
/// Prefinalizers run under this scope so a callback cannot trigger a nested
/// collection.
pub struct NoGarbageCollectionScope {
    count: Rc<Cell<usize>>,
}

impl NoGarbageCollectionScope {
    /// Enter the scope on `heap`.
    pub fn enter(heap: &Heap) -> Self {
        heap.no_gc_count.set(heap.no_gc_count.get() + 1);
        Self {
            count: heap.no_gc_count.clone(),
        }
    }
}

impl Drop for NoGarbageCollectionScope {
    fn drop(&mut self) {
        let current = self.count.get();
        debug_assert!(current > 0);
        self.count.set(current - 1);
    }
}
