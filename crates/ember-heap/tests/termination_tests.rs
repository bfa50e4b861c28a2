//! End-to-end tests of the heap termination protocol: root draining,
//! prefinalizer-driven resurrection, and the cycle ceiling.

use std::cell::Cell;
use std::ptr::NonNull;
use std::rc::Rc;

use ember_heap::{
    DisallowGarbageCollectionScope, Heap, PersistentRegionLock, MAX_TERMINATION_GCS,
};

fn dangling_root() -> NonNull<()> {
    NonNull::dangling()
}

#[test]
fn terminate_empty_heap_runs_one_forced_cycle() {
    let mut heap = Heap::new();
    heap.allocate(64);
    heap.terminate();

    assert_eq!(heap.object_payload_size(), 0);
    assert_eq!(heap.stats().forced_collection_count(), 1);
    assert_eq!(heap.stats().collection_count(), 0);
    assert_eq!(heap.collect_statistics(ember_heap::DetailLevel::Brief).committed_size_bytes, 0);
}

#[test]
fn terminate_drains_all_four_regions() {
    let mut heap = Heap::new();
    for _ in 0..3 {
        heap.strong_persistent_region().allocate_node(dangling_root());
    }
    {
        let lock = PersistentRegionLock::guard();
        for _ in 0..2 {
            heap.weak_cross_thread_persistent_region()
                .allocate_node(&lock, dangling_root());
        }
    }
    assert_eq!(heap.strong_persistent_region().nodes_in_use(), 3);

    heap.terminate();

    assert_eq!(heap.strong_persistent_region().nodes_in_use(), 0);
    assert_eq!(heap.weak_persistent_region().nodes_in_use(), 0);
    let lock = PersistentRegionLock::guard();
    assert_eq!(
        heap.strong_cross_thread_persistent_region()
            .nodes_in_use(&lock),
        0
    );
    assert_eq!(
        heap.weak_cross_thread_persistent_region().nodes_in_use(&lock),
        0
    );
}

#[test]
fn single_resurrection_takes_exactly_two_cycles() {
    let mut heap = Heap::new();
    for _ in 0..3 {
        heap.strong_persistent_region().allocate_node(dangling_root());
    }
    {
        let lock = PersistentRegionLock::guard();
        for _ in 0..2 {
            heap.weak_cross_thread_persistent_region()
                .allocate_node(&lock, dangling_root());
        }
    }

    // Re-register one same-thread root from a prefinalizer, exactly once.
    let resurrected = Rc::new(Cell::new(false));
    {
        let resurrected = resurrected.clone();
        heap.register_prefinalizer(Box::new(move |heap| {
            if !resurrected.replace(true) {
                heap.strong_persistent_region()
                    .allocate_node(NonNull::dangling());
            }
        }));
    }

    heap.terminate();

    assert!(resurrected.get());
    assert_eq!(heap.stats().forced_collection_count(), 2);
    assert_eq!(heap.strong_persistent_region().nodes_in_use(), 0);
    assert_eq!(heap.weak_persistent_region().nodes_in_use(), 0);
    let lock = PersistentRegionLock::guard();
    assert_eq!(
        heap.strong_cross_thread_persistent_region()
            .nodes_in_use(&lock),
        0
    );
    assert_eq!(
        heap.weak_cross_thread_persistent_region().nodes_in_use(&lock),
        0
    );
}

#[test]
fn bounded_resurrection_converges_below_the_ceiling() {
    let mut heap = Heap::new();
    heap.strong_persistent_region().allocate_node(dangling_root());

    let remaining = Rc::new(Cell::new(MAX_TERMINATION_GCS - 1));
    {
        let remaining = remaining.clone();
        heap.register_prefinalizer(Box::new(move |heap| {
            let left = remaining.get();
            if left > 0 {
                remaining.set(left - 1);
                heap.strong_persistent_region()
                    .allocate_node(NonNull::dangling());
            }
        }));
    }

    heap.terminate();
    assert_eq!(remaining.get(), 0);
    assert_eq!(
        heap.stats().forced_collection_count(),
        MAX_TERMINATION_GCS
    );
}

#[test]
#[should_panic(expected = "did not drain")]
fn unbounded_resurrection_hits_the_cycle_ceiling() {
    let mut heap = Heap::new();
    heap.register_prefinalizer(Box::new(|heap| {
        heap.strong_persistent_region()
            .allocate_node(NonNull::dangling());
    }));
    heap.terminate();
}

#[test]
#[should_panic(expected = "terminated during marking")]
fn terminate_during_marking_is_fatal() {
    use ember_heap::{CollectionType, GcReason};

    let mut heap = Heap::new();
    heap.start_marking(CollectionType::Major, GcReason::Requested);
    heap.terminate();
}

#[test]
#[should_panic(expected = "garbage collection is disallowed")]
fn terminate_under_disallow_scope_is_fatal() {
    let mut heap = Heap::new();
    let _scope = DisallowGarbageCollectionScope::enter(&heap);
    heap.terminate();
}

#[test]
#[should_panic(expected = "allocation on a terminated heap")]
fn allocation_after_terminate_is_fatal() {
    let mut heap = Heap::new();
    heap.terminate();
    heap.allocate(8);
}
