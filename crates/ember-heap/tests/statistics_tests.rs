//! Integration tests of statistics snapshots and object size accounting.

use ember_heap::{
    CollectionType, DetailLevel, GcReason, Heap, HeapOptions, SweepingType,
};

fn full_unmarked_cycle(heap: &mut Heap) {
    heap.start_marking(CollectionType::Major, GcReason::Requested);
    heap.finish_marking(0);
    heap.execute_prefinalizers();
    heap.start_sweeping();
    heap.notify_sweeper_done_if_needed();
}

#[test]
fn brief_statistics_are_idempotent() {
    let mut heap = Heap::new();
    heap.allocate(48);
    heap.allocate(4000);

    let first = heap.collect_statistics(DetailLevel::Brief);
    let second = heap.collect_statistics(DetailLevel::Brief);
    assert_eq!(first, second);
}

#[test]
fn detailed_statistics_reconcile_with_the_live_heap() {
    let mut heap = Heap::new();
    heap.allocate(24);
    heap.allocate(100);
    heap.allocate(4000);
    heap.allocate(10 * 1024);

    let snapshot = heap.collect_statistics(DetailLevel::Detailed);
    assert_eq!(snapshot.detail_level, DetailLevel::Detailed);
    assert!(snapshot.committed_size_bytes >= snapshot.used_size_bytes);

    let names: Vec<&str> = snapshot.space_stats.iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["normal1", "normal2", "normal3", "normal4", "large"]);

    let committed_sum: usize = snapshot
        .space_stats
        .iter()
        .map(|s| s.committed_size_bytes)
        .sum();
    assert_eq!(snapshot.committed_size_bytes, committed_sum);

    // Used bytes cover every live payload plus its header.
    assert!(snapshot.used_size_bytes > heap.object_payload_size());
}

#[test]
fn detailed_statistics_finish_an_in_flight_sweep() {
    let options = HeapOptions {
        sweeping_support: SweepingType::Incremental,
        ..HeapOptions::default()
    };
    let mut heap = Heap::with_options(options);
    heap.allocate(64);

    heap.start_marking(CollectionType::Major, GcReason::Requested);
    heap.finish_marking(0);
    heap.execute_prefinalizers();
    heap.start_sweeping();
    assert!(heap.sweeping_in_progress());

    let snapshot = heap.collect_statistics(DetailLevel::Detailed);
    assert!(!heap.sweeping_in_progress());
    assert_eq!(snapshot.used_size_bytes, 0);
    assert_eq!(snapshot.committed_size_bytes, 0);
}

#[test]
fn payload_size_tracks_single_object_delta() {
    let mut heap = Heap::new();
    heap.allocate(32);
    full_unmarked_cycle(&mut heap);
    assert_eq!(heap.object_payload_size(), 0);

    let before = heap.object_payload_size();
    heap.allocate(64);
    assert_eq!(heap.object_payload_size(), before + 64);
}

#[test]
fn collection_cycle_resets_used_bytes_and_counts_once() {
    let mut heap = Heap::new();
    heap.allocate(128);
    assert!(heap.collect_statistics(DetailLevel::Brief).used_size_bytes > 0);

    full_unmarked_cycle(&mut heap);

    let snapshot = heap.collect_statistics(DetailLevel::Brief);
    assert_eq!(snapshot.used_size_bytes, 0);
    assert_eq!(snapshot.committed_size_bytes, 0);
    assert_eq!(heap.stats().collection_count(), 1);
    assert_eq!(heap.stats().forced_collection_count(), 0);
}
