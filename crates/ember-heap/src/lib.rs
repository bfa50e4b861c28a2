//! Incremental tracing garbage-collected heap core for embedding.
//!
//! `ember-heap` provides the heap-management half of a tracing collector:
//! size-classed bump allocation out of fixed pages, persistent root regions
//! (same-thread and cross-thread), prefinalizers, a mark-bit driven sweeper,
//! statistics with observers, and a deterministic bounded termination
//! protocol. Marking itself is driven by the embedder: the heap exposes the
//! cycle lifecycle and the embedder supplies the tracer.
//!
//! # Example
//!
//! ```
//! use ember_heap::{CollectionType, GcReason, Heap};
//!
//! let mut heap = Heap::new();
//! let payload = heap.allocate(64);
//! assert_eq!(heap.object_payload_size(), 64);
//!
//! // One full collection cycle with nothing marked reclaims everything.
//! heap.start_marking(CollectionType::Major, GcReason::Requested);
//! heap.finish_marking(0);
//! heap.execute_prefinalizers();
//! heap.start_sweeping();
//! heap.notify_sweeper_done_if_needed();
//! assert_eq!(heap.object_payload_size(), 0);
//!
//! let _ = payload;
//! heap.terminate();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod alloc;
pub mod backend;
pub mod config;
pub mod heap;
pub mod platform;
pub mod prefinalizer;
pub mod remembered;
pub mod roots;
pub mod stats;
pub mod sweeper;

pub use config::{
    CollectionType, GcReason, HeapOptions, MarkingType, PageAllocatorKind, StackSupport,
    SweepingType,
};
pub use heap::page::{HeapObjectHeader, ObjectView};
pub use heap::{
    DisallowGarbageCollectionScope, Heap, NoGarbageCollectionScope, MAX_TERMINATION_GCS,
};
pub use platform::{
    DefaultPlatform, FatalOutOfMemoryHandler, PageAllocator, Platform, Tracer,
};
pub use prefinalizer::{PreFinalizer, PreFinalizerHandler};
pub use remembered::RememberedSet;
pub use roots::{
    CrossThreadPersistentRegion, PersistentNodeHandle, PersistentRegion, PersistentRegionLock,
};
pub use stats::{
    AllocationObserver, DetailLevel, HeapStatistics, PageStatistics, ProcessHeapStatistics,
    SpaceStatistics,
};
pub use sweeper::{CompactableSpaceHandling, Sweeper, SweepingConfig};

/// Errors surfaced by heap-internal resource acquisition.
///
/// Page reservation failures are recoverable at this level; whether they are
/// fatal is decided by the caller, typically by routing them to the
/// [`FatalOutOfMemoryHandler`].
#[derive(Debug, thiserror::Error)]
pub enum HeapError {
    /// The page allocator could not reserve `size` bytes.
    #[error("page reservation of {size} bytes failed")]
    OutOfMemory {
        /// Reservation size that failed, in bytes.
        size: usize,
    },
    /// The requested payload exceeds the representable object size.
    #[error("object allocation of {size} bytes exceeds the supported maximum")]
    ObjectTooLarge {
        /// Payload size that was requested, in bytes.
        size: usize,
    },
}

/// Convenience alias for heap-internal fallible operations.
pub type HeapResult<T> = Result<T, HeapError>;
