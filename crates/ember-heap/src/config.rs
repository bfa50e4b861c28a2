//! Heap construction options.
//!
//! All build-variant behavior (leak-checked page allocation, generational
//! support) is selected here, once, at construction time. There are no
//! feature-gated code paths inside the heap itself.

/// Whether the heap supports conservative scanning of the native stack.
///
/// The heap core does not scan stacks itself; the value is recorded so an
/// external collection driver can pick a marking strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StackSupport {
    /// Conservative stack scanning is available to the tracer.
    SupportsConservativeStackScan,
    /// Stack scanning is unavailable; all roots must be registered explicitly.
    #[default]
    NoConservativeStackScan,
}

/// Marking strategies an external collection driver may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkingType {
    /// Marking happens in a single atomic pause.
    #[default]
    Atomic,
    /// Marking is split into increments on the owning thread.
    Incremental,
    /// Marking increments may additionally run on concurrent threads.
    IncrementalAndConcurrent,
}

/// Sweeping strategies supported by the [`Sweeper`](crate::sweeper::Sweeper).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SweepingType {
    /// The whole heap is swept synchronously in one pause.
    #[default]
    Atomic,
    /// Sweeping is started and then polled to completion.
    Incremental,
}

/// Page-allocator strategy, resolved once in [`Heap::new`](crate::Heap::new).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageAllocatorKind {
    /// Use the platform's page allocator directly.
    #[default]
    System,
    /// Wrap the platform allocator in a leak-checking layer that verifies
    /// every reservation is returned before the heap goes away.
    LeakChecked,
}

/// Which generation a collection cycle targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionType {
    /// Young-generation collection.
    Minor,
    /// Full-heap collection.
    Major,
}

/// Why a collection cycle was started.
///
/// Forced cycles are the degenerate ones the termination protocol runs; the
/// statistics collector counts them separately so externally visible totals
/// only reflect real collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcReason {
    /// A regular collection requested by the embedder or a heuristic.
    Requested,
    /// A forced collection, e.g. one cycle of the termination protocol.
    Forced,
}

/// Configuration for a [`Heap`](crate::Heap).
///
/// Plain data; construct with struct-update syntax over `Default`:
///
/// ```
/// use ember_heap::{HeapOptions, SweepingType};
///
/// let options = HeapOptions {
///     sweeping_support: SweepingType::Incremental,
///     ..Default::default()
/// };
/// # let _ = options;
/// ```
#[derive(Debug, Clone, Default)]
pub struct HeapOptions {
    /// Stack-scanning capability advertised to the collection driver.
    pub stack_support: StackSupport,
    /// Marking strategy the collection driver should use.
    pub marking_support: MarkingType,
    /// Sweeping strategy for regular collections. Termination always sweeps
    /// atomically regardless of this setting.
    pub sweeping_support: SweepingType,
    /// Enable the young generation and the remembered set.
    pub generational: bool,
    /// Let prefinalizers allocate. Off by default; prefinalizers run under a
    /// scope that makes allocation a fatal error unless this is set.
    pub allow_allocations_in_prefinalizers: bool,
    /// Page-allocator strategy.
    pub page_allocator: PageAllocatorKind,
}
