//! Platform capabilities consumed by the heap.
//!
//! The heap never allocates memory on its own; it sources raw pages from a
//! [`PageAllocator`] supplied through the [`Platform`] capability and assumes
//! nothing beyond "reserve pages, release pages". The tracing algorithm is
//! likewise external and only appears here as the [`Tracer`] boundary trait.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Alignment of every page reservation, in bytes.
pub const PAGE_ALIGNMENT: usize = 4096;

/// Low-level source of raw memory pages.
pub trait PageAllocator: Send + Sync {
    /// Reserve `size` bytes aligned to [`PAGE_ALIGNMENT`]. Returns `None`
    /// when the reservation cannot be satisfied.
    fn allocate_pages(&self, size: usize) -> Option<NonNull<u8>>;

    /// Release a reservation previously returned by `allocate_pages` with
    /// the same `size`.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate_pages(size)` on this allocator and must
    /// not be released twice.
    unsafe fn free_pages(&self, ptr: NonNull<u8>, size: usize);
}

/// Capability object handed to [`Heap::new`](crate::Heap::new).
pub trait Platform: Send + Sync {
    /// The page allocator backing this platform.
    fn page_allocator(&self) -> Arc<dyn PageAllocator>;
}

/// Default platform backed by [`SystemPageAllocator`].
pub struct DefaultPlatform {
    page_allocator: Arc<SystemPageAllocator>,
}

impl DefaultPlatform {
    /// Create the default platform.
    pub fn new() -> Self {
        Self {
            page_allocator: Arc::new(SystemPageAllocator),
        }
    }
}

impl Default for DefaultPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for DefaultPlatform {
    fn page_allocator(&self) -> Arc<dyn PageAllocator> {
        self.page_allocator.clone()
    }
}

/// Page allocator on top of the process allocator.
pub struct SystemPageAllocator;

impl PageAllocator for SystemPageAllocator {
    fn allocate_pages(&self, size: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, PAGE_ALIGNMENT).ok()?;
        // SAFETY: layout has non-zero size for every page request the backend
        // makes; a null return is mapped to None.
        let ptr = unsafe { alloc(layout) };
        NonNull::new(ptr)
    }

    unsafe fn free_pages(&self, ptr: NonNull<u8>, size: usize) {
        let layout = Layout::from_size_align(size, PAGE_ALIGNMENT)
            .expect("layout was valid at allocation time");
        dealloc(ptr.as_ptr(), layout);
    }
}

/// Leak-checking wrapper around another page allocator.
///
/// Selected via [`PageAllocatorKind::LeakChecked`](crate::PageAllocatorKind).
/// Count outstanding reserved bytes and panic on drop if any reservation
/// was never returned, which turns a page leak into a test failure.
pub struct LeakCheckedPageAllocator {
    inner: Arc<dyn PageAllocator>,
    outstanding_bytes: AtomicUsize,
}

impl LeakCheckedPageAllocator {
    /// Wrap `inner` in the leak-checking layer.
    pub fn new(inner: Arc<dyn PageAllocator>) -> Self {
        Self {
            inner,
            outstanding_bytes: AtomicUsize::new(0),
        }
    }

    /// Bytes currently reserved and not yet returned.
    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding_bytes.load(Ordering::Relaxed)
    }
}

impl PageAllocator for LeakCheckedPageAllocator {
    fn allocate_pages(&self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.inner.allocate_pages(size)?;
        self.outstanding_bytes.fetch_add(size, Ordering::Relaxed);
        Some(ptr)
    }

    unsafe fn free_pages(&self, ptr: NonNull<u8>, size: usize) {
        self.outstanding_bytes.fetch_sub(size, Ordering::Relaxed);
        self.inner.free_pages(ptr, size);
    }
}

impl Drop for LeakCheckedPageAllocator {
    fn drop(&mut self) {
        let outstanding = self.outstanding_bytes.load(Ordering::Relaxed);
        assert_eq!(
            outstanding, 0,
            "page allocator dropped with {outstanding} bytes still reserved"
        );
    }
}

/// Process-wide handler for unrecoverable allocation failure.
///
/// Constructed first in [`Heap::new`](crate::Heap::new) and passed by
/// reference to every subsystem that can run out of memory. The default
/// behavior is a panic; tests may install a custom hook to observe the
/// failure before the panic fires.
pub struct FatalOutOfMemoryHandler {
    custom: RwLock<Option<Box<dyn Fn(&str) + Send + Sync>>>,
}

impl FatalOutOfMemoryHandler {
    /// Create a handler with the default (panicking) behavior.
    pub fn new() -> Self {
        Self {
            custom: RwLock::new(None),
        }
    }

    /// Install a hook invoked before the fatal panic.
    pub fn set_custom_handler(&self, hook: Box<dyn Fn(&str) + Send + Sync>) {
        *self.custom.write() = Some(hook);
    }

    /// Report an unrecoverable allocation failure. Never returns.
    pub fn fatal(&self, message: &str) -> ! {
        if let Some(hook) = self.custom.read().as_ref() {
            hook(message);
        }
        panic!("fatal process out of memory: {message}");
    }
}

impl Default for FatalOutOfMemoryHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FatalOutOfMemoryHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FatalOutOfMemoryHandler").finish()
    }
}

/// Boundary trait for the black-box tracing algorithm.
///
/// The external collection driver invokes the tracer between
/// [`Heap::start_marking`](crate::Heap::start_marking) and
/// [`Heap::finish_marking`](crate::Heap::finish_marking); the heap core never
/// calls it. The tracer marks reachable objects through their headers and
/// reports the number of marked bytes.
pub trait Tracer {
    /// Mark all reachable objects and return the marked byte count.
    fn trace(&mut self, heap: &mut crate::Heap) -> usize;
}
