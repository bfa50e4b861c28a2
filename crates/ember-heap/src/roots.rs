//! Persistent root regions.
//!
//! A persistent node is one external-reference slot the embedder holds onto
//! across collections. Nodes live in a pooled `Vec` with an intrusive index
//! free list, so registering a root never heap-allocates once the pool is
//! warm. The heap owns four regions: strong and weak, each in a same-thread
//! and a cross-thread flavor.
//!
//! Same-thread regions do no locking; the owning-thread discipline is
//! structural because the heap hands them out as `Rc`. Cross-thread regions
//! share one process-wide lock, and every accessor takes a
//! [`PersistentRegionLock`] so holding the lock is checked by the compiler
//! rather than by convention.

use std::cell::RefCell;
use std::ptr::NonNull;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};

/// Handle to a node inside one region. Valid until the node is freed or the
/// region clears it; after that the slot reads back as `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistentNodeHandle {
    index: usize,
}

#[derive(Debug, Clone, Copy)]
enum NodeSlot {
    Free { next: Option<usize> },
    Used { object: NonNull<()> },
}

/// Pool state shared by both region flavors.
#[derive(Debug, Default)]
struct RegionInner {
    slots: Vec<NodeSlot>,
    free_head: Option<usize>,
    nodes_in_use: usize,
}

impl RegionInner {
    fn allocate(&mut self, object: NonNull<()>) -> PersistentNodeHandle {
        let index = match self.free_head.take() {
            Some(index) => {
                let NodeSlot::Free { next } = self.slots[index] else {
                    unreachable!("free list points at a used slot");
                };
                self.free_head = next;
                self.slots[index] = NodeSlot::Used { object };
                index
            }
            None => {
                self.slots.push(NodeSlot::Used { object });
                self.slots.len() - 1
            }
        };
        self.nodes_in_use += 1;
        PersistentNodeHandle { index }
    }

    fn free(&mut self, handle: PersistentNodeHandle) {
        match self.slots[handle.index] {
            NodeSlot::Used { .. } => {
                self.slots[handle.index] = NodeSlot::Free {
                    next: self.free_head,
                };
                self.free_head = Some(handle.index);
                self.nodes_in_use -= 1;
            }
            NodeSlot::Free { .. } => panic!("double free of a persistent node"),
        }
    }

    fn clear_all_used_nodes(&mut self) {
        for index in 0..self.slots.len() {
            if let NodeSlot::Used { .. } = self.slots[index] {
                self.slots[index] = NodeSlot::Free {
                    next: self.free_head,
                };
                self.free_head = Some(index);
                self.nodes_in_use -= 1;
            }
        }
        debug_assert_eq!(self.nodes_in_use, 0);
    }

    fn object(&self, handle: PersistentNodeHandle) -> Option<NonNull<()>> {
        match self.slots.get(handle.index)? {
            NodeSlot::Used { object } => Some(*object),
            NodeSlot::Free { .. } => None,
        }
    }
}

/// A same-thread persistent root region.
///
/// No locking; the heap hands this out as `Rc`, which keeps it on the owning
/// thread.
#[derive(Debug, Default)]
pub struct PersistentRegion {
    inner: RefCell<RegionInner>,
}

impl PersistentRegion {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `object` as a root and return its node handle.
    pub fn allocate_node(&self, object: NonNull<()>) -> PersistentNodeHandle {
        self.inner.borrow_mut().allocate(object)
    }

    /// Release one node back to the pool.
    ///
    /// # Panics
    ///
    /// Panics if the node was already freed or cleared.
    pub fn free_node(&self, handle: PersistentNodeHandle) {
        self.inner.borrow_mut().free(handle)
    }

    /// Clear every in-use node. Outstanding handles observe `None`
    /// afterwards; dereferencing a cleared root is an embedder usage error.
    pub fn clear_all_used_nodes(&self) {
        self.inner.borrow_mut().clear_all_used_nodes()
    }

    /// Exactly the number of live (non-cleared) nodes.
    pub fn nodes_in_use(&self) -> usize {
        self.inner.borrow().nodes_in_use
    }

    /// The object a node refers to, or `None` once cleared/freed.
    pub fn node_object(&self, handle: PersistentNodeHandle) -> Option<NonNull<()>> {
        self.inner.borrow().object(handle)
    }
}

static CROSS_THREAD_REGION_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Guard over the process-wide lock shared by all cross-thread regions.
///
/// Non-reentrant: acquiring a second guard on the same thread deadlocks.
pub struct PersistentRegionLock {
    _guard: MutexGuard<'static, ()>,
}

impl PersistentRegionLock {
    /// Acquire the shared lock, blocking until it is available.
    pub fn guard() -> Self {
        Self {
            _guard: CROSS_THREAD_REGION_MUTEX.lock(),
        }
    }
}

/// A persistent root region usable from any thread.
///
/// All access requires a [`PersistentRegionLock`]; the `&` borrow of the
/// guard in every method is the proof of exclusion that makes the interior
/// `RefCell` sound to share.
#[derive(Debug, Default)]
pub struct CrossThreadPersistentRegion {
    inner: RefCell<RegionInner>,
}

// SAFETY: the inner RefCell is only touched by methods that borrow a
// PersistentRegionLock, and exactly one such guard exists process-wide at a
// time, so all access is serialized.
unsafe impl Send for CrossThreadPersistentRegion {}
unsafe impl Sync for CrossThreadPersistentRegion {}

impl CrossThreadPersistentRegion {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `object` as a root. Requires the shared lock.
    pub fn allocate_node(
        &self,
        _lock: &PersistentRegionLock,
        object: NonNull<()>,
    ) -> PersistentNodeHandle {
        self.inner.borrow_mut().allocate(object)
    }

    /// Release one node back to the pool. Requires the shared lock.
    pub fn free_node(&self, _lock: &PersistentRegionLock, handle: PersistentNodeHandle) {
        self.inner.borrow_mut().free(handle)
    }

    /// Clear every in-use node. Requires the shared lock.
    pub fn clear_all_used_nodes(&self, _lock: &PersistentRegionLock) {
        self.inner.borrow_mut().clear_all_used_nodes()
    }

    /// Exactly the number of live nodes. Requires the shared lock.
    pub fn nodes_in_use(&self, _lock: &PersistentRegionLock) -> usize {
        self.inner.borrow().nodes_in_use
    }

    /// The object a node refers to, or `None` once cleared/freed.
    /// Requires the shared lock.
    pub fn node_object(
        &self,
        _lock: &PersistentRegionLock,
        handle: PersistentNodeHandle,
    ) -> Option<NonNull<()>> {
        self.inner.borrow().object(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn dummy_object(tag: usize) -> NonNull<()> {
        // Persistent regions never dereference node payloads; any non-null
        // address works as a stand-in for a heap object.
        NonNull::new(tag as *mut ()).unwrap()
    }

    #[test]
    fn allocate_and_free_nodes() {
        let region = PersistentRegion::new();
        assert_eq!(region.nodes_in_use(), 0);

        let a = region.allocate_node(dummy_object(0x10));
        let b = region.allocate_node(dummy_object(0x20));
        assert_eq!(region.nodes_in_use(), 2);
        assert_eq!(region.node_object(a), Some(dummy_object(0x10)));

        region.free_node(a);
        assert_eq!(region.nodes_in_use(), 1);
        assert_eq!(region.node_object(a), None);
        assert_eq!(region.node_object(b), Some(dummy_object(0x20)));
    }

    #[test]
    fn freed_nodes_are_reused() {
        let region = PersistentRegion::new();
        let a = region.allocate_node(dummy_object(0x10));
        region.free_node(a);

        // The pool reuses the freed slot instead of growing.
        let b = region.allocate_node(dummy_object(0x20));
        assert_eq!(a, b);
        assert_eq!(region.nodes_in_use(), 1);
    }

    #[test]
    fn clear_all_used_nodes_empties_region() {
        let region = PersistentRegion::new();
        let handles: Vec<_> = (1..=5)
            .map(|i| region.allocate_node(dummy_object(i * 8)))
            .collect();
        assert_eq!(region.nodes_in_use(), 5);

        region.clear_all_used_nodes();
        assert_eq!(region.nodes_in_use(), 0);
        for handle in handles {
            assert_eq!(region.node_object(handle), None);
        }
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let region = PersistentRegion::new();
        let a = region.allocate_node(dummy_object(0x10));
        region.free_node(a);
        region.free_node(a);
    }

    #[test]
    fn cross_thread_region_basic() {
        let region = CrossThreadPersistentRegion::new();
        let lock = PersistentRegionLock::guard();

        let a = region.allocate_node(&lock, dummy_object(0x10));
        assert_eq!(region.nodes_in_use(&lock), 1);
        region.free_node(&lock, a);
        assert_eq!(region.nodes_in_use(&lock), 0);
    }

    #[test]
    fn cross_thread_concurrent_clears_never_double_clear() {
        let region = Arc::new(CrossThreadPersistentRegion::new());
        {
            let lock = PersistentRegionLock::guard();
            for i in 1..=64 {
                region.allocate_node(&lock, dummy_object(i * 8));
            }
        }

        let threads: Vec<_> = (0..2)
            .map(|_| {
                let region = Arc::clone(&region);
                std::thread::spawn(move || {
                    let lock = PersistentRegionLock::guard();
                    region.clear_all_used_nodes(&lock);
                    region.nodes_in_use(&lock)
                })
            })
            .collect();

        for thread in threads {
            // A count that went negative would panic inside the region;
            // both threads must observe zero after their clear.
            assert_eq!(thread.join().unwrap(), 0);
        }

        let lock = PersistentRegionLock::guard();
        assert_eq!(region.nodes_in_use(&lock), 0);
    }
}
