//! Prefinalizer callbacks.
//!
//! Prefinalizers run after a marking pass completes and before sweeping
//! starts, so they observe the heap with dead objects still intact.
//! Invocation order is registration order.

use std::cell::{Cell, RefCell};

use crate::Heap;

/// An embedder callback run between marking and sweeping.
pub type PreFinalizer = Box<dyn FnMut(&mut Heap)>;

/// Holds registered prefinalizers and invocation bookkeeping for one heap.
///
/// Callbacks receive the owning [`Heap`] mutably; the handler itself lives
/// behind an `Rc` alongside it, so each callback is taken out of its slot for
/// the duration of its call and restored afterwards. Slots freed that way are
/// never reused within a single invocation pass.
pub struct PreFinalizerHandler {
    callbacks: RefCell<Vec<Option<PreFinalizer>>>,
    is_invoking: Cell<bool>,
    bytes_allocated_in_prefinalizers: Cell<usize>,
}

impl PreFinalizerHandler {
    pub(crate) fn new() -> Self {
        Self {
            callbacks: RefCell::new(Vec::new()),
            is_invoking: Cell::new(false),
            bytes_allocated_in_prefinalizers: Cell::new(0),
        }
    }

    /// Register a callback. Callbacks registered while an invocation pass is
    /// running are picked up by that same pass.
    pub fn register(&self, callback: PreFinalizer) {
        self.callbacks.borrow_mut().push(Some(callback));
    }

    /// True while an invocation pass is running on this thread.
    pub fn is_invoking(&self) -> bool {
        self.is_invoking.get()
    }

    pub(crate) fn notify_allocation(&self, bytes: usize) {
        debug_assert!(self.is_invoking.get());
        self.bytes_allocated_in_prefinalizers
            .set(self.bytes_allocated_in_prefinalizers.get() + bytes);
    }

    /// Run every registered callback in registration order and return the
    /// number of bytes allocated from inside the callbacks.
    ///
    /// The caller is responsible for bracketing this with the configured
    /// allocation-disallow scope.
    pub(crate) fn invoke(&self, heap: &mut Heap) -> usize {
        assert!(!self.is_invoking.get(), "reentrant prefinalizer invocation");
        self.is_invoking.set(true);
        self.bytes_allocated_in_prefinalizers.set(0);

        let mut index = 0;
        loop {
            // Length is re-read each iteration so callbacks appended by a
            // running callback are invoked in the same pass.
            let taken = {
                let mut callbacks = self.callbacks.borrow_mut();
                if index >= callbacks.len() {
                    break;
                }
                callbacks[index].take()
            };
            if let Some(mut callback) = taken {
                callback(heap);
                self.callbacks.borrow_mut()[index] = Some(callback);
            }
            index += 1;
        }

        self.is_invoking.set(false);
        self.bytes_allocated_in_prefinalizers.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn invokes_in_registration_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let handler = PreFinalizerHandler::new();
        for id in 0..3 {
            let order = order.clone();
            handler.register(Box::new(move |_heap| order.borrow_mut().push(id)));
        }

        let mut heap = Heap::new();
        let bytes = handler.invoke(&mut heap);
        assert_eq!(bytes, 0);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn callbacks_registered_during_invocation_run_in_same_pass() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let handler = Rc::new(PreFinalizerHandler::new());
        {
            let order = order.clone();
            let handler_ref = handler.clone();
            handler.register(Box::new(move |_heap| {
                order.borrow_mut().push("first");
                let order = order.clone();
                handler_ref.register(Box::new(move |_heap| {
                    order.borrow_mut().push("appended");
                }));
            }));
        }

        let mut heap = Heap::new();
        handler.invoke(&mut heap);
        assert_eq!(*order.borrow(), vec!["first", "appended"]);
    }

    #[test]
    fn repeated_invocation_runs_callbacks_again() {
        let count = Rc::new(Cell::new(0));
        let handler = PreFinalizerHandler::new();
        {
            let count = count.clone();
            handler.register(Box::new(move |_heap| count.set(count.get() + 1)));
        }

        let mut heap = Heap::new();
        handler.invoke(&mut heap);
        handler.invoke(&mut heap);
        assert_eq!(count.get(), 2);
    }
}
