//! Remembered set for generational collection.
//!
//! Tracks old-to-young references recorded by the write barrier between
//! major collections, so a minor collection can treat the recorded slots as
//! roots instead of rescanning the whole old generation. Only constructed
//! when the heap is built in generational mode.

use rustc_hash::FxHashSet;

use crate::heap::space::RawHeap;
use crate::heap::visitor::AllLabsAreEmpty;

/// Slots in old-generation objects known to point into the young generation.
pub struct RememberedSet {
    slots: FxHashSet<usize>,
}

impl RememberedSet {
    pub(crate) fn new() -> Self {
        Self {
            slots: FxHashSet::default(),
        }
    }

    /// Record `slot` as holding a cross-generation reference. Idempotent.
    pub fn invalidate_and_add(&mut self, slot: *const u8) {
        self.slots.insert(slot as usize);
    }

    /// Remove a slot, typically because its containing object died.
    pub fn remove(&mut self, slot: *const u8) {
        self.slots.remove(&(slot as usize));
    }

    /// Number of recorded slots.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Visit every recorded slot.
    pub fn visit_slots(&self, mut f: impl FnMut(*const u8)) {
        for slot in &self.slots {
            f(*slot as *const u8);
        }
    }

    /// Drop all recorded slots after a major collection.
    ///
    /// Callers must have reset all linear allocation buffers first, so no
    /// recorded slot can alias memory the allocator still considers handed
    /// out.
    pub(crate) fn reset(&mut self, raw_heap: &RawHeap) {
        debug_assert!(AllLabsAreEmpty::check(raw_heap));
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_is_idempotent() {
        let mut set = RememberedSet::new();
        let slot = 0x1000 as *const u8;
        set.invalidate_and_add(slot);
        set.invalidate_and_add(slot);
        assert_eq!(set.size(), 1);

        set.remove(slot);
        assert_eq!(set.size(), 0);
    }

    #[test]
    fn reset_clears_all_slots() {
        let mut set = RememberedSet::new();
        set.invalidate_and_add(0x1000 as *const u8);
        set.invalidate_and_add(0x2000 as *const u8);

        let raw_heap = RawHeap::new();
        set.reset(&raw_heap);
        assert_eq!(set.size(), 0);
    }

    #[test]
    fn visit_sees_every_slot() {
        let mut set = RememberedSet::new();
        set.invalidate_and_add(0x1000 as *const u8);
        set.invalidate_and_add(0x2000 as *const u8);

        let mut seen = Vec::new();
        set.visit_slots(|slot| seen.push(slot as usize));
        seen.sort_unstable();
        assert_eq!(seen, vec![0x1000, 0x2000]);
    }
}
