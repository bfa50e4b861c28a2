//! Read-only double-dispatch traversal over the raw heap.
//!
//! Visits every page of every space exactly once; object headers covered by
//! an active linear allocation buffer are not visited since they do not
//! exist yet. Space- and page-level methods return whether to descend.

use super::page::{LargePage, NormalPage, ObjectView};
use super::space::{LargePageSpace, NormalPageSpace, RawHeap};

/// Visitor over spaces, pages and object headers.
pub(crate) trait HeapVisitor {
    fn visit_normal_space(&mut self, _space: &NormalPageSpace) -> bool {
        true
    }

    fn visit_large_space(&mut self, _space: &LargePageSpace) -> bool {
        true
    }

    fn visit_normal_page(&mut self, _page: &NormalPage) -> bool {
        true
    }

    fn visit_large_page(&mut self, _page: &LargePage) -> bool {
        true
    }

    fn visit_header(&mut self, _object: ObjectView<'_>) {}
}

/// Drive `visitor` over the whole raw heap.
pub(crate) fn traverse<V: HeapVisitor>(raw_heap: &RawHeap, visitor: &mut V) {
    for space in raw_heap.normal_spaces() {
        if !visitor.visit_normal_space(space) {
            continue;
        }
        for page in space.pages() {
            if !visitor.visit_normal_page(page) {
                continue;
            }
            page.for_each_header(space.lab_span_on(page), |header| {
                visitor.visit_header(ObjectView::normal(header));
            });
        }
    }

    let large = raw_heap.large_space();
    if visitor.visit_large_space(large) {
        for page in large.pages() {
            if !visitor.visit_large_page(page) {
                continue;
            }
            visitor.visit_header(ObjectView::large(page.header(), page.object_size()));
        }
    }
}

/// Scan asserting that no space holds a non-empty linear allocation buffer.
///
/// Used by debug invariants that are only sound against a fully reset heap,
/// such as the remembered-set reset.
pub(crate) struct AllLabsAreEmpty {
    some_lab_is_set: bool,
}

impl AllLabsAreEmpty {
    pub fn check(raw_heap: &RawHeap) -> bool {
        let mut scan = AllLabsAreEmpty {
            some_lab_is_set: false,
        };
        traverse(raw_heap, &mut scan);
        !scan.some_lab_is_set
    }
}

impl HeapVisitor for AllLabsAreEmpty {
    fn visit_normal_space(&mut self, space: &NormalPageSpace) -> bool {
        self.some_lab_is_set |= space.linear_allocation_buffer_size() != 0;
        false
    }

    fn visit_large_space(&mut self, _space: &LargePageSpace) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_heap_has_empty_labs() {
        let raw_heap = RawHeap::new();
        assert!(AllLabsAreEmpty::check(&raw_heap));
    }

    #[test]
    fn traversal_of_empty_heap_visits_nothing() {
        struct Counter {
            headers: usize,
            spaces: usize,
        }
        impl HeapVisitor for Counter {
            fn visit_normal_space(&mut self, _space: &NormalPageSpace) -> bool {
                self.spaces += 1;
                true
            }
            fn visit_header(&mut self, _object: ObjectView<'_>) {
                self.headers += 1;
            }
        }

        let raw_heap = RawHeap::new();
        let mut counter = Counter {
            headers: 0,
            spaces: 0,
        };
        traverse(&raw_heap, &mut counter);
        assert_eq!(counter.spaces, 4);
        assert_eq!(counter.headers, 0);
    }
}
