//! Index-linked membership lists.
//!
//! A context can belong to up to three lists at once: the scheduler's ready
//! list, its terminated list, and one peer's wait list. Instead of
//! pointer-based hooks, each context embeds one [`Link`] slot per list and
//! a [`FiberList`] threads prev/next ids through the slot it is tagged
//! with, resolving ids through the [`Registry`]. No allocation happens per
//! membership, and the `linked` marker answers membership queries in O(1).

use std::cell::Cell;

use crate::id::FiberId;
use crate::registry::Registry;

/// Which membership slot of a context a list threads through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ListTag {
    Ready,
    Terminated,
    Wait,
}

/// One membership slot embedded in a context.
#[derive(Debug)]
pub(crate) struct Link {
    prev: Cell<FiberId>,
    next: Cell<FiberId>,
    linked: Cell<bool>,
}

impl Link {
    pub(crate) fn new() -> Link {
        Link {
            prev: Cell::new(FiberId::invalid()),
            next: Cell::new(FiberId::invalid()),
            linked: Cell::new(false),
        }
    }

    pub(crate) fn is_linked(&self) -> bool {
        self.linked.get()
    }

    fn reset(&self) {
        self.prev.set(FiberId::invalid());
        self.next.set(FiberId::invalid());
        self.linked.set(false);
    }
}

/// A FIFO list of contexts threaded through one tagged link slot.
#[derive(Debug)]
pub(crate) struct FiberList {
    tag: ListTag,
    head: Cell<FiberId>,
    tail: Cell<FiberId>,
    len: Cell<usize>,
}

impl FiberList {
    pub(crate) fn new(tag: ListTag) -> FiberList {
        FiberList {
            tag,
            head: Cell::new(FiberId::invalid()),
            tail: Cell::new(FiberId::invalid()),
            len: Cell::new(0),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len.get() == 0
    }

    pub(crate) fn len(&self) -> usize {
        self.len.get()
    }

    fn link_of<'a>(&self, reg: &'a Registry, id: FiberId) -> &'a Link {
        reg.get(id)
            .unwrap_or_else(|| panic!("context {} not registered", id))
            .link(self.tag)
    }

    /// Append `id`. Linking a context that is already on a list threaded
    /// through the same slot is a usage bug.
    pub(crate) fn push_back(&self, reg: &Registry, id: FiberId) {
        let link = self.link_of(reg, id);
        assert!(!link.is_linked(), "context {} already linked", id);

        link.prev.set(self.tail.get());
        link.next.set(FiberId::invalid());
        link.linked.set(true);

        let tail = self.tail.get();
        if tail.is_valid() {
            self.link_of(reg, tail).next.set(id);
        } else {
            self.head.set(id);
        }
        self.tail.set(id);
        self.len.set(self.len.get() + 1);
    }

    /// Detach and return the oldest member.
    pub(crate) fn pop_front(&self, reg: &Registry) -> Option<FiberId> {
        let id = self.head.get();
        if !id.is_valid() {
            return None;
        }
        let link = self.link_of(reg, id);
        let next = link.next.get();
        link.reset();

        self.head.set(next);
        if next.is_valid() {
            self.link_of(reg, next).prev.set(FiberId::invalid());
        } else {
            self.tail.set(FiberId::invalid());
        }
        self.len.set(self.len.get() - 1);
        Some(id)
    }

    /// Splice `id` out of the middle of the list. Used by collaborators
    /// that give up a wait before the target wakes them.
    pub(crate) fn remove(&self, reg: &Registry, id: FiberId) {
        let link = self.link_of(reg, id);
        assert!(link.is_linked(), "context {} not on this list", id);

        let prev = link.prev.get();
        let next = link.next.get();
        link.reset();

        if prev.is_valid() {
            self.link_of(reg, prev).next.set(next);
        } else {
            self.head.set(next);
        }
        if next.is_valid() {
            self.link_of(reg, next).prev.set(prev);
        } else {
            self.tail.set(prev);
        }
        self.len.set(self.len.get() - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextCell;
    use crate::handle::Fiber;

    fn registered(reg: &Registry, n: usize) -> Vec<FiberId> {
        (0..n)
            .map(|_| reg.insert(Fiber::new_main_for_test()))
            .collect()
    }

    fn unregister(reg: &Registry, ids: &[FiberId]) {
        for &id in ids {
            drop(reg.remove(id));
        }
    }

    #[test]
    fn push_pop_is_fifo() {
        let reg = Registry::new();
        let ids = registered(&reg, 3);
        let list = FiberList::new(ListTag::Ready);

        for &id in &ids {
            list.push_back(&reg, id);
        }
        assert_eq!(list.len(), 3);
        assert!(reg.get(ids[1]).unwrap().ready_is_linked());

        assert_eq!(list.pop_front(&reg), Some(ids[0]));
        assert_eq!(list.pop_front(&reg), Some(ids[1]));
        assert_eq!(list.pop_front(&reg), Some(ids[2]));
        assert_eq!(list.pop_front(&reg), None);
        assert!(!reg.get(ids[1]).unwrap().ready_is_linked());

        unregister(&reg, &ids);
    }

    #[test]
    fn remove_from_middle() {
        let reg = Registry::new();
        let ids = registered(&reg, 4);
        let list = FiberList::new(ListTag::Wait);

        for &id in &ids {
            list.push_back(&reg, id);
        }
        list.remove(&reg, ids[1]);
        list.remove(&reg, ids[3]); // tail
        assert_eq!(list.len(), 2);

        assert_eq!(list.pop_front(&reg), Some(ids[0]));
        assert_eq!(list.pop_front(&reg), Some(ids[2]));
        assert!(list.is_empty());

        unregister(&reg, &ids);
    }

    #[test]
    #[should_panic(expected = "already linked")]
    fn double_link_is_fatal() {
        let reg = Registry::new();
        let ids = registered(&reg, 1);
        let list = FiberList::new(ListTag::Terminated);
        list.push_back(&reg, ids[0]);
        list.push_back(&reg, ids[0]);
    }

    #[test]
    fn slots_are_independent() {
        let reg = Registry::new();
        let ids = registered(&reg, 2);
        let ready = FiberList::new(ListTag::Ready);
        let wait = FiberList::new(ListTag::Wait);

        ready.push_back(&reg, ids[0]);
        wait.push_back(&reg, ids[0]);
        let cell: &ContextCell = reg.get(ids[0]).unwrap();
        assert!(cell.ready_is_linked());
        assert!(cell.wait_is_linked());

        assert_eq!(ready.pop_front(&reg), Some(ids[0]));
        assert!(!cell.ready_is_linked());
        assert!(cell.wait_is_linked());
        assert_eq!(wait.pop_front(&reg), Some(ids[0]));

        unregister(&reg, &ids);
    }
}
