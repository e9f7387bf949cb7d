//! The context arena: stable ids to control blocks.

use std::cell::RefCell;
use std::fmt;
use std::ptr::NonNull;

use slab::Slab;

use crate::context::ContextCell;
use crate::handle::Fiber;
use crate::id::FiberId;

/// Arena of registered contexts, indexed by [`FiberId`].
///
/// Each occupied slot holds one strong handle on behalf of the scheduler;
/// removing the slot gives that handle back. The control blocks themselves
/// never move — they live at the top of their own stacks (or in a box, for
/// the main context) — so a slot only stores the pointer.
pub(crate) struct Registry {
    slots: RefCell<Slab<NonNull<ContextCell>>>,
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry {
            slots: RefCell::new(Slab::new()),
        }
    }

    /// Register a context, assigning its id. The registry keeps the strong
    /// count `fiber` carried.
    pub(crate) fn insert(&self, fiber: Fiber) -> FiberId {
        let ptr = fiber.into_raw();
        let key = self.slots.borrow_mut().insert(ptr);
        let id = FiberId::new(key);
        unsafe { ptr.as_ref() }.set_id(id);
        id
    }

    /// Drop a context's slot, returning the strong handle it held.
    pub(crate) fn remove(&self, id: FiberId) -> Option<Fiber> {
        if !id.is_valid() {
            return None;
        }
        let mut slots = self.slots.borrow_mut();
        if !slots.contains(id.slot()) {
            return None;
        }
        let ptr = slots.remove(id.slot());
        Some(unsafe { Fiber::from_raw(ptr) })
    }

    /// Look up a registered context.
    ///
    /// The borrow is tied to the registry, not the slot: callers must not
    /// hold it across a removal of the same entry.
    pub(crate) fn get(&self, id: FiberId) -> Option<&ContextCell> {
        if !id.is_valid() {
            return None;
        }
        let ptr = self.slots.borrow().get(id.slot()).copied()?;
        Some(unsafe { &*ptr.as_ptr() })
    }

    pub(crate) fn ids(&self) -> Vec<FiberId> {
        self.slots
            .borrow()
            .iter()
            .map(|(key, _)| FiberId::new(key))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.borrow().len()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("len", &self.len()).finish()
    }
}
