//! Owned handles to fiber contexts.

use std::fmt;
use std::ptr::NonNull;

use crate::context::{ContextCell, Role};
use crate::id::FiberId;

/// A strong handle to a fiber context.
///
/// Every clone bumps the context's atomic handle count; dropping the last
/// handle destroys the control block (and, for dispatcher and worker
/// contexts, returns the stack it was carved from). The scheduler's
/// registry holds one handle of its own until the fiber is reaped, so a
/// context is never freed out from under the runtime.
///
/// Handles are deliberately not `Send`: everything but the counters and
/// flags belongs to the scheduler's thread.
pub struct Fiber {
    ptr: NonNull<ContextCell>,
}

impl Fiber {
    /// Adopt a raw cell pointer together with one strong count.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live cell, and the caller must transfer
    /// exactly one strong count for the handle to take over.
    pub(crate) unsafe fn from_raw(ptr: NonNull<ContextCell>) -> Fiber {
        Fiber { ptr }
    }

    /// Give up this handle without dropping its strong count.
    pub(crate) fn into_raw(self) -> NonNull<ContextCell> {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }

    pub(crate) fn cell(&self) -> &ContextCell {
        unsafe { self.ptr.as_ref() }
    }

    /// Identity of this fiber.
    pub fn id(&self) -> FiberId {
        self.cell().id()
    }

    /// Whether the fiber has finished for good.
    pub fn is_terminated(&self) -> bool {
        self.cell().is_terminated()
    }

    /// Whether this is a thread's main context.
    pub fn is_main_context(&self) -> bool {
        self.cell().is_main_context()
    }

    /// Whether this is a scheduler's dispatcher context.
    pub fn is_dispatcher_context(&self) -> bool {
        self.cell().is_dispatcher_context()
    }

    /// Whether this is an ordinary worker fiber.
    pub fn is_worker_context(&self) -> bool {
        self.cell().is_worker_context()
    }

    /// What this context is for.
    pub fn role(&self) -> Role {
        self.cell().role()
    }

    /// Whether the fiber is queued on its scheduler's ready list.
    pub fn is_ready_linked(&self) -> bool {
        self.cell().ready_is_linked()
    }

    /// Whether the fiber is parked on some peer's wait list.
    ///
    /// Read-only: removing a parked fiber from its wait list is an
    /// operation of the scheduler's collaborators, not of handles.
    pub fn is_wait_linked(&self) -> bool {
        self.cell().wait_is_linked()
    }

    /// Block the calling context until this fiber terminates.
    ///
    /// Returns immediately if it already has; otherwise the caller is
    /// parked on this fiber's wait list and suspended until the terminal
    /// transition wakes it. Joining a fiber from itself is a fatal usage
    /// error.
    pub fn join(&self) {
        self.cell().join()
    }

    /// Number of strong handles currently outstanding, including the
    /// scheduler's registry entry while the fiber is registered.
    pub fn handle_count(&self) -> usize {
        self.cell().handle_count()
    }

    #[cfg(test)]
    pub(crate) fn new_main_for_test() -> Fiber {
        let boxed = ContextCell::new_main();
        let ptr = NonNull::new(Box::into_raw(boxed)).expect("box was null");
        unsafe { Fiber::from_raw(ptr) }
    }
}

impl Clone for Fiber {
    fn clone(&self) -> Fiber {
        self.cell().attach();
        Fiber { ptr: self.ptr }
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if self.cell().detach() {
            unsafe { ContextCell::destroy(self.ptr) };
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
