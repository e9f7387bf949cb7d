//! The fiber control block and its lifecycle.
//!
//! A `ContextCell` describes one cooperatively scheduled execution context.
//! For dispatcher and worker roles the cell is written in place at the
//! 64-byte-aligned high end of the fiber's own stack allocation, so control
//! block and stack are a single allocation; tearing the cell down also
//! returns that allocation, which is why teardown may only run while the
//! fiber is *not* executing (see [`ContextCell::destroy`]).

use std::cell::Cell;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicU8, AtomicUsize, Ordering};

use bitflags::bitflags;

use crate::error::SpawnError;
use crate::id::FiberId;
use crate::list::{FiberList, Link, ListTag};
use crate::registry::Registry;
use crate::scheduler::SchedulerInner;
use crate::stack::{carve, StackAllocator, StackRegion, CONTROL_ALIGN};
use crate::switch::ExecutionState;

/// What a context is for. Fixed at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// The thread's original, pre-existing stack.
    Main,
    /// The scheduler's internal control-loop fiber.
    Dispatcher,
    /// An ordinary spawned fiber.
    Worker,
}

bitflags! {
    struct Flags: u8 {
        /// Set exactly once by the running context itself, just before it
        /// stops running for the last time. Never cleared.
        const TERMINATED = 0b0000_0001;
        /// The terminal wake-joiners step has run.
        const RELEASED   = 0b0000_0010;
    }
}

/// Backing stack allocation of a dispatcher or worker context.
struct StackOwner {
    region: StackRegion,
    alloc: Box<dyn StackAllocator>,
}

/// Control block of one fiber context.
pub(crate) struct ContextCell {
    role: Role,
    flags: AtomicU8,
    /// Outstanding strong handles: the registry entry plus user handles.
    handles: AtomicUsize,
    id: Cell<FiberId>,
    /// Non-owning back-reference to the scheduler driving this context.
    sched: Cell<Option<NonNull<SchedulerInner>>>,
    exec: ExecutionState,
    /// Peers blocked in a join on this context, in arrival order.
    waiters: FiberList,
    /// Whose wait list this context is parked on, if any.
    waiting_on: Cell<FiberId>,
    ready_link: Link,
    terminated_link: Link,
    wait_link: Link,
    /// Entry closure of a worker or dispatcher that has not started yet.
    entry: Cell<Option<Box<dyn FnOnce()>>>,
    stack: Cell<Option<StackOwner>>,
}

thread_local! {
    /// The context currently executing on this thread.
    static ACTIVE: Cell<Option<NonNull<ContextCell>>> = Cell::new(None);
}

/// The context presently executing on the calling thread.
pub(crate) fn active() -> Option<NonNull<ContextCell>> {
    ACTIVE.with(|cell| cell.get())
}

pub(crate) fn set_active(ctx: Option<NonNull<ContextCell>>) {
    ACTIVE.with(|cell| cell.set(ctx));
}

impl ContextCell {
    fn bare(role: Role) -> ContextCell {
        ContextCell {
            role,
            flags: AtomicU8::new(0),
            handles: AtomicUsize::new(1),
            id: Cell::new(FiberId::invalid()),
            sched: Cell::new(None),
            exec: ExecutionState::empty(),
            waiters: FiberList::new(ListTag::Wait),
            waiting_on: Cell::new(FiberId::invalid()),
            ready_link: Link::new(),
            terminated_link: Link::new(),
            wait_link: Link::new(),
            entry: Cell::new(None),
            stack: Cell::new(None),
        }
    }

    /// Control block for the thread's main context. Wraps the thread's own
    /// stack, so there is nothing to allocate or carve.
    pub(crate) fn new_main() -> Box<ContextCell> {
        Box::new(ContextCell::bare(Role::Main))
    }

    /// Build a dispatcher or worker control block in place at the aligned
    /// high end of a freshly allocated stack, handing the remainder of the
    /// region to the switch primitive as the usable stack.
    pub(crate) fn new_on_stack(
        role: Role,
        alloc: Box<dyn StackAllocator>,
        entry: Box<dyn FnOnce()>,
    ) -> Result<NonNull<ContextCell>, SpawnError> {
        debug_assert!(role != Role::Main);
        debug_assert!(mem::align_of::<ContextCell>() <= CONTROL_ALIGN);

        let region = alloc.allocate()?;
        let layout = match carve(region, mem::size_of::<ContextCell>()) {
            Ok(layout) => layout,
            Err(err) => {
                unsafe { alloc.deallocate(region) };
                return Err(err);
            }
        };

        let cell_ptr = layout.ctrl.as_ptr() as *mut ContextCell;
        let mut cell = ContextCell::bare(role);
        cell.entry.set(Some(entry));
        cell.stack.set(Some(StackOwner { region, alloc }));
        unsafe {
            let stack_top = layout.stack_base.as_ptr().add(layout.stack_size);
            cell.exec = ExecutionState::prepare(stack_top, cell_ptr as *mut u8);
            ptr::write(cell_ptr, cell);
        }
        Ok(unsafe { NonNull::new_unchecked(cell_ptr) })
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn is_main_context(&self) -> bool {
        self.role == Role::Main
    }

    pub(crate) fn is_dispatcher_context(&self) -> bool {
        self.role == Role::Dispatcher
    }

    pub(crate) fn is_worker_context(&self) -> bool {
        self.role == Role::Worker
    }

    pub(crate) fn is_terminated(&self) -> bool {
        Flags::from_bits_truncate(self.flags.load(Ordering::Acquire)).contains(Flags::TERMINATED)
    }

    fn set_terminated(&self) {
        let prev = self.flags.fetch_or(Flags::TERMINATED.bits(), Ordering::AcqRel);
        assert!(
            prev & Flags::TERMINATED.bits() == 0,
            "context {} terminated twice",
            self.id.get()
        );
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id.get()
    }

    pub(crate) fn set_id(&self, id: FiberId) {
        self.id.set(id);
    }

    /// Bind this context to its scheduler. Set once; rebinding (migration)
    /// is outside this core.
    pub(crate) fn set_scheduler(&self, sched: NonNull<SchedulerInner>) {
        assert!(
            self.sched.get().is_none(),
            "context {} already bound to a scheduler",
            self.id.get()
        );
        self.sched.set(Some(sched));
    }

    pub(crate) fn scheduler(&self) -> NonNull<SchedulerInner> {
        self.sched
            .get()
            .unwrap_or_else(|| panic!("context {} has no scheduler", self.id.get()))
    }

    pub(crate) fn clear_scheduler(&self) {
        self.sched.set(None);
    }

    pub(crate) fn link(&self, tag: ListTag) -> &Link {
        match tag {
            ListTag::Ready => &self.ready_link,
            ListTag::Terminated => &self.terminated_link,
            ListTag::Wait => &self.wait_link,
        }
    }

    pub(crate) fn ready_is_linked(&self) -> bool {
        self.ready_link.is_linked()
    }

    pub(crate) fn wait_is_linked(&self) -> bool {
        self.wait_link.is_linked()
    }

    pub(crate) fn waiters(&self) -> &FiberList {
        &self.waiters
    }

    /// Take one more strong handle.
    pub(crate) fn attach(&self) {
        self.handles.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one strong handle; returns `true` when it was the last one and
    /// the cell must be destroyed.
    pub(crate) fn detach(&self) -> bool {
        if self.handles.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }

    pub(crate) fn handle_count(&self) -> usize {
        self.handles.load(Ordering::Relaxed)
    }

    /// Transfer control into this context.
    ///
    /// Publishes the thread-local active pointer, switches stacks, and
    /// restores the caller as active when control eventually returns to
    /// this frame. Returns only when this context later suspends back,
    /// directly or transitively through the scheduler.
    pub(crate) fn resume(&self) {
        assert!(
            !self.is_terminated(),
            "resumed terminated context {}",
            self.id.get()
        );
        let prev = active().expect("resume with no active context on this thread");
        assert!(
            !ptr::eq(prev.as_ptr(), self as *const ContextCell as *mut ContextCell),
            "context {} resumed itself",
            self.id.get()
        );

        struct Restore(NonNull<ContextCell>);
        impl Drop for Restore {
            fn drop(&mut self) {
                set_active(Some(self.0));
            }
        }

        set_active(Some(NonNull::from(self)));
        let _restore = Restore(prev);
        unsafe {
            self.exec.switch_to(&prev.as_ref().exec);
        }
    }

    /// Wake every joiner parked on this context, in the order they queued.
    /// Called exactly once, by the terminating context itself; a second
    /// call is a usage bug.
    pub(crate) fn release(&self, sched: &SchedulerInner) {
        let prev = self.flags.fetch_or(Flags::RELEASED.bits(), Ordering::AcqRel);
        assert!(
            prev & Flags::RELEASED.bits() == 0,
            "context {} released twice",
            self.id.get()
        );
        while let Some(waiter) = self.waiters.pop_front(sched.registry()) {
            if let Some(cell) = sched.registry().get(waiter) {
                cell.waiting_on.set(FiberId::invalid());
            }
            trace!("context {} wakes {}", self.id.get(), waiter);
            sched.make_ready(waiter);
        }
    }

    /// Block the calling context until this one terminates. Returns
    /// immediately if it already has.
    pub(crate) fn join(&self) {
        if self.is_terminated() {
            return;
        }
        let caller_ptr = active().expect("join with no active context on this thread");
        let caller = unsafe { caller_ptr.as_ref() };
        assert!(
            !ptr::eq(caller as *const ContextCell, self as *const ContextCell),
            "context {} joined itself",
            self.id.get()
        );
        let sched_ptr = self.scheduler();
        assert!(
            caller.scheduler() == sched_ptr,
            "context {} joined across schedulers",
            self.id.get()
        );
        let sched = unsafe { sched_ptr.as_ref() };

        caller.waiting_on.set(self.id.get());
        self.waiters.push_back(sched.registry(), caller.id.get());
        trace!("context {} waits on {}", caller.id.get(), self.id.get());
        sched.suspend_active();
        debug_assert!(self.is_terminated());
    }

    /// Remove this context from whatever wait list it is parked on.
    ///
    /// Collaborators implementing timed waits call this when they give up
    /// before the target terminates, then make the context ready again
    /// themselves.
    pub(crate) fn wait_unlink(&self, reg: &Registry) {
        let target = self.waiting_on.replace(FiberId::invalid());
        if target.is_valid() {
            if let Some(peer) = reg.get(target) {
                peer.waiters.remove(reg, self.id.get());
            }
        }
        debug_assert!(!self.wait_link.is_linked());
    }

    /// Tear down a cell whose last handle was just dropped.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`new_main`](ContextCell::new_main) or
    /// [`new_on_stack`](ContextCell::new_on_stack), its strong count must
    /// have reached zero, and no other reference to the cell may remain.
    pub(crate) unsafe fn destroy(ptr: NonNull<ContextCell>) {
        let cell = ptr.as_ref();
        assert!(
            active().map(|a| a.as_ptr()) != Some(ptr.as_ptr()),
            "destroyed the active context"
        );
        assert!(
            !cell.ready_is_linked()
                && !cell.terminated_link.is_linked()
                && !cell.wait_is_linked(),
            "destroyed context {} with live list membership",
            cell.id.get()
        );
        debug_assert!(cell.waiters().is_empty());
        trace!("destroying context {} ({:?})", cell.id.get(), cell.role);

        match cell.role {
            Role::Main => {
                drop(Box::from_raw(ptr.as_ptr()));
            }
            // The cell sits inside the stack it owns: pull the stack out,
            // drop the cell in place, then hand the region back.
            Role::Dispatcher | Role::Worker => {
                let stack = cell.stack.take();
                ptr::drop_in_place(ptr.as_ptr());
                if let Some(owner) = stack {
                    owner.alloc.deallocate(owner.region);
                }
            }
        }
    }
}

/// Body of every dispatcher and worker fiber, entered once through the
/// switch trampoline: run the entry closure, then perform the terminal
/// transition — mark terminated, wake joiners, queue for reaping, and
/// suspend for good.
pub(crate) unsafe extern "C" fn fiber_entry(cell: *mut ContextCell) -> ! {
    let ctx = &*cell;
    trace!("context {} entered", ctx.id.get());

    let entry = ctx.entry.take().expect("fiber entry closure missing");
    // Unwinding off the top of a carved stack is not survivable.
    if catch_unwind(AssertUnwindSafe(move || entry())).is_err() {
        error!("context {} panicked; aborting", ctx.id.get());
        std::process::abort();
    }

    ctx.set_terminated();
    let sched = ctx.scheduler().as_ref();
    ctx.release(sched);
    sched.transition_terminated(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Fiber;
    use crate::stack::FixedSizeStack;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn handle_counting_is_exact() {
        let fiber = Fiber::new_main_for_test();
        assert_eq!(fiber.handle_count(), 1);
        let c1 = fiber.clone();
        let c2 = fiber.clone();
        assert_eq!(fiber.handle_count(), 3);
        drop(c1);
        assert_eq!(fiber.handle_count(), 2);
        drop(c2);
        assert_eq!(fiber.handle_count(), 1);
    }

    #[test]
    fn last_detach_destroys_exactly_once() {
        struct Guard(Rc<Cell<u32>>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let drops = Rc::new(Cell::new(0));
        let guard = Guard(drops.clone());
        let cell = ContextCell::new_on_stack(
            Role::Worker,
            Box::new(FixedSizeStack::default()),
            Box::new(move || drop(guard)),
        )
        .unwrap();
        let fiber = unsafe { Fiber::from_raw(cell) };
        let clone = fiber.clone();

        // the entry closure is dropped with the cell, never having run
        drop(fiber);
        assert_eq!(drops.get(), 0);
        drop(clone);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn control_block_is_aligned_inside_its_stack() {
        let cell = ContextCell::new_on_stack(
            Role::Worker,
            Box::new(FixedSizeStack::default()),
            Box::new(|| {}),
        )
        .unwrap();
        assert_eq!(cell.as_ptr() as usize % CONTROL_ALIGN, 0);
        assert!(mem::align_of::<ContextCell>() <= CONTROL_ALIGN);
        drop(unsafe { Fiber::from_raw(cell) });
    }

    #[test]
    fn worker_layout_accounts_for_control_block() {
        let alloc = FixedSizeStack::default();
        let region = alloc.allocate().unwrap();
        let layout = carve(region, mem::size_of::<ContextCell>()).unwrap();
        assert_eq!(layout.ctrl.as_ptr() as usize % CONTROL_ALIGN, 0);
        assert!(layout.stack_size <= region.size() - mem::size_of::<ContextCell>());
        unsafe { alloc.deallocate(region) };
    }

    #[test]
    fn termination_is_monotonic() {
        let fiber = Fiber::new_main_for_test();
        assert!(!fiber.is_terminated());
        fiber.cell().set_terminated();
        assert!(fiber.is_terminated());
        assert!(fiber.is_terminated());
    }

    #[test]
    #[should_panic(expected = "terminated twice")]
    fn double_termination_is_fatal() {
        let fiber = Fiber::new_main_for_test();
        fiber.cell().set_terminated();
        fiber.cell().set_terminated();
    }

    #[test]
    #[should_panic(expected = "resumed terminated")]
    fn resume_after_termination_is_fatal() {
        let fiber = Fiber::new_main_for_test();
        fiber.cell().set_terminated();
        fiber.cell().resume();
    }

    #[test]
    fn role_predicates() {
        let fiber = Fiber::new_main_for_test();
        assert!(fiber.cell().is_main_context());
        assert!(!fiber.cell().is_dispatcher_context());
        assert!(!fiber.cell().is_worker_context());
        assert_eq!(fiber.cell().role(), Role::Main);
    }
}
