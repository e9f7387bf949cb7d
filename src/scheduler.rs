//! A single-threaded, cooperative FIFO scheduler.
//!
//! The scheduler owns the context registry and the ready and terminated
//! lists; contexts themselves only carry membership slots and a
//! back-pointer. Exactly one scheduler runs per thread, and exactly one
//! context is active on that thread at any instant. Ready-queue policy here
//! is plain FIFO; anything smarter belongs in a different scheduler, not in
//! the context core.

use std::cell::Cell;
use std::fmt;
use std::ptr::{self, NonNull};

use crate::context::{self, ContextCell, Role};
use crate::error::SpawnError;
use crate::handle::Fiber;
use crate::id::FiberId;
use crate::list::{FiberList, ListTag};
use crate::registry::Registry;
use crate::stack::{FixedSizeStack, StackAllocator};

/// Driver of a thread's fibers.
///
/// Created on a thread's main context; spawns worker fibers and runs them
/// until quiescence. Dropping the scheduler tears down every context it
/// still owns, including fibers that never got to run.
pub struct Scheduler {
    // boxed so context back-references stay valid if the handle moves
    inner: Box<SchedulerInner>,
}

pub(crate) struct SchedulerInner {
    registry: Registry,
    ready: FiberList,
    terminated: FiberList,
    main: Cell<FiberId>,
    dispatcher: Cell<FiberId>,
}

impl Scheduler {
    /// Set up a scheduler on the calling thread, wrapping the thread's own
    /// stack as the main context and allocating a default-sized stack for
    /// the dispatcher.
    pub fn new() -> Result<Scheduler, SpawnError> {
        Scheduler::with_dispatcher_stack(FixedSizeStack::default())
    }

    /// Like [`new`](Scheduler::new), with a caller-chosen allocator for the
    /// dispatcher stack.
    pub fn with_dispatcher_stack<A>(alloc: A) -> Result<Scheduler, SpawnError>
    where
        A: StackAllocator + 'static,
    {
        assert!(
            context::active().is_none(),
            "a scheduler is already running on this thread"
        );

        let inner = Box::new(SchedulerInner {
            registry: Registry::new(),
            ready: FiberList::new(ListTag::Ready),
            terminated: FiberList::new(ListTag::Terminated),
            main: Cell::new(FiberId::invalid()),
            dispatcher: Cell::new(FiberId::invalid()),
        });
        let inner_ptr = NonNull::from(&*inner);

        let main_cell = ContextCell::new_main();
        let main_ptr = NonNull::new(Box::into_raw(main_cell)).expect("box was null");
        let main = unsafe { Fiber::from_raw(main_ptr) };
        main.cell().set_scheduler(inner_ptr);
        let main_id = inner.registry.insert(main);
        inner.main.set(main_id);
        context::set_active(Some(main_ptr));

        let loop_ptr = inner_ptr;
        let entry: Box<dyn FnOnce()> = Box::new(move || {
            unsafe { loop_ptr.as_ref() }.dispatch();
        });
        let cell = match ContextCell::new_on_stack(Role::Dispatcher, Box::new(alloc), entry) {
            Ok(cell) => cell,
            Err(err) => {
                context::set_active(None);
                inner.shutdown();
                return Err(err);
            }
        };
        let dispatcher = unsafe { Fiber::from_raw(cell) };
        dispatcher.cell().set_scheduler(inner_ptr);
        let dispatcher_id = inner.registry.insert(dispatcher);
        inner.dispatcher.set(dispatcher_id);

        trace!("scheduler up: main {}, dispatcher {}", main_id, dispatcher_id);
        Ok(Scheduler { inner })
    }

    /// Create a worker fiber running `f` and mark it ready.
    pub fn spawn<F>(&self, f: F) -> Result<Fiber, SpawnError>
    where
        F: FnOnce() + 'static,
    {
        self.spawn_with_stack(FixedSizeStack::default(), f)
    }

    /// Create a worker fiber on a stack from a caller-chosen allocator.
    pub fn spawn_with_stack<A, F>(&self, alloc: A, f: F) -> Result<Fiber, SpawnError>
    where
        A: StackAllocator + 'static,
        F: FnOnce() + 'static,
    {
        let cell = ContextCell::new_on_stack(Role::Worker, Box::new(alloc), Box::new(f))?;
        let fiber = unsafe { Fiber::from_raw(cell) };
        fiber.cell().set_scheduler(NonNull::from(&*self.inner));

        let handle = fiber.clone();
        let id = self.inner.registry.insert(fiber);
        self.inner.ready.push_back(&self.inner.registry, id);
        trace!("spawned worker {}", id);
        Ok(handle)
    }

    /// Resume the dispatcher until no fiber remains runnable, then return.
    /// Must be called from the main context.
    pub fn run(&self) {
        let active = context::active().expect("no active context on this thread");
        let main = self
            .inner
            .registry
            .get(self.inner.main.get())
            .expect("main context vanished");
        assert!(
            ptr::eq(active.as_ptr(), main as *const ContextCell as *mut ContextCell),
            "run() must be called from the main context"
        );
        self.inner.suspend_active();
    }

    /// Identity of the context currently executing on this thread.
    pub fn active_id(&self) -> FiberId {
        context::active()
            .map(|ptr| unsafe { ptr.as_ref() }.id())
            .unwrap_or_default()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(active) = context::active() {
            let main = self.inner.registry.get(self.inner.main.get());
            assert!(
                main.map(|m| ptr::eq(active.as_ptr(), m as *const ContextCell as *mut ContextCell))
                    .unwrap_or(false),
                "scheduler dropped off the main context"
            );
        }
        trace!("scheduler shutting down");
        context::set_active(None);
        self.inner.shutdown();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("contexts", &self.inner.registry.len())
            .field("ready", &self.inner.ready.len())
            .finish()
    }
}

impl SchedulerInner {
    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Put a context at the back of the ready queue.
    pub(crate) fn make_ready(&self, id: FiberId) {
        self.ready.push_back(&self.registry, id);
    }

    /// Park the active context and hand control to the dispatcher. Control
    /// returns here once the caller is resumed again.
    pub(crate) fn suspend_active(&self) {
        let dispatcher = self
            .registry
            .get(self.dispatcher.get())
            .expect("dispatcher context vanished");
        dispatcher.resume();
    }

    /// Terminal transition of the active context: queue it for reaping and
    /// leave its stack for good. The registry's strong handle is dropped
    /// later, on the dispatcher stack, never on the dying fiber's own.
    pub(crate) fn transition_terminated(&self, cell: &ContextCell) -> ! {
        self.terminated.push_back(&self.registry, cell.id());
        self.suspend_active();
        unreachable!("terminated context resumed")
    }

    /// The dispatcher control loop.
    fn dispatch(&self) {
        loop {
            if let Some(next) = self.ready.pop_front(&self.registry) {
                let cell = self.registry.get(next).expect("ready context vanished");
                trace!("dispatch {}", next);
                cell.resume();
                continue;
            }

            self.reap();

            let main = self
                .registry
                .get(self.main.get())
                .expect("main context vanished");
            if main.wait_is_linked() {
                panic!("deadlock: main context blocked with no runnable fibers");
            }
            trace!("dispatcher idle");
            main.resume();
        }
    }

    /// Phase two of teardown: drop the registry's handle for every fiber on
    /// the terminated list.
    fn reap(&self) {
        while let Some(id) = self.terminated.pop_front(&self.registry) {
            trace!("reap {}", id);
            drop(self.registry.remove(id));
        }
    }

    /// Unlink and drop every context this scheduler still owns.
    fn shutdown(&self) {
        while self.ready.pop_front(&self.registry).is_some() {}
        while self.terminated.pop_front(&self.registry).is_some() {}

        let ids = self.registry.ids();
        // every parked context removes itself from its peer's wait list,
        // which empties all wait lists before anything is destroyed
        for &id in &ids {
            if let Some(cell) = self.registry.get(id) {
                cell.wait_unlink(&self.registry);
                cell.clear_scheduler();
            }
        }
        for id in ids {
            drop(self.registry.remove(id));
        }
    }
}

/// Give up the processor: requeue the calling fiber at the back of its
/// scheduler's ready list and suspend until dispatched again.
pub fn yield_now() {
    let ptr = context::active().expect("yield_now with no active context on this thread");
    let cell = unsafe { ptr.as_ref() };
    let sched = unsafe { cell.scheduler().as_ref() };
    sched.make_ready(cell.id());
    sched.suspend_active();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn worker_runs_to_completion() {
        let sched = Scheduler::new().unwrap();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let a = sched.spawn(move || h.set(h.get() + 1)).unwrap();
        assert!(!a.is_terminated());
        assert!(a.is_worker_context());
        sched.run();
        assert!(a.is_terminated());
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn join_from_main_blocks_until_termination() {
        let sched = Scheduler::new().unwrap();
        let a = sched.spawn(|| yield_now()).unwrap();
        a.join();
        assert!(a.is_terminated());
    }

    #[test]
    fn join_on_terminated_adds_no_wait_membership() {
        let sched = Scheduler::new().unwrap();
        let a = sched.spawn(|| {}).unwrap();
        sched.run();
        assert!(a.is_terminated());

        a.join();
        let main = sched.inner.registry.get(sched.inner.main.get()).unwrap();
        assert!(!main.wait_is_linked());
        assert!(a.cell().waiters().is_empty());
    }

    #[test]
    fn wake_order_matches_join_order() {
        let sched = Scheduler::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let target = sched.spawn(|| yield_now()).unwrap();
        for i in 0..3 {
            let t = target.clone();
            let o = order.clone();
            sched
                .spawn(move || {
                    t.join();
                    o.borrow_mut().push(i);
                })
                .unwrap();
        }
        sched.run();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn refcount_through_lifecycle() {
        let sched = Scheduler::new().unwrap();
        let a = sched.spawn(|| {}).unwrap();
        // one handle here, one in the registry
        assert_eq!(a.handle_count(), 2);
        sched.run();
        // reaped: only the user handle remains, cell still readable
        assert_eq!(a.handle_count(), 1);
        let b = a.clone();
        assert_eq!(a.handle_count(), 2);
        drop(b);
        assert_eq!(a.handle_count(), 1);
    }

    #[test]
    fn active_identity_tracks_execution() {
        let sched = Scheduler::new().unwrap();
        assert_eq!(sched.active_id(), sched.inner.main.get());

        let seen = Rc::new(Cell::new(FiberId::invalid()));
        let s = seen.clone();
        let a = sched
            .spawn(move || {
                let active = context::active().expect("fiber body has an active context");
                s.set(unsafe { active.as_ref() }.id());
            })
            .unwrap();
        let a_id = a.id();
        sched.run();
        assert_eq!(seen.get(), a_id);
        assert_eq!(sched.active_id(), sched.inner.main.get());
    }

    #[test]
    fn unstarted_fibers_are_dropped_on_shutdown() {
        let dropped = Rc::new(Cell::new(false));
        let d = dropped.clone();
        struct Guard(Rc<Cell<bool>>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }
        let guard = Guard(d);
        {
            let sched = Scheduler::new().unwrap();
            let _a = sched.spawn(move || drop(guard)).unwrap();
            // scheduler dropped without ever running the fiber
        }
        assert!(dropped.get());
    }

    #[test]
    #[should_panic(expected = "joined itself")]
    fn self_join_is_fatal() {
        let sched = Scheduler::new().unwrap();
        let main = sched.inner.registry.get(sched.inner.main.get()).unwrap();
        main.join();
    }

    #[test]
    #[should_panic(expected = "already running")]
    fn one_scheduler_per_thread() {
        let _a = Scheduler::new().unwrap();
        let _b = Scheduler::new();
    }
}
