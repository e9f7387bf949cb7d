//! Low-level stack switching.
//!
//! A switch saves the callee-saved register set of the running context and
//! restores the target's; everything else is covered by the C calling
//! convention at the call site. Only x86_64 System V is implemented.

use std::cell::UnsafeCell;
use std::fmt;

#[cfg(not(target_arch = "x86_64"))]
compile_error!("strand only supports x86_64");

/// Callee-saved register set of the System V AMD64 ABI.
#[repr(C)]
#[derive(Debug, Default)]
struct Registers {
    rsp: u64,
    rbp: u64,
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
}

/// Switch execution from one register set to another.
///
/// Spills the callee-saved registers into `save`, restores them from
/// `load`, and `ret`s on the restored stack. Returns only when some later
/// switch restores `save`.
///
/// # Safety
///
/// Both pointers must be valid; `load` must hold either state captured by a
/// previous switch or a frame built by [`ExecutionState::prepare`].
#[unsafe(naked)]
unsafe extern "C" fn switch_registers(_save: *mut Registers, _load: *const Registers) {
    std::arch::naked_asm!(
        // save callee-saved registers into `save` (rdi)
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        // load callee-saved registers from `load` (rsi)
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        // a fresh frame pops the trampoline address; a suspended one
        // returns into its pending switch call
        "ret",
    );
}

/// First code a fresh fiber executes. The initial frame leaves the control
/// block pointer in r12; move it into the first argument register and enter
/// the fiber body, which never returns.
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    std::arch::naked_asm!(
        "mov rdi, r12",
        "call {entry}",
        "ud2",
        entry = sym crate::context::fiber_entry,
    );
}

/// The resumable machine state of one context.
///
/// For the main context the registers start empty and are first filled when
/// it switches away; for dispatcher and worker contexts
/// [`prepare`](ExecutionState::prepare) builds an initial frame on the
/// fiber's own stack.
pub(crate) struct ExecutionState {
    regs: UnsafeCell<Registers>,
}

impl ExecutionState {
    /// Empty state for a context that is already running on its stack; the
    /// registers are first captured when it switches away.
    pub(crate) fn empty() -> ExecutionState {
        ExecutionState {
            regs: UnsafeCell::new(Registers::default()),
        }
    }

    /// Build the initial frame so the first switch into this state enters
    /// [`fiber_trampoline`] on the given stack with `cell` in r12.
    ///
    /// # Safety
    ///
    /// `stack_top` must be the high end of a writable stack region with at
    /// least 16 bytes of headroom below it.
    pub(crate) unsafe fn prepare(stack_top: *mut u8, cell: *mut u8) -> ExecutionState {
        // After the switch `ret`s, rsp must be 16-byte aligned so the
        // trampoline's `call` leaves the stack in the ABI-required state.
        let aligned = (stack_top as usize) & !15;
        let sp = aligned - 8;
        *(sp as *mut u64) = fiber_trampoline as *const () as u64;

        let mut regs = Registers::default();
        regs.rsp = sp as u64;
        regs.r12 = cell as u64;
        ExecutionState {
            regs: UnsafeCell::new(regs),
        }
    }

    /// Transfer control into this state, saving the caller's state into
    /// `from`. Returns when `from` is later switched back to.
    ///
    /// # Safety
    ///
    /// `self` must hold resumable state, `from` must be the state of the
    /// context executing this call, and the two must be distinct.
    pub(crate) unsafe fn switch_to(&self, from: &ExecutionState) {
        debug_assert!(!std::ptr::eq(self, from));
        switch_registers(from.regs.get(), self.regs.get());
    }
}

impl fmt::Debug for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionState").finish()
    }
}
