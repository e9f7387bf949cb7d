use derive_more::Display;

/// Errors surfaced while setting up a fiber.
///
/// Usage violations (resuming a terminated fiber, self-join and the like)
/// are bugs in the calling runtime and panic instead; only resource
/// exhaustion from the stack allocator is reported as a value.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// The stack allocator could not produce a region.
    #[display(fmt = "fiber stack allocation of {} bytes failed", _0)]
    StackAllocation(usize),

    /// The allocated region cannot hold the control block plus a usable
    /// stack. Carries the region size and the minimum required.
    #[display(fmt = "fiber stack of {} bytes below minimum of {}", _0, _1)]
    StackTooSmall(usize, usize),
}

impl std::error::Error for SpawnError {}
