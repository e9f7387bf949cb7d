//! Fiber stack allocation and the control-block carve.

use std::fmt;
use std::ptr::NonNull;

use crate::error::SpawnError;

/// Default usable stack size for dispatcher and worker fibers.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Smallest usable stack size [`FixedSizeStack`] will hand out.
pub(crate) const MIN_STACK_SIZE: usize = 16 * 1024;

/// Guard page mapped `PROT_NONE` below the usable region.
const GUARD_SIZE: usize = 4096;

/// Alignment of the control block carved from the top of a stack region.
pub(crate) const CONTROL_ALIGN: usize = 64;

/// Least usable stack that must remain below the carved control block.
const MIN_USABLE: usize = 4096;

/// A contiguous memory region serving as a fiber stack.
///
/// `base` is the lowest address; the stack grows downward from
/// `base + size`.
#[derive(Debug, Clone, Copy)]
pub struct StackRegion {
    base: NonNull<u8>,
    size: usize,
}

impl StackRegion {
    /// Describe a region handed out by a [`StackAllocator`].
    pub fn new(base: NonNull<u8>, size: usize) -> StackRegion {
        StackRegion { base, size }
    }

    /// Lowest address of the region.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Size of the region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the highest address of the region.
    pub(crate) fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.size) }
    }
}

/// Allocates and releases fiber stacks.
pub trait StackAllocator {
    /// Produce a contiguous region to run a fiber on.
    fn allocate(&self) -> Result<StackRegion, SpawnError>;

    /// Release a region.
    ///
    /// # Safety
    ///
    /// `region` must be exactly a region this allocator produced, no fiber
    /// may still be executing on it, and it must not be released twice.
    unsafe fn deallocate(&self, region: StackRegion);
}

/// `mmap`-backed fixed-size stacks with a `PROT_NONE` guard page at the
/// bottom, so overflow faults instead of silently corrupting memory.
#[derive(Debug, Clone, Copy)]
pub struct FixedSizeStack {
    size: usize,
}

impl FixedSizeStack {
    /// An allocator handing out stacks of `size` usable bytes, clamped to
    /// the supported minimum.
    pub fn new(size: usize) -> FixedSizeStack {
        FixedSizeStack {
            size: size.max(MIN_STACK_SIZE),
        }
    }

    /// The usable size of the stacks this allocator produces.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Default for FixedSizeStack {
    fn default() -> FixedSizeStack {
        FixedSizeStack::new(DEFAULT_STACK_SIZE)
    }
}

impl StackAllocator for FixedSizeStack {
    fn allocate(&self) -> Result<StackRegion, SpawnError> {
        let alloc_size = GUARD_SIZE + self.size;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                alloc_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(SpawnError::StackAllocation(alloc_size));
        }

        let ret = unsafe { libc::mprotect(base, GUARD_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            unsafe { libc::munmap(base, alloc_size) };
            return Err(SpawnError::StackAllocation(alloc_size));
        }

        let usable = unsafe { base.cast::<u8>().add(GUARD_SIZE) };
        Ok(StackRegion::new(
            NonNull::new(usable).expect("mmap returned null"),
            self.size,
        ))
    }

    unsafe fn deallocate(&self, region: StackRegion) {
        let base = region.base().as_ptr().sub(GUARD_SIZE);
        libc::munmap(base.cast(), GUARD_SIZE + region.size());
    }
}

/// Layout of one fiber allocation after the control block has been carved
/// from the high end of its stack region.
pub(crate) struct StackLayout {
    /// Where the control block lives, aligned to [`CONTROL_ALIGN`].
    pub(crate) ctrl: NonNull<u8>,
    /// Usable stack below the control block: `[base, ctrl)`.
    pub(crate) stack_base: NonNull<u8>,
    pub(crate) stack_size: usize,
}

impl fmt::Debug for StackLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackLayout")
            .field("ctrl", &self.ctrl)
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

/// Reserve `ctrl_size` bytes at the aligned high end of `region`, handing
/// back the control slice and the reduced stack below it.
pub(crate) fn carve(region: StackRegion, ctrl_size: usize) -> Result<StackLayout, SpawnError> {
    let top = region.top() as usize;
    let base = region.base().as_ptr() as usize;

    let ctrl = top.checked_sub(ctrl_size).unwrap_or(0) & !(CONTROL_ALIGN - 1);
    if ctrl <= base || ctrl - base < MIN_USABLE {
        return Err(SpawnError::StackTooSmall(
            region.size(),
            ctrl_size + CONTROL_ALIGN + MIN_USABLE,
        ));
    }

    Ok(StackLayout {
        ctrl: NonNull::new(ctrl as *mut u8).expect("carved null control block"),
        stack_base: region.base(),
        stack_size: ctrl - base,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_release() {
        let alloc = FixedSizeStack::new(32 * 1024);
        let region = alloc.allocate().unwrap();
        assert_eq!(region.size(), 32 * 1024);
        // the usable region is writable end to end
        unsafe {
            region.base().as_ptr().write(0xaa);
            region.top().sub(1).write(0xbb);
            alloc.deallocate(region);
        }
    }

    #[test]
    fn sizes_are_clamped() {
        assert_eq!(FixedSizeStack::new(1).size(), MIN_STACK_SIZE);
    }

    #[test]
    fn carve_aligns_and_accounts() {
        let alloc = FixedSizeStack::default();
        let region = alloc.allocate().unwrap();
        let ctrl_size = 472; // an odd extent, like a real control block
        let layout = carve(region, ctrl_size).unwrap();

        assert_eq!(layout.ctrl.as_ptr() as usize % CONTROL_ALIGN, 0);
        // the switch primitive gets strictly less than the allocation,
        // reduced by at least the control extent
        assert!(layout.stack_size + ctrl_size <= region.size());
        assert_eq!(
            layout.stack_base.as_ptr() as usize + layout.stack_size,
            layout.ctrl.as_ptr() as usize
        );
        unsafe { alloc.deallocate(region) };
    }

    #[test]
    fn carve_rejects_oversized_control() {
        let alloc = FixedSizeStack::new(MIN_STACK_SIZE);
        let region = alloc.allocate().unwrap();
        let err = carve(region, region.size()).unwrap_err();
        match err {
            SpawnError::StackTooSmall(size, _) => assert_eq!(size, region.size()),
            other => panic!("unexpected error: {}", other),
        }
        unsafe { alloc.deallocate(region) };
    }
}
