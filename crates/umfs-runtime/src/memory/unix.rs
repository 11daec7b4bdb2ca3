//! Unix stack implementation using mmap

use super::stack_len;
use nix::errno::Errno;
use umfs_core::constants::PAGE_SIZE;
use umfs_core::error::{UmError, UmResult};

/// One continuation stack
///
/// Layout, low to high: one PROT_NONE guard page, then the usable stack.
/// Overflowing the stack faults on the guard page instead of corrupting
/// neighbouring memory.
pub struct Stack {
    base: *mut u8,
    total: usize,
}

impl Stack {
    /// Map a stack with at least `size` usable bytes
    pub fn new(size: usize) -> UmResult<Stack> {
        let usable = stack_len(size)?;
        let total = usable + PAGE_SIZE;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(UmError::StackAllocation(Errno::last()));
        }

        // Guard page at the low end; the stack grows down into it
        let ret = unsafe { libc::mprotect(base, PAGE_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            let err = Errno::last();
            unsafe { libc::munmap(base, total) };
            return Err(UmError::StackAllocation(err));
        }

        Ok(Stack {
            base: base as *mut u8,
            total,
        })
    }

    /// Upper end of the stack (stack grows down)
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable bytes below `top`
    #[inline]
    pub fn usable(&self) -> usize {
        self.total - PAGE_SIZE
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.base as *mut libc::c_void, self.total) };
        if ret != 0 {
            tracing::warn!(errno = %Errno::last(), "munmap of continuation stack failed");
        }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("top", &self.top())
            .field("usable", &self.usable())
            .finish()
    }
}
