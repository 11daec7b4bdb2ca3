//! Continuation stack memory
//!
//! Platform-specific implementations handle virtual memory allocation.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::*;
    } else {
        compile_error!("Unsupported platform");
    }
}

use umfs_core::constants::{MIN_STACK_PAGES, PAGE_SIZE};
use umfs_core::error::{UmError, UmResult};

/// Round a requested stack size up to whole pages, refusing tiny stacks
pub fn stack_len(requested: usize) -> UmResult<usize> {
    if requested < MIN_STACK_PAGES * PAGE_SIZE {
        return Err(UmError::Config("stack size below two pages"));
    }
    requested
        .checked_next_multiple_of(PAGE_SIZE)
        .ok_or(UmError::Config("stack size overflows"))
}
