//! Thread-local storage for continuation context
//!
//! Tracks which continuation, if any, is executing on this OS thread.

use std::cell::Cell;
use umfs_core::id::ContinuationId;

thread_local! {
    /// Continuation currently running on this thread
    static CURRENT: Cell<ContinuationId> = const { Cell::new(ContinuationId::NONE) };
}

/// Set the running continuation, returning the previous one
#[inline]
pub fn set_current(id: ContinuationId) -> ContinuationId {
    CURRENT.with(|cell| cell.replace(id))
}

/// Clear the running continuation (control back at the loop)
#[inline]
pub fn clear_current() {
    CURRENT.with(|cell| cell.set(ContinuationId::NONE));
}

/// Get the running continuation id
#[inline]
pub fn current_id() -> ContinuationId {
    CURRENT.with(|cell| cell.get())
}

/// Check if we're running inside a continuation
#[inline]
pub fn in_continuation() -> bool {
    current_id().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_clear() {
        assert!(!in_continuation());
        let prev = set_current(ContinuationId::new(3));
        assert!(prev.is_none());
        assert_eq!(current_id(), ContinuationId::new(3));
        clear_current();
        assert!(!in_continuation());
    }
}
