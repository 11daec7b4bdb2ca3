//! Identifier types
//!
//! - `ContinuationId` - handle of one continuation inside a mount
//! - `RequestId` - kernel-assigned identifier carried by a request and its reply
//! - `Cookie` - opaque handle naming a filesystem node across the kernel boundary

use core::fmt;

/// Unique identifier for a continuation
///
/// Allocated monotonically per mount. The maximum value (u32::MAX) is
/// reserved as a sentinel for "no continuation".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ContinuationId(u32);

impl ContinuationId {
    /// Sentinel value indicating no continuation
    pub const NONE: ContinuationId = ContinuationId(u32::MAX);

    /// Create a new ContinuationId from a raw value
    #[inline]
    pub const fn new(id: u32) -> Self {
        ContinuationId(id)
    }

    /// Get the raw u32 value
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Check if this is the NONE sentinel
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u32::MAX
    }

    /// Check if this is a valid id
    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != u32::MAX
    }

    /// Convert to Option
    #[inline]
    pub const fn to_option(self) -> Option<ContinuationId> {
        if self.is_none() {
            None
        } else {
            Some(self)
        }
    }

    /// The id following this one, skipping the sentinel on wrap-around
    #[inline]
    pub const fn next(self) -> ContinuationId {
        let n = self.0.wrapping_add(1);
        if n == u32::MAX {
            ContinuationId(0)
        } else {
            ContinuationId(n)
        }
    }
}

impl From<u32> for ContinuationId {
    #[inline]
    fn from(id: u32) -> Self {
        ContinuationId(id)
    }
}

impl fmt::Debug for ContinuationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "ContinuationId(NONE)")
        } else {
            write!(f, "ContinuationId({})", self.0)
        }
    }
}

impl fmt::Display for ContinuationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "cc{}", self.0)
        }
    }
}

impl Default for ContinuationId {
    fn default() -> Self {
        ContinuationId::NONE
    }
}

/// Kernel request identifier; a reply must carry the same value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque node handle exchanged with the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Cookie(pub u64);

impl Cookie {
    /// Cookie of filesystem-level requests that target no node
    pub const NONE: Cookie = Cookie(0);

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continuation_id_basics() {
        let id = ContinuationId::new(42);
        assert_eq!(id.as_u32(), 42);
        assert!(id.is_some());
        assert_eq!(id.to_string(), "cc42");
    }

    #[test]
    fn test_continuation_id_none() {
        let none = ContinuationId::default();
        assert!(none.is_none());
        assert_eq!(none.to_option(), None);
    }

    #[test]
    fn test_next_skips_sentinel() {
        assert_eq!(ContinuationId::new(7).next(), ContinuationId::new(8));
        assert_eq!(ContinuationId::new(u32::MAX - 1).next(), ContinuationId::new(0));
    }

    #[test]
    fn test_cookie_none() {
        assert!(Cookie::NONE.is_none());
        assert!(!Cookie(5).is_none());
        assert_eq!(Cookie(255).to_string(), "0xff");
    }
}
