//! Error types for the umfs engine
//!
//! Errors follow four families:
//! - protocol: malformed batches, unmatched frames, unknown opcodes
//! - resource: stack or buffer allocation failures
//! - channel: a stream channel was removed or lost its write side
//! - programming/config: misuse of the engine, refused configuration
//!
//! Handler errors never appear here; they are plain `Errno` values carried
//! verbatim into replies.

use nix::errno::Errno;
use std::os::unix::io::RawFd;
use thiserror::Error;

use crate::id::ContinuationId;

/// Result type for engine operations
pub type UmResult<T> = Result<T, UmError>;

/// Errors raised by the engine itself
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UmError {
    /// Request class or opcode not known to the dispatcher
    #[error("unknown request: class {class}, opcode {opcode}")]
    UnknownRequest { class: u8, opcode: u32 },

    /// A batch or request failed structural validation
    #[error("malformed request batch: {0}")]
    MalformedBatch(&'static str),

    /// Completed inbound frame matched no outstanding request
    #[error("unmatched inbound frame on fd {fd}")]
    UnmatchedFrame { fd: RawFd },

    /// Path builder refused to produce a path before the handler ran
    #[error("path construction failed: {0}")]
    PathBuild(Errno),

    /// Stack mapping failed
    #[error("stack allocation failed: {0}")]
    StackAllocation(Errno),

    /// Frame buffer could not grow to the requested size
    #[error("frame buffer growth to {requested} bytes failed")]
    BufferGrowth { requested: usize },

    /// Access outside the written part of a frame buffer
    #[error("frame access {offset}+{len} beyond {limit} bytes")]
    OutOfBounds { offset: usize, len: usize, limit: usize },

    /// Refused configuration value
    #[error("invalid configuration: {0}")]
    Config(&'static str),

    /// `suspend` called on a continuation that has no stack of its own
    #[error("suspend called on synthetic continuation {0}")]
    SuspendSynthetic(ContinuationId),

    /// Operation requires running inside a continuation
    #[error("not running inside a continuation")]
    NotInContinuation,

    /// Continuation is in the wrong state for the operation
    #[error("continuation {0} in invalid state")]
    InvalidState(ContinuationId),

    /// Another continuation is already running
    #[error("continuation {0} already running")]
    AlreadyRunning(ContinuationId),

    /// No continuation with this id
    #[error("continuation {0} not found")]
    ContinuationNotFound(ContinuationId),

    /// Fd is not registered with the multiplexer
    #[error("no channel registered for fd {0}")]
    NoChannel(RawFd),

    /// Fd is already registered with the multiplexer
    #[error("fd {0} already registered")]
    ChannelExists(RawFd),

    /// Channel was removed while a frame waited on it
    #[error("channel {fd} removed: {errno}")]
    ChannelRemoved { fd: RawFd, errno: Errno },

    /// Write side of the channel failed
    #[error("channel {fd} write gone: {errno}")]
    WriteGone { fd: RawFd, errno: Errno },

    /// Mount is not in a state that accepts the operation
    #[error("mount is unmounted")]
    Unmounted,

    /// OS-level failure outside a channel
    #[error("os error: {0}")]
    Os(Errno),
}

impl UmError {
    /// errno reported to the kernel when this error answers a request
    pub fn errno(&self) -> Errno {
        match self {
            UmError::UnknownRequest { .. } => Errno::EINVAL,
            UmError::MalformedBatch(_) => Errno::EINVAL,
            UmError::UnmatchedFrame { .. } => Errno::ENOMSG,
            UmError::PathBuild(e) => *e,
            UmError::StackAllocation(e) => *e,
            UmError::BufferGrowth { .. } => Errno::ENOMEM,
            UmError::OutOfBounds { .. } => Errno::EINVAL,
            UmError::Config(_) => Errno::EINVAL,
            UmError::SuspendSynthetic(_) => Errno::EDEADLK,
            UmError::NotInContinuation => Errno::EDEADLK,
            UmError::InvalidState(_) => Errno::EINVAL,
            UmError::AlreadyRunning(_) => Errno::EBUSY,
            UmError::ContinuationNotFound(_) => Errno::ESRCH,
            UmError::NoChannel(_) => Errno::EBADF,
            UmError::ChannelExists(_) => Errno::EEXIST,
            UmError::ChannelRemoved { errno, .. } => *errno,
            UmError::WriteGone { errno, .. } => *errno,
            UmError::Unmounted => Errno::ENXIO,
            UmError::Os(e) => *e,
        }
    }

    /// Check if this is a protocol error (logged, loop keeps going)
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            UmError::UnknownRequest { .. }
                | UmError::MalformedBatch(_)
                | UmError::UnmatchedFrame { .. }
                | UmError::PathBuild(_)
        )
    }

    /// Check if this is a resource exhaustion error
    pub fn is_resource(&self) -> bool {
        matches!(
            self,
            UmError::StackAllocation(_) | UmError::BufferGrowth { .. }
        )
    }
}

impl From<Errno> for UmError {
    fn from(e: Errno) -> Self {
        UmError::Os(e)
    }
}
