//! # umfs-runtime
//!
//! Engine of a userspace filesystem mount.
//!
//! This crate provides:
//! - Continuations on mmap'd stacks (architecture-specific context switch)
//! - The scheduler and the single-threaded event loop
//! - Request dispatch through an operation table with a default policy
//! - Framed stream channels multiplexed on epoll
//! - The kernel transport seam, with an in-process loopback

pub mod arch;
pub mod channel;
pub mod config;
pub mod continuation;
pub mod dispatcher;
pub mod framing;
pub mod memory;
pub mod mount;
pub mod multiplexer;
pub mod nodes;
pub mod ops;
pub mod pool;
pub mod scheduler;
pub mod stats;
pub mod tls;
pub mod transport;

// Platform detection
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod platform_linux;
        pub use platform_linux::{Poller, Readiness};
    } else {
        compile_error!("Unsupported platform");
    }
}

// Re-exports
pub use channel::{Discarded, FdIo, Waiter};
pub use config::MountConfig;
pub use continuation::Continuation;
pub use dispatcher::OpContext;
pub use framing::{Framing, LengthPrefixed, LP_HEADER_LEN};
pub use mount::{FdEvent, Usermount, UsermountBuilder};
pub use multiplexer::ChannelInfo;
pub use nodes::{Node, NodeTable};
pub use ops::{DefaultPolicy, Fallback, Handler, HandlerResult, OperationTable};
pub use pool::FramePool;
pub use scheduler::Scheduler;
pub use stats::StatsSnapshot;
pub use transport::{KernelTransport, LoopbackHandle, LoopbackTransport};
