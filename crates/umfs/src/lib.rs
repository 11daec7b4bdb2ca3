//! # umfs - userspace filesystem framework
//!
//! Serves kernel filesystem requests from a single-threaded event loop.
//! Each request runs on its own continuation, so a handler that needs a
//! backing service can send a frame and suspend until the answer arrives
//! while other requests proceed.
//!
//! ## Quick Start
//!
//! ```ignore
//! use umfs::{init_logging, LoopbackTransport, MountConfig, Operation, Usermount, VnOp};
//!
//! fn main() -> umfs::UmResult<()> {
//!     init_logging();
//!     let (transport, kernel) = LoopbackTransport::new()?;
//!
//!     let mount = Usermount::builder(MountConfig::from_env())
//!         .on(Operation::Vn(VnOp::Getattr), |ctx| {
//!             ctx.reply(vec![0; 64]);
//!             Ok(())
//!         })
//!         .build(transport)?;
//!
//!     // requests come in through `kernel.submit(..)`
//!     mount.mainloop()
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Filesystem handlers                         │
//! │        OpContext, enqueue_and_suspend, yield_now            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Dispatcher                             │
//! │      operation table, default policy, node/path table       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌─────────────┐     ┌─────────────┐
//!    │ Scheduler │      │ Multiplexer │     │   Kernel    │
//!    │  + fibers │      │  channels   │     │  transport  │
//!    └───────────┘      └─────────────┘     └─────────────┘
//!          │                   │                   │
//!          └───────────────────┼───────────────────┘
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │                 Event loop (epoll)                      │
//!    │   control fd + channel fds, batched replies per pass    │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use umfs_core::{
    AdminOp,
    CacheOp,
    ComponentNames,
    ContinuationId,
    ContinuationState,
    Cookie,
    CookieMapper,
    Errno,
    FrameBuffer,
    FsPath,
    IdentityMapper,
    MountState,
    OpClass,
    Operation,
    PathOps,
    RawReply,
    RawRequest,
    Request,
    RequestId,
    SetbackFlags,
    SlashPaths,
    UmError,
    UmResult,
    VfsOp,
    VnOp,
};

pub use umfs_core::request::{HEADER_LEN, REQ_FAF};

// Re-export env utilities
pub use umfs_core::{env_get, env_get_bool, env_get_opt};

// Re-export runtime types
pub use umfs_runtime::{
    ChannelInfo,
    DefaultPolicy,
    Discarded,
    Fallback,
    FdEvent,
    Framing,
    Handler,
    HandlerResult,
    KernelTransport,
    LengthPrefixed,
    LoopbackHandle,
    LoopbackTransport,
    MountConfig,
    OpContext,
    StatsSnapshot,
    Usermount,
    UsermountBuilder,
};

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "UMFS_LOG";

/// Install a `fmt` subscriber filtered by `UMFS_LOG` (default `info`)
///
/// Does nothing if a global subscriber is already set.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_facade_mount_roundtrip() {
        init_logging();
        let (transport, kernel) = LoopbackTransport::new().unwrap();
        let mount = Usermount::builder(MountConfig::new())
            .on(Operation::Vn(VnOp::Getattr), |ctx| {
                ctx.reply(b"attr".to_vec());
                Ok(())
            })
            .build(transport)
            .unwrap();

        kernel
            .submit(RawRequest::new(1, Cookie(1), Operation::Vn(VnOp::Getattr), vec![]))
            .unwrap();
        kernel.unmount().unwrap();
        mount.mainloop().unwrap();

        let replies = kernel.take_replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].payload, b"attr");
        assert_eq!(mount.state(), MountState::Unmounted);
    }
}
