//! memfs - in-memory filesystem demo
//!
//! Mounts a small namespace on the loopback transport, plays a scripted
//! series of kernel requests against it and prints the replies. File
//! contents live in a backing-store thread reached over a socketpair, so
//! reads and writes suspend their continuation until the store answers.
//!
//! # Environment Variables
//!
//! - `UMFS_LOG=debug` - log filter (error, warn, info, debug, trace)
//! - `UMFS_CONTINUATIONS=0` - run without continuations (reads and writes
//!   then fail with EDEADLK)
//! - `UMFS_PATH_TRACKING=0` - do not track node paths
//!
// UMFS_LOG=debug cargo run -p umfs-memfs

mod backing;
mod fs;

use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;

use umfs::{
    env_get_bool, init_logging, ComponentNames, Cookie, Errno, LoopbackTransport, MountConfig,
    Operation, RawReply, RawRequest, UmError, UmResult, Usermount, VfsOp, VnOp, REQ_FAF,
};

use fs::MemFs;

const ROOT: Cookie = Cookie(1);

fn script() -> Vec<RawRequest> {
    let vn = |id, cookie, op, payload: &[u8]| RawRequest::new(id, cookie, Operation::Vn(op), payload.to_vec());
    vec![
        vn(1, ROOT, VnOp::Mkdir, b"").with_names(ComponentNames::new("docs")),
        vn(2, Cookie(2), VnOp::Create, b"").with_names(ComponentNames::new("hello.txt")),
        vn(3, Cookie(3), VnOp::Write, b"hello from the backing store"),
        vn(4, Cookie(3), VnOp::Getattr, b""),
        vn(5, Cookie(3), VnOp::Read, b""),
        vn(6, ROOT, VnOp::Rename, b"").with_names(ComponentNames::rename("docs", ROOT, "notes")),
        vn(7, Cookie(2), VnOp::Readdir, b""),
        vn(8, Cookie(3), VnOp::Inactive, b"").fire_and_forget(),
        vn(9, Cookie(2), VnOp::Lookup, b"").with_names(ComponentNames::new("missing")),
        vn(10, Cookie(3), VnOp::Pathconf, b""),
        RawRequest::new(11, ROOT, Operation::Vfs(VfsOp::Unmount), vec![]),
    ]
}

fn describe(reply: &RawReply) -> String {
    if reply.error != 0 {
        return format!("error {}", Errno::from_raw(reply.error));
    }
    match std::str::from_utf8(&reply.payload) {
        Ok(text) if !text.is_empty() && text.chars().all(|c| !c.is_control() || c == '\n') => {
            format!("{:?}", text)
        }
        _ => format!("{} byte(s)", reply.payload.len()),
    }
}

fn os_error(e: std::io::Error) -> UmError {
    UmError::Os(e.raw_os_error().map_or(Errno::EIO, Errno::from_raw))
}

fn run() -> UmResult<()> {
    let (ours, theirs) = UnixStream::pair().map_err(os_error)?;
    let store = backing::spawn(theirs).map_err(os_error)?;

    let config = MountConfig::from_env().path_tracking(env_get_bool("UMFS_PATH_TRACKING", true));
    let (transport, kernel) = LoopbackTransport::new()?;
    let memfs = MemFs::new(ROOT, ours.as_raw_fd());
    let mount = memfs.install(Usermount::builder(config).root(ROOT)).build(transport)?;
    mount.add_channel(ours.as_raw_fd())?;

    // one request at a time, like a single-threaded client
    let mut script = script().into_iter();
    let mut waiting = false;
    let mut answered = 0;
    while !mount.state().is_unmounted() {
        if !waiting {
            if let Some(req) = script.next() {
                waiting = req.flags & REQ_FAF == 0;
                tracing::debug!(id = req.id.0, waiting, "submitting");
                kernel.submit(req)?;
            }
        }
        mount.run_once()?;
        for reply in kernel.take_replies() {
            println!("  [{:>2}] {:<14} {}", reply.id.0, op_name(&reply), describe(&reply));
            answered += 1;
            waiting = false;
        }
    }

    let stats = mount.stats();
    mount.remove_channel(ours.as_raw_fd(), Errno::ESHUTDOWN)?;
    drop(mount);
    drop(ours);
    match store.join() {
        Ok(Ok(served)) => tracing::info!(served, "backing store finished"),
        Ok(Err(e)) => tracing::warn!(error = %e, "backing store failed"),
        Err(_) => tracing::error!("backing store panicked"),
    }

    println!("\n{} replies, stats: {:?}", answered, stats);
    Ok(())
}

fn op_name(reply: &RawReply) -> String {
    Operation::decode(reply.class, reply.opcode)
        .map(|op| op.to_string())
        .unwrap_or_else(|_| "?".into())
}

fn main() {
    println!("=== umfs memfs ===\n");
    init_logging();
    if let Err(e) = run() {
        tracing::error!(error = %e, "memfs failed");
        std::process::exit(1);
    }
    println!("\n=== unmounted ===");
}
