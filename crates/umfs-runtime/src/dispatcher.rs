//! Request dispatch
//!
//! Runs inside the continuation created for each request: builds paths
//! when tracking is on, calls the handler (or the default policy), keeps
//! the node table in step with the outcome and queues the reply.

use std::panic::{catch_unwind, AssertUnwindSafe};

use nix::errno::Errno;
use umfs_core::error::UmError;
use umfs_core::id::{ContinuationId, Cookie};
use umfs_core::path::FsPath;
use umfs_core::request::{ComponentNames, Operation, Request, SetbackFlags, VfsOp, VnOp};
use umfs_core::state::MountState;

use crate::continuation::Continuation;
use crate::mount::Usermount;
use crate::ops::HandlerResult;

/// What a handler sees of its request, and what it hands back
pub struct OpContext<'a> {
    mount: &'a Usermount,
    cc: ContinuationId,
    request: &'a Request,
    node: Cookie,
    path: Option<&'a FsPath>,
    dest_path: Option<&'a FsPath>,
    payload: Vec<u8>,
    setback: SetbackFlags,
    new_node: Option<Cookie>,
}

impl<'a> OpContext<'a> {
    pub fn mount(&self) -> &'a Usermount {
        self.mount
    }

    /// Continuation running this handler
    pub fn continuation(&self) -> ContinuationId {
        self.cc
    }

    pub fn request(&self) -> &'a Request {
        self.request
    }

    pub fn op(&self) -> Operation {
        self.request.op
    }

    /// Node the request is addressed to, after cookie mapping
    pub fn node(&self) -> Cookie {
        self.node
    }

    /// Request payload
    pub fn input(&self) -> &'a [u8] {
        &self.request.payload
    }

    pub fn names(&self) -> Option<&'a ComponentNames> {
        self.request.names.as_ref()
    }

    /// Path of the named target; only with path tracking
    pub fn path(&self) -> Option<&'a FsPath> {
        self.path
    }

    /// Path of the rename destination; only with path tracking
    pub fn dest_path(&self) -> Option<&'a FsPath> {
        self.dest_path
    }

    /// Set the reply payload
    pub fn reply(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    /// Report the kernel cookie of the node this operation produced
    pub fn set_new_node(&mut self, cookie: Cookie) {
        self.new_node = Some(cookie);
    }

    /// Ask the kernel to drop node references along with the reply
    pub fn setback(&mut self, flags: SetbackFlags) {
        self.setback |= flags;
    }
}

/// Paths built for one request
#[derive(Default)]
struct BuiltPaths {
    target: Option<FsPath>,
    dest: Option<FsPath>,
}

impl Usermount {
    /// Serve `req` inside continuation `cc`, then release `cc`
    pub(crate) fn dispatch(&self, cc: &Continuation, req: Request) {
        let op = req.op;
        let node = self.inner.mapper.to_node(req.cookie);
        tracing::debug!(cc = %cc.id(), req = req.id.0, op = %op, node = %node, "dispatch");

        let tracked = self.inner.config.path_tracking && op.builds_path();
        let paths = if tracked {
            match self.build_paths(node, &req) {
                Ok(built) => built,
                Err(errno) => {
                    tracing::debug!(req = req.id.0, op = %op, "path build failed");
                    self.protocol_error(UmError::PathBuild(errno));
                    self.finish(cc, &req, Err(errno), SetbackFlags::NONE, Vec::new());
                    return;
                }
            }
        } else {
            BuiltPaths::default()
        };

        let mut ctx = OpContext {
            mount: self,
            cc: cc.id(),
            request: &req,
            node,
            path: paths.target.as_ref(),
            dest_path: paths.dest.as_ref(),
            payload: Vec::new(),
            setback: SetbackFlags::NONE,
            new_node: None,
        };
        let result = match self.inner.ops.get(op) {
            Some(handler) => match catch_unwind(AssertUnwindSafe(|| handler.call(&mut ctx))) {
                Ok(result) => result,
                Err(_) => {
                    tracing::error!(cc = %cc.id(), req = req.id.0, op = %op, "handler panicked");
                    self.inner.stats.handler_panic();
                    Err(Errno::EIO)
                }
            },
            None => self.inner.ops.policy().fallback(op).into_result(),
        };
        let OpContext {
            payload,
            setback,
            new_node,
            ..
        } = ctx;

        match result {
            Ok(()) => self.apply(op, node, new_node, paths),
            Err(_) => self.release_paths(paths),
        }
        self.finish(cc, &req, result, setback, payload);
    }

    fn build_paths(&self, node: Cookie, req: &Request) -> Result<BuiltPaths, Errno> {
        let names = req.names.as_ref().ok_or(Errno::EINVAL)?;
        let nodes = self.inner.nodes.borrow();
        let paths = &self.inner.paths;

        let parent = nodes.path(node).ok_or(Errno::ENOENT)?;
        let target = paths.build(parent, &names.name)?;

        let dest = match (names.target_dir, names.target_name.as_deref()) {
            (Some(dir), Some(name)) => {
                let dir = self.inner.mapper.to_node(dir);
                let built = nodes
                    .path(dir)
                    .ok_or(Errno::ENOENT)
                    .and_then(|parent| paths.build(parent, name));
                match built {
                    Ok(p) => Some(p),
                    Err(e) => {
                        paths.release(target);
                        return Err(e);
                    }
                }
            }
            _ => None,
        };
        Ok(BuiltPaths {
            target: Some(target),
            dest,
        })
    }

    fn release_paths(&self, built: BuiltPaths) {
        for path in [built.target, built.dest].into_iter().flatten() {
            self.inner.paths.release(path);
        }
    }

    /// Bring the node table in line with a successful operation
    fn apply(&self, op: Operation, node: Cookie, new_node: Option<Cookie>, mut built: BuiltPaths) {
        let tracking = self.inner.config.path_tracking;
        match op {
            op if op.creates_node() => {
                if let Some(cookie) = new_node {
                    let cookie = self.inner.mapper.to_node(cookie);
                    let replaced = self.inner.nodes.borrow_mut().insert(cookie, built.target.take());
                    if let Some(path) = replaced.and_then(|n| n.path) {
                        self.inner.paths.release(path);
                    }
                }
            }
            Operation::Vn(VnOp::Reclaim) => {
                let removed = self.inner.nodes.borrow_mut().remove(node);
                if let Some(path) = removed.and_then(|n| n.path) {
                    self.inner.paths.release(path);
                }
            }
            Operation::Vn(VnOp::Rename) if tracking => {
                if let (Some(from), Some(to)) = (built.target.as_ref(), built.dest.as_ref()) {
                    let moved = self
                        .inner
                        .nodes
                        .borrow_mut()
                        .rename_subtree(self.inner.paths.as_ref(), from, to);
                    tracing::debug!(from = %from, to = %to, moved, "renamed subtree");
                }
            }
            Operation::Vfs(VfsOp::Unmount) => {
                tracing::info!("unmount acknowledged");
                self.inner.state.set(MountState::Unmounted);
            }
            _ => {}
        }
        self.release_paths(built);
    }

    fn finish(&self, cc: &Continuation, req: &Request, result: HandlerResult, setback: SetbackFlags, payload: Vec<u8>) {
        let errno = result.err();
        if req.expects_no_reply() {
            self.inner.stats.fire_and_forget();
        } else {
            let mut reply = req.reply();
            reply.error = errno.map_or(0, |e| e as i32);
            reply.setback = setback;
            reply.set_payload(payload);
            self.push_reply(reply);
        }
        tracing::trace!(cc = %cc.id(), req = req.id.0, errno = ?errno, "request done");
        self.inner.sched.release(cc.id());
    }
}
