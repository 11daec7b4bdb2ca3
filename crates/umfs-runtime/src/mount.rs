//! Mount handle and event loop
//!
//! A [`Usermount`] ties together the kernel transport, the operation
//! table, the continuation scheduler and the stream channels. Everything
//! runs on the thread that calls [`Usermount::mainloop`]; handles are
//! cheap `Rc` clones and are neither `Send` nor `Sync`.
//!
//! One loop iteration:
//! 1. update write interest of channels with queued frames
//! 2. wait for readiness (no wait while continuations are ready)
//! 3. dispatch kernel requests, service readable/writable channels
//! 4. resume continuations made ready by replies
//! 5. deliver the accumulated replies as one batch
//! 6. free continuations that finished
//! 7. run the loop hook

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use nix::errno::Errno;
use umfs_core::error::{UmError, UmResult};
use umfs_core::framebuf::FrameBuffer;
use umfs_core::id::{ContinuationId, Cookie};
use umfs_core::path::{CookieMapper, FsPath, IdentityMapper, PathOps, SlashPaths};
use umfs_core::request::{OpClass, Operation, RawReply, RawRequest, Request, HEADER_LEN, REQ_FAF};
use umfs_core::state::MountState;

use crate::channel::StreamChannel;
use crate::config::MountConfig;
use crate::continuation::Entry;
use crate::dispatcher::OpContext;
use crate::framing::{Framing, LengthPrefixed};
use crate::nodes::{Node, NodeTable};
use crate::ops::{Fallback, Handler, HandlerResult, OperationTable};
use crate::platform_linux::{Poller, Readiness};
use crate::pool::FramePool;
use crate::scheduler::Scheduler;
use crate::stats::{MountStats, StatsSnapshot};
use crate::tls;
use crate::transport::KernelTransport;

/// Most readiness events taken per wait
const MAX_EVENTS: usize = 64;

/// Condition reported on a channel descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdEvent {
    /// End of stream, or a read error
    ReadGone(Option<Errno>),
    /// A write failed; queued frames were dropped
    WriteGone(Errno),
}

/// Called with inbound frames that match no outstanding request
pub type UnsolicitedHook = Box<dyn Fn(&Usermount, RawFd, FrameBuffer)>;
/// Called when a channel loses its read or write side
pub type FdEventHook = Box<dyn Fn(&Usermount, RawFd, FdEvent)>;
/// Called once at the end of every loop iteration
pub type LoopHook = Box<dyn Fn(&Usermount)>;

pub(crate) struct MountInner {
    pub(crate) config: MountConfig,
    pub(crate) state: Cell<MountState>,
    pub(crate) sched: Scheduler,
    pub(crate) ops: OperationTable,
    pub(crate) paths: Box<dyn PathOps>,
    pub(crate) mapper: Box<dyn CookieMapper>,
    pub(crate) nodes: RefCell<NodeTable>,
    pub(crate) root: Cookie,
    pub(crate) transport: RefCell<Box<dyn KernelTransport>>,
    pub(crate) control_fd: RawFd,
    pub(crate) outgoing: RefCell<Vec<RawReply>>,
    pub(crate) poller: Poller,
    pub(crate) channels: RefCell<BTreeMap<RawFd, StreamChannel>>,
    pub(crate) framing: Box<dyn Framing>,
    pub(crate) pool: FramePool,
    pub(crate) on_unsolicited: Option<UnsolicitedHook>,
    pub(crate) on_fd_event: Option<FdEventHook>,
    pub(crate) loop_hook: Option<LoopHook>,
    pub(crate) stats: MountStats,
    pub(crate) last_error: RefCell<Option<UmError>>,
}

/// Handle to a running userspace mount
#[derive(Clone)]
pub struct Usermount {
    pub(crate) inner: Rc<MountInner>,
}

/// Collects the pieces of a mount before it starts
pub struct UsermountBuilder {
    config: MountConfig,
    ops: OperationTable,
    paths: Box<dyn PathOps>,
    mapper: Box<dyn CookieMapper>,
    framing: Box<dyn Framing>,
    root: Cookie,
    on_unsolicited: Option<UnsolicitedHook>,
    on_fd_event: Option<FdEventHook>,
    loop_hook: Option<LoopHook>,
}

impl UsermountBuilder {
    pub fn new(config: MountConfig) -> Self {
        Self {
            config,
            ops: OperationTable::new(),
            paths: Box::new(SlashPaths::default()),
            mapper: Box::new(IdentityMapper),
            framing: Box::new(LengthPrefixed),
            root: Cookie(1),
            on_unsolicited: None,
            on_fd_event: None,
            loop_hook: None,
        }
    }

    /// Register a handler for `op`
    pub fn handler(mut self, op: Operation, handler: impl Handler + 'static) -> Self {
        self.ops.set(op, handler);
        self
    }

    /// Register a closure for `op`
    pub fn on<F>(mut self, op: Operation, f: F) -> Self
    where
        F: Fn(&mut OpContext<'_>) -> HandlerResult + 'static,
    {
        self.ops.on(op, f);
        self
    }

    /// Answer for `op` when it has no handler
    pub fn fallback(mut self, op: Operation, fallback: Fallback) -> Self {
        self.ops.policy_mut().set(op, fallback);
        self
    }

    /// Answer for unlisted operations without a handler
    pub fn otherwise(mut self, fallback: Fallback) -> Self {
        self.ops.policy_mut().otherwise(fallback);
        self
    }

    pub fn path_ops(mut self, paths: impl PathOps + 'static) -> Self {
        self.paths = Box::new(paths);
        self
    }

    pub fn cookie_mapper(mut self, mapper: impl CookieMapper + 'static) -> Self {
        self.mapper = Box::new(mapper);
        self
    }

    pub fn framing(mut self, framing: impl Framing + 'static) -> Self {
        self.framing = Box::new(framing);
        self
    }

    /// Cookie of the root directory
    pub fn root(mut self, cookie: Cookie) -> Self {
        self.root = cookie;
        self
    }

    pub fn on_unsolicited(mut self, hook: impl Fn(&Usermount, RawFd, FrameBuffer) + 'static) -> Self {
        self.on_unsolicited = Some(Box::new(hook));
        self
    }

    pub fn on_fd_event(mut self, hook: impl Fn(&Usermount, RawFd, FdEvent) + 'static) -> Self {
        self.on_fd_event = Some(Box::new(hook));
        self
    }

    pub fn loop_hook(mut self, hook: impl Fn(&Usermount) + 'static) -> Self {
        self.loop_hook = Some(Box::new(hook));
        self
    }

    /// Validate the configuration and attach to `transport`
    pub fn build(self, transport: impl KernelTransport + 'static) -> UmResult<Usermount> {
        self.config.validate()?;

        let poller = Poller::new()?;
        let control_fd = transport.poll_fd();
        poller.add(control_fd, true, false)?;

        let root_node = self.mapper.to_node(self.root);
        let root_path = self.config.path_tracking.then(FsPath::root);
        let sched = Scheduler::new(self.config.stack_size, !self.config.continuations);
        let pool = FramePool::new(self.config.frame_pool);

        tracing::info!(
            continuations = self.config.continuations,
            path_tracking = self.config.path_tracking,
            handlers = self.ops.len(),
            "mount created"
        );

        Ok(Usermount {
            inner: Rc::new(MountInner {
                config: self.config,
                state: Cell::new(MountState::Mounting),
                sched,
                ops: self.ops,
                paths: self.paths,
                mapper: self.mapper,
                nodes: RefCell::new(NodeTable::new(root_node, root_path)),
                root: self.root,
                transport: RefCell::new(Box::new(transport)),
                control_fd,
                outgoing: RefCell::new(Vec::new()),
                poller,
                channels: RefCell::new(BTreeMap::new()),
                framing: self.framing,
                pool,
                on_unsolicited: self.on_unsolicited,
                on_fd_event: self.on_fd_event,
                loop_hook: self.loop_hook,
                stats: MountStats::default(),
                last_error: RefCell::new(None),
            }),
        })
    }
}

impl Usermount {
    pub fn builder(config: MountConfig) -> UsermountBuilder {
        UsermountBuilder::new(config)
    }

    pub fn config(&self) -> &MountConfig {
        &self.inner.config
    }

    pub fn state(&self) -> MountState {
        self.inner.state.get()
    }

    /// Stop the loop after the current iteration
    pub fn unmount(&self) {
        if !self.state().is_unmounted() {
            tracing::info!("mount stopping");
        }
        self.inner.state.set(MountState::Unmounted);
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Most recent protocol error, cleared by this call
    pub fn take_last_error(&self) -> Option<UmError> {
        self.inner.last_error.borrow_mut().take()
    }

    pub fn root(&self) -> Cookie {
        self.inner.root
    }

    /// Tracked node behind a kernel cookie
    pub fn node(&self, cookie: Cookie) -> Option<Node> {
        let node = self.inner.mapper.to_node(cookie);
        self.inner.nodes.borrow().get(node).cloned()
    }

    pub fn node_count(&self) -> usize {
        self.inner.nodes.borrow().len()
    }

    /// Continuation executing right now, if any
    pub fn current(&self) -> Option<ContinuationId> {
        tls::current_id().to_option()
    }

    /// Suspend the calling continuation until someone schedules it
    pub fn yield_now(&self) -> UmResult<()> {
        let cc = self.inner.sched.current().ok_or(UmError::NotInContinuation)?;
        self.inner.stats.suspend();
        cc.suspend()
    }

    /// Queue a suspended continuation for the next resume pass
    pub fn schedule(&self, id: ContinuationId) -> UmResult<()> {
        self.inner.sched.schedule(id)
    }

    /// Resume a continuation directly; only valid outside any continuation
    pub fn resume(&self, id: ContinuationId) -> UmResult<()> {
        self.inner.sched.resume(id)
    }

    /// Run `f` in a fresh continuation on the next resume pass
    pub fn spawn<F>(&self, f: F) -> UmResult<ContinuationId>
    where
        F: FnOnce(&Usermount) + 'static,
    {
        let mount = self.clone();
        let entry: Entry = Box::new(move |cc| {
            if catch_unwind(AssertUnwindSafe(|| f(&mount))).is_err() {
                tracing::error!(cc = %cc.id(), "spawned continuation panicked");
                mount.inner.stats.handler_panic();
            }
            mount.inner.sched.release(cc.id());
        });
        let id = self.inner.sched.create(entry)?;
        self.inner.sched.schedule(id)?;
        Ok(id)
    }

    /// Loop until unmounted, then flush channels and free everything
    pub fn mainloop(&self) -> UmResult<()> {
        if let Some(id) = self.current() {
            return Err(UmError::AlreadyRunning(id));
        }
        tracing::info!(control_fd = self.inner.control_fd, "entering main loop");
        let result = loop {
            if self.state().is_unmounted() {
                break Ok(());
            }
            if let Err(e) = self.run_once() {
                tracing::error!(error = %e, "main loop failed");
                break Err(e);
            }
        };
        self.shutdown();
        result
    }

    /// One pass of the event loop
    pub fn run_once(&self) -> UmResult<()> {
        if let Some(id) = self.current() {
            return Err(UmError::AlreadyRunning(id));
        }
        if self.state() == MountState::Mounting {
            self.inner.state.set(MountState::Running);
        }

        self.update_interest();

        let busy = self.inner.sched.ready_len() > 0 || !self.inner.outgoing.borrow().is_empty();
        let timeout = if busy { 0 } else { self.inner.config.poll_timeout_ms() };
        let events = self.inner.poller.wait(MAX_EVENTS, timeout)?;

        for ev in events {
            if ev.fd == self.inner.control_fd {
                self.read_requests()?;
            } else {
                self.service_channel(ev);
            }
        }

        self.inner.sched.run_ready();
        self.flush_replies();
        self.inner.sched.drain_pending();

        if let Some(hook) = &self.inner.loop_hook {
            hook(self);
        }
        Ok(())
    }

    fn read_requests(&self) -> UmResult<()> {
        let cfg = &self.inner.config;
        let batch = self
            .inner
            .transport
            .borrow_mut()
            .get_batch(cfg.max_batch_bytes, cfg.max_batch_ops);
        match batch {
            Ok(reqs) => {
                tracing::trace!(count = reqs.len(), "request batch");
                for raw in reqs {
                    self.accept(raw);
                }
                Ok(())
            }
            Err(UmError::Unmounted) | Err(UmError::Os(Errno::ENODEV)) => {
                self.unmount();
                Ok(())
            }
            Err(e) if e.is_protocol() => {
                self.protocol_error(e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Decode a request and start a continuation for it
    fn accept(&self, raw: RawRequest) {
        self.inner.stats.request();
        let skeleton = RawReply {
            id: raw.id,
            len: HEADER_LEN as u32,
            cookie: raw.cookie,
            class: raw.class,
            opcode: raw.opcode,
            error: 0,
            setback: Default::default(),
            payload: Vec::new(),
        };
        // cache and admin traffic is never answered, even when malformed
        let silent = raw.flags & REQ_FAF != 0
            || matches!(OpClass::from_u8(raw.class), Some(OpClass::Cache | OpClass::Admin));

        let req = match Request::try_from(raw) {
            Ok(req) => req,
            Err(e) => {
                let errno = e.errno();
                self.protocol_error(e);
                if !silent {
                    self.push_reply(RawReply {
                        error: errno as i32,
                        ..skeleton
                    });
                }
                return;
            }
        };

        let no_reply = req.expects_no_reply();
        let mount = self.clone();
        let entry: Entry = Box::new(move |cc| mount.dispatch(cc, req));
        let id = match self.inner.sched.create(entry) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(error = %e, req = skeleton.id.0, "cannot start continuation");
                if !no_reply {
                    self.push_reply(RawReply {
                        error: e.errno() as i32,
                        ..skeleton
                    });
                }
                return;
            }
        };
        if let Some(cc) = self.inner.sched.get(id) {
            cc.set_fire_and_forget(no_reply);
        }
        if let Err(e) = self.inner.sched.resume(id) {
            tracing::warn!(cc = %id, error = %e, "initial resume failed");
        }
    }

    pub(crate) fn push_reply(&self, reply: RawReply) {
        self.inner.stats.reply();
        self.inner.outgoing.borrow_mut().push(reply);
    }

    /// Hand every accumulated reply to the transport as one batch
    fn flush_replies(&self) {
        let replies = std::mem::take(&mut *self.inner.outgoing.borrow_mut());
        if replies.is_empty() {
            return;
        }
        let count = replies.len();
        match self.inner.transport.borrow_mut().put_batch(replies) {
            Ok(()) => tracing::trace!(count, "reply batch"),
            Err(UmError::Unmounted) | Err(UmError::Os(Errno::ENODEV)) => self.unmount(),
            Err(e) => tracing::error!(error = %e, count, "reply batch lost"),
        }
    }

    pub(crate) fn protocol_error(&self, err: UmError) {
        tracing::warn!(error = %err, errno = %err.errno(), "protocol error");
        self.inner.stats.protocol_error();
        *self.inner.last_error.borrow_mut() = Some(err);
    }

    fn service_channel(&self, ev: Readiness) {
        if ev.writable || ev.hangup {
            self.write_channel(ev.fd);
        }
        if ev.readable || ev.hangup {
            self.read_channel(ev.fd);
        }
    }

    fn shutdown(&self) {
        let fds: Vec<RawFd> = self.inner.channels.borrow().keys().copied().collect();
        for &fd in &fds {
            self.write_channel(fd);
        }
        for fd in fds {
            if let Err(e) = self.remove_channel(fd, Errno::ESHUTDOWN) {
                tracing::debug!(fd, error = %e, "channel removal at shutdown");
            }
        }
        self.flush_replies();
        self.inner.sched.teardown();
        self.inner.state.set(MountState::Unmounted);
        tracing::info!(stats = ?self.stats(), "mount torn down");
    }
}

impl std::fmt::Debug for Usermount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Usermount")
            .field("state", &self.state())
            .field("sched", &self.inner.sched)
            .field("channels", &self.inner.channels.borrow().len())
            .field("ops", &self.inner.ops)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LoopbackHandle, LoopbackTransport};
    use std::time::Duration;
    use umfs_core::request::{ComponentNames, VfsOp, VnOp};

    fn config() -> MountConfig {
        MountConfig::new().poll_timeout(Duration::from_millis(20))
    }

    fn mount(b: UsermountBuilder) -> (Usermount, LoopbackHandle) {
        let (t, h) = LoopbackTransport::new().unwrap();
        (b.build(t).unwrap(), h)
    }

    fn getattr(id: u64) -> RawRequest {
        RawRequest::new(id, Cookie(1), Operation::Vn(VnOp::Getattr), vec![])
    }

    #[test]
    fn test_synthetic_getattr_single_batch() {
        let (m, h) = mount(
            Usermount::builder(config().continuations(false)).on(Operation::Vn(VnOp::Getattr), |ctx| {
                ctx.reply(vec![0xaa; 16]);
                Ok(())
            }),
        );
        h.submit(getattr(1)).unwrap();
        m.run_once().unwrap();

        let batches = h.take_batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].id.0, 1);
        assert_eq!(batches[0][0].error, 0);
        assert_eq!(batches[0][0].payload, vec![0xaa; 16]);
        assert_eq!(m.stats().suspends, 0);
        assert_eq!(m.inner.sched.live_len(), 0);
    }

    #[test]
    fn test_replies_keep_request_ids() {
        let (m, h) = mount(
            Usermount::builder(config())
                .on(Operation::Vn(VnOp::Getattr), |_| Ok(()))
                .on(Operation::Vn(VnOp::Read), |_| Err(Errno::EIO)),
        );
        h.submit(getattr(10)).unwrap();
        h.submit(RawRequest::new(11, Cookie(1), Operation::Vn(VnOp::Read), vec![])).unwrap();
        h.submit(getattr(12).fire_and_forget()).unwrap();
        h.submit(RawRequest::new(13, Cookie(1), Operation::Vn(VnOp::Write), vec![1, 2])).unwrap();
        m.run_once().unwrap();

        let replies = h.take_replies();
        let ids: Vec<u64> = replies.iter().map(|r| r.id.0).collect();
        assert_eq!(ids, vec![10, 11, 13]);
        assert_eq!(replies[1].error, Errno::EIO as i32);
        // no handler, default policy
        assert_eq!(replies[2].error, Errno::EOPNOTSUPP as i32);

        let s = m.stats();
        assert_eq!(s.requests, 4);
        assert_eq!(s.replies, 3);
        assert_eq!(s.fire_and_forget, 1);
    }

    #[test]
    fn test_cache_and_admin_never_replied() {
        let (m, h) = mount(Usermount::builder(config()));
        h.submit(RawRequest::new(1, Cookie(1), Operation::Cache(umfs_core::request::CacheOp::Write), vec![0; 8]))
            .unwrap();
        h.submit(RawRequest::new(2, Cookie(1), Operation::Admin(umfs_core::request::AdminOp::Error), vec![]))
            .unwrap();
        m.run_once().unwrap();
        assert!(h.take_replies().is_empty());
        assert_eq!(m.stats().fire_and_forget, 2);
    }

    #[test]
    fn test_unknown_request_gets_einval() {
        let (m, h) = mount(Usermount::builder(config()));
        let mut raw = getattr(7);
        raw.class = 9;
        h.submit(raw).unwrap();
        let mut silent = getattr(8).fire_and_forget();
        silent.opcode = 999;
        h.submit(silent).unwrap();
        m.run_once().unwrap();

        let replies = h.take_replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id.0, 7);
        assert_eq!(replies[0].error, Errno::EINVAL as i32);
        assert_eq!(m.stats().protocol_errors, 2);
        assert!(matches!(m.take_last_error(), Some(UmError::UnknownRequest { .. })));
    }

    #[test]
    fn test_yield_and_schedule() {
        let parked: Rc<Cell<ContinuationId>> = Rc::new(Cell::new(ContinuationId::NONE));
        let p = parked.clone();
        let (m, h) = mount(Usermount::builder(config()).on(Operation::Vn(VnOp::Getattr), move |ctx| {
            p.set(ctx.continuation());
            ctx.mount().yield_now().map_err(|e| e.errno())?;
            ctx.reply(b"late".to_vec());
            Ok(())
        }));
        h.submit(getattr(1)).unwrap();
        m.run_once().unwrap();
        assert!(h.take_replies().is_empty());
        assert!(parked.get().is_some());

        m.schedule(parked.get()).unwrap();
        m.run_once().unwrap();
        let replies = h.take_replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].payload, b"late");
        assert_eq!(m.stats().suspends, 1);
    }

    #[test]
    fn test_one_continuation_runs_at_a_time() {
        let seen: Rc<RefCell<Vec<ContinuationId>>> = Rc::default();
        let s = seen.clone();
        let (m, h) = mount(Usermount::builder(config()).on(Operation::Vn(VnOp::Getattr), move |ctx| {
            let me = ctx.continuation();
            assert_eq!(ctx.mount().current(), Some(me));
            // direct resume of anything from inside a continuation is refused
            assert_eq!(ctx.mount().resume(me), Err(UmError::AlreadyRunning(me)));
            s.borrow_mut().push(me);
            Ok(())
        }));
        for id in 1..=3 {
            h.submit(getattr(id)).unwrap();
        }
        m.run_once().unwrap();
        assert_eq!(seen.borrow().len(), 3);
        assert_eq!(m.current(), None);
    }

    #[test]
    fn test_spawn_runs_on_next_pass() {
        let hits = Rc::new(Cell::new(0));
        let (m, _h) = mount(Usermount::builder(config()));
        let c = hits.clone();
        m.spawn(move |mount| {
            assert!(mount.current().is_some());
            c.set(c.get() + 1);
        })
        .unwrap();
        assert_eq!(hits.get(), 0);
        m.run_once().unwrap();
        assert_eq!(hits.get(), 1);
        assert_eq!(m.inner.sched.live_len(), 0);
    }

    #[test]
    fn test_unmount_request_ends_loop() {
        let (m, h) = mount(Usermount::builder(config()));
        h.submit(getattr(1)).unwrap();
        h.submit(RawRequest::new(2, Cookie(1), Operation::Vfs(VfsOp::Unmount), vec![])).unwrap();
        m.mainloop().unwrap();

        assert!(m.state().is_unmounted());
        let ids: Vec<u64> = h.take_replies().iter().map(|r| r.id.0).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_transport_gone_ends_loop() {
        let iterations = Rc::new(Cell::new(0));
        let i = iterations.clone();
        let (m, h) = mount(Usermount::builder(config()).loop_hook(move |_| i.set(i.get() + 1)));
        h.submit(getattr(1)).unwrap();
        h.unmount().unwrap();
        m.mainloop().unwrap();
        assert_eq!(h.take_replies().len(), 1);
        assert!(iterations.get() >= 1);
        assert!(m.state().is_unmounted());
    }

    #[test]
    fn test_path_tracking_lifecycle() {
        let next = Rc::new(Cell::new(2u64));
        let n = next.clone();
        let create = move |ctx: &mut OpContext<'_>| {
            let cookie = Cookie(n.get());
            n.set(n.get() + 1);
            ctx.set_new_node(cookie);
            Ok(())
        };
        let (m, h) = mount(
            Usermount::builder(config().path_tracking(true))
                .on(Operation::Vn(VnOp::Lookup), create.clone())
                .on(Operation::Vn(VnOp::Mkdir), create)
                .on(Operation::Vn(VnOp::Rename), |_| Ok(())),
        );

        h.submit(
            RawRequest::new(1, Cookie(1), Operation::Vn(VnOp::Lookup), vec![]).with_names(ComponentNames::new("etc")),
        )
        .unwrap();
        h.submit(
            RawRequest::new(2, Cookie(2), Operation::Vn(VnOp::Mkdir), vec![]).with_names(ComponentNames::new("x")),
        )
        .unwrap();
        m.run_once().unwrap();
        assert_eq!(m.node(Cookie(2)).and_then(|n| n.path), Some(FsPath::new("/etc")));
        assert_eq!(m.node(Cookie(3)).and_then(|n| n.path), Some(FsPath::new("/etc/x")));

        h.submit(
            RawRequest::new(3, Cookie(1), Operation::Vn(VnOp::Rename), vec![])
                .with_names(ComponentNames::rename("etc", Cookie(1), "conf")),
        )
        .unwrap();
        h.submit(RawRequest::new(4, Cookie(3), Operation::Vn(VnOp::Reclaim), vec![]).fire_and_forget())
            .unwrap();
        m.run_once().unwrap();

        assert_eq!(m.node(Cookie(2)).and_then(|n| n.path), Some(FsPath::new("/conf")));
        assert!(m.node(Cookie(3)).is_none());
        assert_eq!(m.node_count(), 2);
        let errors: Vec<i32> = h.take_replies().iter().map(|r| r.error).collect();
        assert_eq!(errors, vec![0, 0, 0]);
    }

    #[test]
    fn test_path_build_failure_skips_handler() {
        let called = Rc::new(Cell::new(false));
        let c = called.clone();
        let (m, h) = mount(Usermount::builder(config().path_tracking(true)).on(
            Operation::Vn(VnOp::Lookup),
            move |_| {
                c.set(true);
                Ok(())
            },
        ));
        h.submit(
            RawRequest::new(1, Cookie(1), Operation::Vn(VnOp::Lookup), vec![]).with_names(ComponentNames::new("a/b")),
        )
        .unwrap();
        m.run_once().unwrap();

        assert!(!called.get());
        let replies = h.take_replies();
        assert_eq!(replies[0].error, Errno::EINVAL as i32);
        assert_eq!(m.node_count(), 1);
        assert_eq!(m.stats().protocol_errors, 1);
        assert_eq!(m.take_last_error(), Some(UmError::PathBuild(Errno::EINVAL)));
    }

    #[test]
    fn test_cookie_mapper_with_path_tracking() {
        let next = Rc::new(Cell::new(2u64));
        let n = next.clone();
        let create = move |ctx: &mut OpContext<'_>| {
            let cookie = Cookie(n.get());
            n.set(n.get() + 1);
            ctx.set_new_node(cookie);
            Ok(())
        };
        let (m, h) = mount(
            Usermount::builder(config().path_tracking(true))
                .cookie_mapper(|c: Cookie| Cookie(c.0 + 100))
                .on(Operation::Vn(VnOp::Lookup), create.clone())
                .on(Operation::Vn(VnOp::Mkdir), create),
        );
        h.submit(
            RawRequest::new(1, Cookie(1), Operation::Vn(VnOp::Lookup), vec![]).with_names(ComponentNames::new("etc")),
        )
        .unwrap();
        h.submit(
            RawRequest::new(2, Cookie(2), Operation::Vn(VnOp::Mkdir), vec![]).with_names(ComponentNames::new("x")),
        )
        .unwrap();
        m.run_once().unwrap();

        let errors: Vec<i32> = h.take_replies().iter().map(|r| r.error).collect();
        assert_eq!(errors, vec![0, 0]);
        assert_eq!(m.node(Cookie(1)).and_then(|n| n.path), Some(FsPath::root()));
        assert_eq!(m.node(Cookie(2)).and_then(|n| n.path), Some(FsPath::new("/etc")));
        assert_eq!(m.node(Cookie(3)).and_then(|n| n.path), Some(FsPath::new("/etc/x")));
        // keyed by node, not by kernel cookie
        assert!(m.inner.nodes.borrow().get(Cookie(102)).is_some());
        assert!(m.inner.nodes.borrow().get(Cookie(2)).is_none());
    }

    #[test]
    fn test_handler_panic_answers_eio() {
        let (m, h) = mount(
            Usermount::builder(config())
                .on(Operation::Vn(VnOp::Read), |_| panic!("handler bug"))
                .on(Operation::Vn(VnOp::Getattr), |ctx| {
                    ctx.reply(b"ok".to_vec());
                    Ok(())
                }),
        );
        h.submit(RawRequest::new(1, Cookie(1), Operation::Vn(VnOp::Read), vec![])).unwrap();
        h.submit(getattr(2)).unwrap();
        h.submit(RawRequest::new(3, Cookie(1), Operation::Vn(VnOp::Read), vec![]).fire_and_forget())
            .unwrap();
        m.run_once().unwrap();

        let replies = h.take_replies();
        let ids: Vec<u64> = replies.iter().map(|r| r.id.0).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(replies[0].error, Errno::EIO as i32);
        assert_eq!(replies[1].payload, b"ok");
        assert_eq!(m.stats().handler_panics, 2);
        assert_eq!(m.inner.sched.live_len(), 0);
        assert_eq!(m.current(), None);
    }

    #[test]
    fn test_spawned_panic_is_contained() {
        let (m, _h) = mount(Usermount::builder(config()));
        m.spawn(|_| panic!("background bug")).unwrap();
        m.run_once().unwrap();
        assert_eq!(m.stats().handler_panics, 1);
        assert_eq!(m.inner.sched.live_len(), 0);
    }

    #[test]
    fn test_malformed_cache_hint_not_answered() {
        let (m, h) = mount(Usermount::builder(config()));
        let mut hint = RawRequest::new(5, Cookie(1), Operation::Cache(umfs_core::request::CacheOp::Write), vec![0; 8]);
        hint.len += 1;
        h.submit(hint).unwrap();
        let mut notice = RawRequest::new(6, Cookie(1), Operation::Admin(umfs_core::request::AdminOp::Error), vec![]);
        notice.opcode = 77;
        h.submit(notice).unwrap();
        m.run_once().unwrap();

        assert!(h.take_replies().is_empty());
        assert_eq!(m.stats().protocol_errors, 2);
    }

    #[test]
    fn test_shutdown_flushes_channels() {
        use std::io::Read;
        use std::os::unix::io::AsRawFd;
        use std::os::unix::net::UnixStream;

        let (ours, mut peer) = UnixStream::pair().unwrap();
        let fd = ours.as_raw_fd();
        let lost: Rc<RefCell<Option<UmError>>> = Rc::default();
        let l = lost.clone();
        let (m, h) = mount(Usermount::builder(config()).on(Operation::Vfs(VfsOp::Unmount), move |ctx| {
            let mount = ctx.mount();
            mount
                .enqueue_justsend(fd, LengthPrefixed::frame(1, b"bye"))
                .map_err(|e| e.errno())?;
            let l = l.clone();
            mount
                .enqueue_callback(fd, LengthPrefixed::frame(2, b"ack?"), move |_, r| {
                    *l.borrow_mut() = r.err();
                })
                .map_err(|e| e.errno())?;
            Ok(())
        }));
        m.add_channel(fd).unwrap();

        h.submit(RawRequest::new(9, Cookie(1), Operation::Vfs(VfsOp::Unmount), vec![])).unwrap();
        m.mainloop().unwrap();

        // both frames went out before the channel was dropped
        peer.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let first = LengthPrefixed::frame(1, b"bye");
        let second = LengthPrefixed::frame(2, b"ack?");
        let mut wire = vec![0u8; first.len() + second.len()];
        peer.read_exact(&mut wire).unwrap();
        assert_eq!(&wire[..first.len()], first.as_bytes());
        assert_eq!(&wire[first.len()..], second.as_bytes());

        assert_eq!(
            *lost.borrow(),
            Some(UmError::ChannelRemoved { fd, errno: Errno::ESHUTDOWN })
        );
        assert!(m.channel_info(fd).is_none());
        assert_eq!(h.take_replies()[0].id.0, 9);
        assert_eq!(m.stats().frames_sent, 2);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let (t, _h) = LoopbackTransport::new().unwrap();
        let err = Usermount::builder(config().max_batch_ops(0)).build(t).unwrap_err();
        assert!(matches!(err, UmError::Config(_)));
    }
}
