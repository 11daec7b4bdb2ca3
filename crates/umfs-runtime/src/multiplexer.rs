//! Stream multiplexing on a mount
//!
//! Handlers talk to backing services over registered descriptors. A frame
//! is queued on the descriptor's channel and its sender either suspends
//! until the reply is matched, registers a callback, or does not wait at
//! all. The event loop does the actual I/O when the poller reports
//! readiness.

use std::os::unix::io::RawFd;

use nix::errno::Errno;
use umfs_core::error::{UmError, UmResult};
use umfs_core::framebuf::FrameBuffer;

use crate::channel::{Discarded, FdIo, StreamChannel, Waiter};
use crate::mount::{FdEvent, Usermount};

/// Queue sizes and state of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub outbound: usize,
    pub awaiting: usize,
    pub partial: bool,
    pub read_gone: bool,
    pub write_gone: bool,
}

fn set_nonblocking(fd: RawFd) -> UmResult<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(UmError::Os(Errno::last()));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(UmError::Os(Errno::last()));
    }
    Ok(())
}

impl Usermount {
    /// Register `fd` as a framed stream channel
    ///
    /// The descriptor is switched to non-blocking mode. The caller keeps
    /// ownership and must not close it before [`remove_channel`](Self::remove_channel).
    pub fn add_channel(&self, fd: RawFd) -> UmResult<()> {
        if self.inner.channels.borrow().contains_key(&fd) || fd == self.inner.control_fd {
            return Err(UmError::ChannelExists(fd));
        }
        set_nonblocking(fd)?;
        self.inner.poller.add(fd, true, false)?;

        let mut ch = StreamChannel::new(fd);
        ch.interest = Some((true, false));
        self.inner.channels.borrow_mut().insert(fd, ch);
        tracing::debug!(fd, "channel added");
        Ok(())
    }

    /// Drop `fd` and everything queued on it
    ///
    /// Waiters of the discarded frames are told `ChannelRemoved` with
    /// `errno`. Nothing more is read from or written to `fd`.
    pub fn remove_channel(&self, fd: RawFd, errno: Errno) -> UmResult<Discarded> {
        let mut ch = self
            .inner
            .channels
            .borrow_mut()
            .remove(&fd)
            .ok_or(UmError::NoChannel(fd))?;
        if ch.interest.is_some() {
            if let Err(e) = self.inner.poller.delete(fd) {
                tracing::debug!(fd, error = %e, "poller delete");
            }
        }
        let (discarded, waiters) = ch.discard_all();
        tracing::debug!(fd, ?discarded, "channel removed");
        for w in waiters {
            self.wake(w, Err(UmError::ChannelRemoved { fd, errno }));
        }
        Ok(discarded)
    }

    /// Empty frame for building a request, recycled when the pool has one
    pub fn frame(&self) -> FrameBuffer {
        self.inner.pool.get()
    }

    /// Hand a spent frame back for reuse
    pub fn recycle_frame(&self, frame: FrameBuffer) {
        self.inner.pool.put(frame);
    }

    pub fn channel_info(&self, fd: RawFd) -> Option<ChannelInfo> {
        self.inner.channels.borrow().get(&fd).map(|ch| ChannelInfo {
            outbound: ch.outbound_len(),
            awaiting: ch.awaiting_len(),
            partial: ch.has_partial(),
            read_gone: ch.is_read_gone(),
            write_gone: ch.is_write_gone(),
        })
    }

    /// Send `frame` on `fd` and suspend until its reply arrives
    ///
    /// Must be called from a real continuation; with continuations disabled
    /// this fails with `SuspendSynthetic` and nothing is queued.
    pub fn enqueue_and_suspend(&self, fd: RawFd, frame: FrameBuffer) -> UmResult<FrameBuffer> {
        let cc = self.inner.sched.current().ok_or(UmError::NotInContinuation)?;
        if cc.is_synthetic() {
            return Err(UmError::SuspendSynthetic(cc.id()));
        }
        self.enqueue(fd, frame, Waiter::Continuation(cc.id()))?;
        loop {
            self.inner.stats.suspend();
            cc.suspend()?;
            if let Some(result) = cc.take_delivery() {
                return result;
            }
            tracing::trace!(cc = %cc.id(), "resumed without a reply");
        }
    }

    /// Send `frame` on `fd`; `cb` runs with the reply or the failure
    pub fn enqueue_callback<F>(&self, fd: RawFd, frame: FrameBuffer, cb: F) -> UmResult<()>
    where
        F: FnOnce(&Usermount, UmResult<FrameBuffer>) + 'static,
    {
        self.enqueue(fd, frame, Waiter::Callback(Box::new(cb)))
    }

    /// Send `frame` on `fd` without waiting for any reply
    pub fn enqueue_justsend(&self, fd: RawFd, frame: FrameBuffer) -> UmResult<()> {
        self.enqueue(fd, frame, Waiter::NoReply)
    }

    fn enqueue(&self, fd: RawFd, frame: FrameBuffer, waiter: Waiter) -> UmResult<()> {
        let mut chans = self.inner.channels.borrow_mut();
        let ch = chans.get_mut(&fd).ok_or(UmError::NoChannel(fd))?;
        ch.enqueue(frame, waiter)
    }

    /// Bring poller interest in line with each channel's queues
    pub(crate) fn update_interest(&self) {
        let mut chans = self.inner.channels.borrow_mut();
        for (&fd, ch) in chans.iter_mut() {
            let want = ch.desired_interest();
            if want == ch.interest {
                continue;
            }
            let poller = &self.inner.poller;
            let res = match (ch.interest, want) {
                (None, Some((r, w))) => poller.add(fd, r, w),
                (Some(_), Some((r, w))) => poller.modify(fd, r, w),
                (Some(_), None) => poller.delete(fd),
                (None, None) => Ok(()),
            };
            match res {
                Ok(()) => ch.interest = want,
                Err(e) => tracing::warn!(fd, error = %e, "cannot update channel interest"),
            }
        }
    }

    pub(crate) fn write_channel(&self, fd: RawFd) {
        let flushed = {
            let mut chans = self.inner.channels.borrow_mut();
            let Some(ch) = chans.get_mut(&fd) else { return };
            ch.flush(&mut FdIo(fd), &self.inner.pool)
        };
        self.inner.stats.frames_sent(flushed.sent);
        if let Some(errno) = flushed.error {
            tracing::warn!(fd, errno = %errno, dropped = flushed.failed.len(), "channel write failed");
            for w in flushed.failed {
                self.wake(w, Err(UmError::WriteGone { fd, errno }));
            }
            self.fd_event(fd, FdEvent::WriteGone(errno));
        }
    }

    pub(crate) fn read_channel(&self, fd: RawFd) {
        let ingest = {
            let mut chans = self.inner.channels.borrow_mut();
            let Some(ch) = chans.get_mut(&fd) else { return };
            ch.ingest(&mut FdIo(fd), self.inner.framing.as_ref(), &self.inner.pool)
        };
        for (frame, waiter) in ingest.completed {
            self.inner.stats.frame_received();
            match waiter {
                Some(w) => self.wake(w, Ok(frame)),
                None => self.unsolicited(fd, frame),
            }
        }
        if let Some(errno) = ingest.gone {
            tracing::debug!(fd, errno = ?errno, "channel read side gone");
            self.fd_event(fd, FdEvent::ReadGone(errno));
        }
    }

    fn unsolicited(&self, fd: RawFd, frame: FrameBuffer) {
        match &self.inner.on_unsolicited {
            Some(hook) => hook(self, fd, frame),
            None => {
                self.protocol_error(UmError::UnmatchedFrame { fd });
                self.inner.pool.put(frame);
            }
        }
    }

    fn fd_event(&self, fd: RawFd, event: FdEvent) {
        if let Some(hook) = &self.inner.on_fd_event {
            hook(self, fd, event);
        }
    }

    /// Hand `result` to whoever waits for it
    pub(crate) fn wake(&self, waiter: Waiter, result: UmResult<FrameBuffer>) {
        match waiter {
            Waiter::Continuation(id) => {
                let Some(cc) = self.inner.sched.get(id) else {
                    tracing::debug!(cc = %id, "reply for a continuation that is gone");
                    return;
                };
                cc.deliver(result);
                if let Err(e) = self.inner.sched.schedule(id) {
                    tracing::warn!(cc = %id, error = %e, "cannot schedule woken continuation");
                }
            }
            Waiter::Callback(cb) => cb(self, result),
            Waiter::NoReply => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountConfig;
    use crate::framing::LengthPrefixed;
    use crate::transport::LoopbackTransport;
    use std::cell::{Cell, RefCell};
    use std::io::{ErrorKind, Read, Write};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;
    use std::time::Duration;
    use umfs_core::id::Cookie;
    use umfs_core::request::{Operation, RawRequest, VnOp};

    fn config() -> MountConfig {
        MountConfig::new().poll_timeout(Duration::from_millis(20))
    }

    fn read_frame(peer: &mut UnixStream) -> (u64, Vec<u8>) {
        let mut head = [0u8; 12];
        peer.read_exact(&mut head).unwrap();
        let len = u32::from_le_bytes(head[..4].try_into().unwrap()) as usize;
        let id = u64::from_le_bytes(head[4..].try_into().unwrap());
        let mut body = vec![0u8; len - 12];
        peer.read_exact(&mut body).unwrap();
        (id, body)
    }

    #[test]
    fn test_suspend_until_backing_reply() {
        let (ours, mut peer) = UnixStream::pair().unwrap();
        let fd = ours.as_raw_fd();
        let (t, h) = LoopbackTransport::new().unwrap();
        let m = Usermount::builder(config())
            .on(Operation::Vn(VnOp::Read), move |ctx| {
                let reply = ctx
                    .mount()
                    .enqueue_and_suspend(fd, LengthPrefixed::frame(7, b"fetch"))
                    .map_err(|e| e.errno())?;
                ctx.reply(LengthPrefixed::body(&reply).to_vec());
                Ok(())
            })
            .build(t)
            .unwrap();
        m.add_channel(fd).unwrap();

        h.submit(RawRequest::new(100, Cookie(1), Operation::Vn(VnOp::Read), vec![])).unwrap();
        m.run_once().unwrap();
        m.run_once().unwrap();
        assert_eq!(read_frame(&mut peer), (7, b"fetch".to_vec()));
        assert!(h.take_replies().is_empty());
        assert_eq!(m.channel_info(fd).map(|i| i.awaiting), Some(1));

        peer.write_all(LengthPrefixed::frame(7, b"data").as_bytes()).unwrap();
        m.run_once().unwrap();

        let replies = h.take_replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id.0, 100);
        assert_eq!(replies[0].payload, b"data");
        assert_eq!(m.stats().frames_received, 1);
    }

    #[test]
    fn test_spent_frames_return_to_pool() {
        let (ours, mut peer) = UnixStream::pair().unwrap();
        let fd = ours.as_raw_fd();
        let (t, h) = LoopbackTransport::new().unwrap();
        let m = Usermount::builder(config().frame_pool(8))
            .on(Operation::Vn(VnOp::Read), move |ctx| {
                let mount = ctx.mount();
                let reply = mount
                    .enqueue_and_suspend(fd, LengthPrefixed::frame(7, b"fetch"))
                    .map_err(|e| e.errno())?;
                ctx.reply(LengthPrefixed::body(&reply).to_vec());
                mount.recycle_frame(reply);
                Ok(())
            })
            .build(t)
            .unwrap();
        m.add_channel(fd).unwrap();
        assert!(m.inner.pool.is_empty());

        m.enqueue_justsend(fd, LengthPrefixed::frame(5, b"note")).unwrap();
        h.submit(RawRequest::new(1, Cookie(1), Operation::Vn(VnOp::Read), vec![])).unwrap();
        m.run_once().unwrap();
        m.run_once().unwrap();
        assert_eq!(read_frame(&mut peer).0, 5);
        assert_eq!(read_frame(&mut peer).0, 7);

        peer.write_all(LengthPrefixed::frame(7, b"data").as_bytes()).unwrap();
        m.run_once().unwrap();
        assert_eq!(h.take_replies()[0].payload, b"data");

        // sent note, answered request and the handler's reply frame
        let pooled = m.inner.pool.len();
        assert!(pooled >= 2, "pooled {}", pooled);
        let fresh = m.frame();
        assert!(fresh.is_empty());
        assert_eq!(m.inner.pool.len(), pooled - 1);
    }

    #[test]
    fn test_synthetic_cannot_suspend() {
        let (ours, _peer) = UnixStream::pair().unwrap();
        let fd = ours.as_raw_fd();
        let (t, h) = LoopbackTransport::new().unwrap();
        let m = Usermount::builder(config().continuations(false))
            .on(Operation::Vn(VnOp::Read), move |ctx| {
                match ctx.mount().enqueue_and_suspend(fd, LengthPrefixed::frame(1, b"")) {
                    Err(UmError::SuspendSynthetic(_)) => Err(Errno::EDEADLK),
                    _ => Ok(()),
                }
            })
            .build(t)
            .unwrap();
        m.add_channel(fd).unwrap();
        h.submit(RawRequest::new(1, Cookie(1), Operation::Vn(VnOp::Read), vec![])).unwrap();
        m.run_once().unwrap();

        assert_eq!(h.take_replies()[0].error, Errno::EDEADLK as i32);
        assert_eq!(m.channel_info(fd).map(|i| i.outbound), Some(0));
        assert_eq!(
            m.enqueue_and_suspend(fd, LengthPrefixed::frame(1, b"")).unwrap_err(),
            UmError::NotInContinuation
        );
    }

    #[test]
    fn test_remove_channel_discards_everything() {
        let (ours, mut peer) = UnixStream::pair().unwrap();
        let fd = ours.as_raw_fd();
        let (t, _h) = LoopbackTransport::new().unwrap();
        let m = Usermount::builder(config()).build(t).unwrap();
        m.add_channel(fd).unwrap();

        let failures: Rc<RefCell<Vec<UmError>>> = Rc::default();
        let cb = |f: Rc<RefCell<Vec<UmError>>>| {
            move |_: &Usermount, r: UmResult<FrameBuffer>| {
                if let Err(e) = r {
                    f.borrow_mut().push(e);
                }
            }
        };
        m.enqueue_callback(fd, LengthPrefixed::frame(1, b"a"), cb(failures.clone())).unwrap();
        m.run_once().unwrap();
        m.run_once().unwrap();
        assert_eq!(read_frame(&mut peer).0, 1);

        m.enqueue_callback(fd, LengthPrefixed::frame(2, b"b"), cb(failures.clone())).unwrap();
        m.enqueue_callback(fd, LengthPrefixed::frame(3, b"c"), cb(failures.clone())).unwrap();
        let d = m.remove_channel(fd, Errno::ECONNABORTED).unwrap();
        assert_eq!((d.outbound, d.awaiting, d.partial), (2, 1, 0));
        assert_eq!(d.total(), 3);
        assert_eq!(failures.borrow().len(), 3);
        assert!(failures
            .borrow()
            .iter()
            .all(|e| *e == UmError::ChannelRemoved { fd, errno: Errno::ECONNABORTED }));

        m.run_once().unwrap();
        peer.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(peer.read(&mut buf).unwrap_err().kind(), ErrorKind::WouldBlock);
        assert_eq!(m.remove_channel(fd, Errno::EIO), Err(UmError::NoChannel(fd)));
    }

    #[test]
    fn test_justsend_and_callback_reply() {
        let (ours, mut peer) = UnixStream::pair().unwrap();
        let fd = ours.as_raw_fd();
        let (t, _h) = LoopbackTransport::new().unwrap();
        let m = Usermount::builder(config()).build(t).unwrap();
        m.add_channel(fd).unwrap();

        let got = Rc::new(RefCell::new(None));
        let g = got.clone();
        m.enqueue_justsend(fd, LengthPrefixed::frame(5, b"note")).unwrap();
        m.enqueue_callback(fd, LengthPrefixed::frame(6, b"ask"), move |_, r| {
            *g.borrow_mut() = r.ok().map(|f| LengthPrefixed::body(&f).to_vec());
        })
        .unwrap();
        m.run_once().unwrap();
        m.run_once().unwrap();
        assert_eq!(read_frame(&mut peer).0, 5);
        assert_eq!(read_frame(&mut peer).0, 6);
        assert_eq!(m.channel_info(fd).map(|i| i.awaiting), Some(1));

        peer.write_all(LengthPrefixed::frame(6, b"answer").as_bytes()).unwrap();
        m.run_once().unwrap();
        assert_eq!(got.borrow().as_deref(), Some(&b"answer"[..]));
        assert_eq!(m.stats().frames_sent, 2);
    }

    #[test]
    fn test_unmatched_frame_is_protocol_error() {
        let (ours, mut peer) = UnixStream::pair().unwrap();
        let fd = ours.as_raw_fd();
        let (t, _h) = LoopbackTransport::new().unwrap();
        let m = Usermount::builder(config()).build(t).unwrap();
        m.add_channel(fd).unwrap();

        peer.write_all(LengthPrefixed::frame(42, b"?").as_bytes()).unwrap();
        m.run_once().unwrap();
        assert_eq!(m.stats().protocol_errors, 1);
        let err = m.take_last_error().unwrap();
        assert_eq!(err, UmError::UnmatchedFrame { fd });
        assert_eq!(err.errno(), Errno::ENOMSG);
    }

    #[test]
    fn test_unsolicited_hook_and_read_gone() {
        let (ours, mut peer) = UnixStream::pair().unwrap();
        let fd = ours.as_raw_fd();
        let seen = Rc::new(Cell::new(0u64));
        let gone = Rc::new(Cell::new(false));
        let (s, g) = (seen.clone(), gone.clone());
        let (t, _h) = LoopbackTransport::new().unwrap();
        let m = Usermount::builder(config())
            .on_unsolicited(move |_, _, frame| s.set(LengthPrefixed::id(&frame).unwrap_or(0)))
            .on_fd_event(move |_, _, ev| g.set(ev == FdEvent::ReadGone(None)))
            .build(t)
            .unwrap();
        m.add_channel(fd).unwrap();

        peer.write_all(LengthPrefixed::frame(42, b"push").as_bytes()).unwrap();
        drop(peer);
        m.run_once().unwrap();
        assert_eq!(seen.get(), 42);
        assert!(gone.get());
        assert_eq!(m.stats().protocol_errors, 0);
        assert_eq!(m.channel_info(fd).map(|i| i.read_gone), Some(true));

        // nothing left to poll for on this channel
        m.run_once().unwrap();
        assert_eq!(m.inner.channels.borrow().get(&fd).and_then(|c| c.interest), None);
    }

    #[test]
    fn test_write_gone_fails_waiters() {
        let (ours, peer) = UnixStream::pair().unwrap();
        let fd = ours.as_raw_fd();
        let events = Rc::new(RefCell::new(Vec::new()));
        let e = events.clone();
        let (t, _h) = LoopbackTransport::new().unwrap();
        let m = Usermount::builder(config())
            .on_fd_event(move |_, _, ev| e.borrow_mut().push(ev))
            .build(t)
            .unwrap();
        m.add_channel(fd).unwrap();
        drop(peer);

        let failed = Rc::new(Cell::new(false));
        let f = failed.clone();
        m.enqueue_callback(fd, LengthPrefixed::frame(1, b"x"), move |_, r| {
            f.set(matches!(r, Err(UmError::WriteGone { .. })));
        })
        .unwrap();
        m.run_once().unwrap();
        m.run_once().unwrap();

        assert!(failed.get());
        assert!(events.borrow().contains(&FdEvent::WriteGone(Errno::EPIPE)));
        assert_eq!(
            m.enqueue_justsend(fd, LengthPrefixed::frame(2, b"y")),
            Err(UmError::WriteGone { fd, errno: Errno::EPIPE })
        );
    }

    #[test]
    fn test_duplicate_channel_rejected() {
        let (ours, _peer) = UnixStream::pair().unwrap();
        let (t, _h) = LoopbackTransport::new().unwrap();
        let m = Usermount::builder(config()).build(t).unwrap();
        m.add_channel(ours.as_raw_fd()).unwrap();
        assert_eq!(
            m.add_channel(ours.as_raw_fd()),
            Err(UmError::ChannelExists(ours.as_raw_fd()))
        );
    }
}
