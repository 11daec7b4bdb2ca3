//! Continuation scheduler
//!
//! Owns every live continuation of a mount, the FIFO ready queue and the
//! pending-destruction set.
//!
//! A continuation that releases itself while running cannot have its stack
//! freed under its feet; it is parked in the pending set and freed by
//! [`Scheduler::drain_pending`] once control is back at the loop.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use umfs_core::error::{UmError, UmResult};
use umfs_core::id::ContinuationId;
use umfs_core::state::ContinuationState;

use crate::continuation::{Continuation, Entry};
use crate::tls;

/// Registry, ready queue and deferred destruction for one mount
pub struct Scheduler {
    stack_size: usize,
    synthetic: bool,
    next_id: Cell<ContinuationId>,
    live: RefCell<HashMap<ContinuationId, Rc<Continuation>>>,
    ready: RefCell<VecDeque<ContinuationId>>,
    pending: RefCell<Vec<Rc<Continuation>>>,
}

impl Scheduler {
    /// Scheduler creating real continuations with `stack_size` stacks, or
    /// synthetic ones when `synthetic` is set
    pub fn new(stack_size: usize, synthetic: bool) -> Self {
        Self {
            stack_size,
            synthetic,
            next_id: Cell::new(ContinuationId::new(0)),
            live: RefCell::new(HashMap::new()),
            ready: RefCell::new(VecDeque::new()),
            pending: RefCell::new(Vec::new()),
        }
    }

    /// Whether new continuations are synthetic
    #[inline]
    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    fn alloc_id(&self) -> ContinuationId {
        let live = self.live.borrow();
        let mut id = self.next_id.get();
        while live.contains_key(&id) {
            id = id.next();
        }
        self.next_id.set(id.next());
        id
    }

    /// Create a continuation running `entry`; it starts on first resume
    pub fn create(&self, entry: Entry) -> UmResult<ContinuationId> {
        let id = self.alloc_id();
        let cc = if self.synthetic {
            Continuation::synthetic(id, entry)
        } else {
            Continuation::new(id, self.stack_size, entry)?
        };
        self.live.borrow_mut().insert(id, cc);
        tracing::trace!(cc = %id, synthetic = self.synthetic, "continuation created");
        Ok(id)
    }

    pub fn get(&self, id: ContinuationId) -> Option<Rc<Continuation>> {
        self.live.borrow().get(&id).cloned()
    }

    /// Continuation of this scheduler that is executing right now
    pub fn current(&self) -> Option<Rc<Continuation>> {
        let id = tls::current_id();
        if id.is_none() {
            return None;
        }
        if let Some(cc) = self.live.borrow().get(&id) {
            return Some(cc.clone());
        }
        // a continuation that released itself is still running from pending
        self.pending.borrow().iter().find(|cc| cc.id() == id).cloned()
    }

    /// Resume a continuation directly
    pub fn resume(&self, id: ContinuationId) -> UmResult<()> {
        let cc = self.get(id).ok_or(UmError::ContinuationNotFound(id))?;
        cc.resume()
    }

    /// Append a continuation to the ready queue
    ///
    /// Queuing an already queued continuation is a no-op.
    pub fn schedule(&self, id: ContinuationId) -> UmResult<()> {
        let cc = self.get(id).ok_or(UmError::ContinuationNotFound(id))?;
        if cc.state().is_done() {
            return Err(UmError::InvalidState(id));
        }
        let mut ready = self.ready.borrow_mut();
        if !ready.contains(&id) {
            ready.push_back(id);
        }
        Ok(())
    }

    /// Number of continuations waiting in the ready queue
    pub fn ready_len(&self) -> usize {
        self.ready.borrow().len()
    }

    /// Resume everything queued when the call started, in FIFO order
    ///
    /// Continuations scheduled while this runs wait for the next call.
    /// Returns how many were resumed.
    pub fn run_ready(&self) -> usize {
        let batch = std::mem::take(&mut *self.ready.borrow_mut());
        let mut resumed = 0;
        for id in batch {
            let Some(cc) = self.get(id) else {
                tracing::debug!(cc = %id, "scheduled continuation is gone");
                continue;
            };
            match cc.resume() {
                Ok(()) => resumed += 1,
                Err(e) => tracing::warn!(cc = %id, error = %e, "resume from ready queue failed"),
            }
        }
        resumed
    }

    /// Give up a continuation
    ///
    /// A continuation that is not running is freed at once. A running one
    /// (typically releasing itself) goes to the pending-destruction set.
    pub fn release(&self, id: ContinuationId) {
        let Some(cc) = self.live.borrow_mut().remove(&id) else {
            return;
        };
        self.ready.borrow_mut().retain(|queued| *queued != id);
        if cc.state() == ContinuationState::Running || tls::current_id() == id {
            self.pending.borrow_mut().push(cc);
        } else {
            drop(cc);
        }
    }

    /// Free continuations whose destruction was deferred
    ///
    /// Does nothing while any continuation is executing.
    pub fn drain_pending(&self) -> usize {
        if tls::in_continuation() {
            return 0;
        }
        let drained = std::mem::take(&mut *self.pending.borrow_mut());
        let n = drained.len();
        drop(drained);
        n
    }

    pub fn pending_len(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Number of live (not yet released) continuations
    pub fn live_len(&self) -> usize {
        self.live.borrow().len()
    }

    /// Free everything; suspended continuations are dropped without resuming
    pub fn teardown(&self) {
        self.ready.borrow_mut().clear();
        let live: Vec<_> = self.live.borrow_mut().drain().map(|(_, cc)| cc).collect();
        let suspended = live
            .iter()
            .filter(|cc| cc.state() == ContinuationState::Suspended)
            .count();
        if suspended > 0 {
            tracing::warn!(suspended, "tearing down with suspended continuations");
        }
        drop(live);
        self.drain_pending();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("synthetic", &self.synthetic)
            .field("live", &self.live_len())
            .field("ready", &self.ready_len())
            .field("pending", &self.pending_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STACK: usize = 64 * 1024;

    fn log_entry(log: &Rc<RefCell<Vec<u32>>>, tag: u32) -> Entry {
        let log = log.clone();
        Box::new(move |me| {
            log.borrow_mut().push(tag);
            me.suspend().unwrap();
            log.borrow_mut().push(tag + 100);
        })
    }

    #[test]
    fn test_ready_queue_is_fifo() {
        let sched = Scheduler::new(STACK, false);
        let log = Rc::new(RefCell::new(Vec::new()));

        let ids: Vec<_> = (1..=3)
            .map(|tag| sched.create(log_entry(&log, tag)).unwrap())
            .collect();
        for id in &ids {
            sched.resume(*id).unwrap();
        }
        // wake in reverse creation order
        for id in ids.iter().rev() {
            sched.schedule(*id).unwrap();
        }
        assert_eq!(sched.run_ready(), 3);
        assert_eq!(*log.borrow(), vec![1, 2, 3, 103, 102, 101]);
    }

    #[test]
    fn test_schedule_dedupes() {
        let sched = Scheduler::new(STACK, false);
        let log = Rc::new(RefCell::new(Vec::new()));
        let id = sched.create(log_entry(&log, 1)).unwrap();
        sched.resume(id).unwrap();
        sched.schedule(id).unwrap();
        sched.schedule(id).unwrap();
        assert_eq!(sched.ready_len(), 1);
    }

    #[test]
    fn test_self_release_is_deferred() {
        let sched = Rc::new(Scheduler::new(STACK, false));
        let s = sched.clone();
        let id = sched
            .create(Box::new(move |me| {
                s.release(me.id());
                assert_eq!(s.pending_len(), 1);
                // nothing is freed while a continuation runs
                assert_eq!(s.drain_pending(), 0);
            }))
            .unwrap();

        sched.resume(id).unwrap();
        assert_eq!(sched.live_len(), 0);
        assert_eq!(sched.pending_len(), 1);
        assert_eq!(sched.drain_pending(), 1);
        assert_eq!(sched.pending_len(), 0);
    }

    #[test]
    fn test_release_idle_frees_immediately() {
        let sched = Scheduler::new(STACK, false);
        let id = sched.create(Box::new(|_| {})).unwrap();
        sched.release(id);
        assert_eq!(sched.live_len(), 0);
        assert_eq!(sched.pending_len(), 0);
        assert!(matches!(
            sched.schedule(id),
            Err(UmError::ContinuationNotFound(_))
        ));
    }

    #[test]
    fn test_current_inside_continuation() {
        let sched = Rc::new(Scheduler::new(STACK, true));
        let seen = Rc::new(Cell::new(ContinuationId::NONE));
        let (s, out) = (sched.clone(), seen.clone());
        let id = sched
            .create(Box::new(move |_| {
                out.set(s.current().map_or(ContinuationId::NONE, |cc| cc.id()));
            }))
            .unwrap();
        sched.resume(id).unwrap();
        assert_eq!(seen.get(), id);
        assert!(sched.current().is_none());
    }

    #[test]
    fn test_teardown_with_suspended() {
        let sched = Scheduler::new(STACK, false);
        let log = Rc::new(RefCell::new(Vec::new()));
        let id = sched.create(log_entry(&log, 1)).unwrap();
        sched.resume(id).unwrap();
        sched.teardown();
        assert_eq!(sched.live_len(), 0);
        assert_eq!(*log.borrow(), vec![1]);
    }
}
