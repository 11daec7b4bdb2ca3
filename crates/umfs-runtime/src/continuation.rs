//! Continuations
//!
//! A continuation is one suspendable flow of control. Real continuations run
//! on their own mmap'd stack and switch with the caller through
//! [`crate::arch::context_switch`]; synthetic ones run inline on the caller's
//! stack and cannot suspend.
//!
//! `resume` returns only when the continuation suspends or finishes. A panic
//! inside a continuation is caught on its own stack and re-raised by
//! `resume` on the caller's stack.

use std::any::Any;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::rc::Rc;

use umfs_core::error::{UmError, UmResult};
use umfs_core::framebuf::FrameBuffer;
use umfs_core::id::ContinuationId;
use umfs_core::state::ContinuationState;

use crate::arch::{context_switch, init_context, SavedRegs};
use crate::memory::Stack;
use crate::tls;

/// Code run by a continuation, handed its own continuation
pub type Entry = Box<dyn FnOnce(&Continuation)>;

enum Kind {
    Real {
        stack: Stack,
        /// Registers of the continuation while it is not running
        regs: UnsafeCell<SavedRegs>,
        /// Registers of whoever last resumed it
        caller: UnsafeCell<SavedRegs>,
    },
    Synthetic,
}

/// One suspendable unit of execution
pub struct Continuation {
    id: ContinuationId,
    state: Cell<ContinuationState>,
    kind: Kind,
    entry: Cell<Option<Entry>>,
    panic: Cell<Option<Box<dyn Any + Send>>>,
    fire_and_forget: Cell<bool>,
    /// Result handed over by whoever scheduled this continuation back
    mailbox: RefCell<Option<UmResult<FrameBuffer>>>,
}

impl Continuation {
    /// Create a continuation with its own stack of at least `stack_size` bytes
    pub fn new(id: ContinuationId, stack_size: usize, entry: Entry) -> UmResult<Rc<Continuation>> {
        let stack = Stack::new(stack_size)?;
        Ok(Rc::new(Continuation {
            id,
            state: Cell::new(ContinuationState::Created),
            kind: Kind::Real {
                stack,
                regs: UnsafeCell::new(SavedRegs::default()),
                caller: UnsafeCell::new(SavedRegs::default()),
            },
            entry: Cell::new(Some(entry)),
            panic: Cell::new(None),
            fire_and_forget: Cell::new(false),
            mailbox: RefCell::new(None),
        }))
    }

    /// Create a continuation that runs inline and never suspends
    pub fn synthetic(id: ContinuationId, entry: Entry) -> Rc<Continuation> {
        Rc::new(Continuation {
            id,
            state: Cell::new(ContinuationState::Created),
            kind: Kind::Synthetic,
            entry: Cell::new(Some(entry)),
            panic: Cell::new(None),
            fire_and_forget: Cell::new(false),
            mailbox: RefCell::new(None),
        })
    }

    #[inline]
    pub fn id(&self) -> ContinuationId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> ContinuationState {
        self.state.get()
    }

    #[inline]
    pub fn is_synthetic(&self) -> bool {
        matches!(self.kind, Kind::Synthetic)
    }

    #[inline]
    pub fn is_fire_and_forget(&self) -> bool {
        self.fire_and_forget.get()
    }

    pub fn set_fire_and_forget(&self, faf: bool) {
        self.fire_and_forget.set(faf);
    }

    /// Transfer control to this continuation
    ///
    /// Fails with `AlreadyRunning` if any continuation is executing on this
    /// thread, so at most one is ever running.
    pub fn resume(self: &Rc<Self>) -> UmResult<()> {
        let running = tls::current_id();
        if running.is_some() {
            return Err(UmError::AlreadyRunning(running));
        }
        let state = self.state.get();
        self.transition(ContinuationState::Running)?;
        tls::set_current(self.id);

        match &self.kind {
            Kind::Synthetic => {
                let this: &Continuation = self;
                let outcome = this
                    .entry
                    .take()
                    .map(|entry| catch_unwind(AssertUnwindSafe(|| entry(this))));
                self.finish();
                tls::clear_current();
                if let Some(Err(payload)) = outcome {
                    resume_unwind(payload);
                }
            }
            Kind::Real {
                stack,
                regs,
                caller,
            } => {
                unsafe {
                    if state == ContinuationState::Created {
                        init_context(
                            &mut *regs.get(),
                            stack.top(),
                            continuation_main as usize,
                            Rc::as_ptr(self) as usize,
                        );
                    }
                    context_switch(caller.get(), regs.get());
                }
                tls::clear_current();
                if let Some(payload) = self.panic.take() {
                    resume_unwind(payload);
                }
            }
        }
        Ok(())
    }

    /// Give control back to whoever last resumed this continuation
    ///
    /// Must be called from inside the continuation itself. Returns once the
    /// continuation is resumed again.
    pub fn suspend(&self) -> UmResult<()> {
        if tls::current_id() != self.id {
            return Err(UmError::NotInContinuation);
        }
        match &self.kind {
            Kind::Synthetic => Err(UmError::SuspendSynthetic(self.id)),
            Kind::Real { regs, caller, .. } => {
                self.transition(ContinuationState::Suspended)?;
                unsafe { context_switch(regs.get(), caller.get()) };
                Ok(())
            }
        }
    }

    /// Move to `next`, refusing transitions the state machine does not allow
    fn transition(&self, next: ContinuationState) -> UmResult<()> {
        if !self.state.get().can_transition_to(next) {
            return Err(UmError::InvalidState(self.id));
        }
        self.state.set(next);
        Ok(())
    }

    /// Entry point returned; only ever reached while running
    fn finish(&self) {
        debug_assert!(self.state.get().can_transition_to(ContinuationState::Done));
        self.state.set(ContinuationState::Done);
    }

    /// Leave a result for the continuation to pick up once resumed
    pub(crate) fn deliver(&self, result: UmResult<FrameBuffer>) {
        *self.mailbox.borrow_mut() = Some(result);
    }

    /// Take the result left by [`deliver`](Self::deliver)
    pub(crate) fn take_delivery(&self) -> Option<UmResult<FrameBuffer>> {
        self.mailbox.borrow_mut().take()
    }
}

impl Drop for Continuation {
    fn drop(&mut self) {
        if self.state.get() == ContinuationState::Suspended {
            // Values still live on the abandoned stack are never dropped.
            tracing::debug!(cc = %self.id, "freeing suspended continuation");
        }
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Continuation")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("synthetic", &self.is_synthetic())
            .finish()
    }
}

/// First Rust frame on a real continuation's stack
extern "C" fn continuation_main(arg: usize) -> ! {
    let cc = unsafe { &*(arg as *const Continuation) };

    if let Some(entry) = cc.entry.take() {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| entry(cc))) {
            cc.panic.set(Some(payload));
        }
    }
    cc.finish();

    if let Kind::Real { regs, caller, .. } = &cc.kind {
        unsafe { context_switch(regs.get(), caller.get()) };
    }
    // A finished continuation is never switched to again.
    std::process::abort();
}
