//! Continuation and mount state types

use core::fmt;

/// State of a continuation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationState {
    /// Just created, entry point not yet started
    Created = 0,

    /// Currently executing (at most one per mount)
    Running = 1,

    /// Parked inside `suspend`, waiting to be resumed
    Suspended = 2,

    /// Entry point returned, awaiting reclamation
    Done = 3,
}

impl ContinuationState {
    /// Check if the entry point has returned
    #[inline]
    pub const fn is_done(&self) -> bool {
        matches!(self, ContinuationState::Done)
    }

    /// Check whether `self -> next` is a legal transition
    pub const fn can_transition_to(&self, next: ContinuationState) -> bool {
        use ContinuationState::*;
        matches!(
            (*self, next),
            (Created, Running) | (Running, Suspended) | (Suspended, Running) | (Running, Done)
        )
    }
}

impl fmt::Display for ContinuationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContinuationState::Created => write!(f, "created"),
            ContinuationState::Running => write!(f, "running"),
            ContinuationState::Suspended => write!(f, "suspended"),
            ContinuationState::Done => write!(f, "done"),
        }
    }
}

/// External state of a mounted instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MountState {
    /// Built but the loop has not started
    #[default]
    Mounting,

    /// Event loop is serving requests
    Running,

    /// Unmount observed; the loop exits after the current iteration
    Unmounted,
}

impl MountState {
    #[inline]
    pub const fn is_unmounted(&self) -> bool {
        matches!(self, MountState::Unmounted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use ContinuationState::*;
        assert!(Created.can_transition_to(Running));
        assert!(Running.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Running));
        assert!(Running.can_transition_to(Done));

        assert!(!Created.can_transition_to(Done));
        assert!(!Done.can_transition_to(Running));
        assert!(!Suspended.can_transition_to(Done));
    }

    #[test]
    fn test_mount_state_default() {
        assert_eq!(MountState::default(), MountState::Mounting);
        assert!(MountState::Unmounted.is_unmounted());
    }
}
