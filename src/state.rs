//! Lifecycle state machine shared by connections and receivers.

use std::fmt;

use parking_lot::Mutex;

use crate::error::{MessagingError, Result};

/// Lifecycle phase of a stateful component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Constructed but not yet initialized.
    Created,
    /// Initialized and usable.
    Ready,
    /// Shut down; terminal except through [`ProcessorState::clear`].
    Closed,
    /// Faulted; the cause is retained until cleared.
    Error,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Created => "created",
            Phase::Ready => "ready",
            Phase::Closed => "closed",
            Phase::Error => "error",
        };
        f.write_str(label)
    }
}

struct Inner {
    phase: Phase,
    error: Option<String>,
}

/// Thread-safe lifecycle guard.
///
/// Components call [`ProcessorState::check`] as a cheap precondition before
/// every operation, [`ProcessorState::error`] when entering the fault state,
/// and [`ProcessorState::clear`] to reset after operator intervention.
pub struct ProcessorState {
    inner: Mutex<Inner>,
}

impl ProcessorState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                phase: Phase::Created,
                error: None,
            }),
        }
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock().phase
    }

    /// Last fault, present only while in [`Phase::Error`].
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().error.clone()
    }

    /// Move to a non-error phase without touching the recorded fault rules:
    /// transitioning out of `Error` requires [`ProcessorState::clear`].
    pub fn transition(&self, phase: Phase) {
        let mut inner = self.inner.lock();
        if inner.phase != Phase::Error {
            inner.phase = phase;
        }
    }

    /// Raise if the current phase differs from `expected`.
    pub fn check(&self, expected: Phase) -> Result<()> {
        let inner = self.inner.lock();
        if inner.phase == expected {
            Ok(())
        } else {
            Err(MessagingError::InvalidState {
                expected: expected.to_string(),
                found: inner.phase.to_string(),
            })
        }
    }

    /// Atomically enter the error phase and record the cause.
    pub fn error(&self, cause: impl ToString) {
        let mut inner = self.inner.lock();
        inner.phase = Phase::Error;
        inner.error = Some(cause.to_string());
    }

    /// Reset to the init phase and drop any recorded fault.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.phase = Phase::Created;
        inner.error = None;
    }
}

impl Default for ProcessorState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ProcessorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ProcessorState")
            .field("phase", &inner.phase)
            .field("error", &inner.error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_guards_phase() {
        let state = ProcessorState::new();
        assert!(state.check(Phase::Created).is_ok());
        assert!(matches!(
            state.check(Phase::Ready),
            Err(MessagingError::InvalidState { .. })
        ));

        state.transition(Phase::Ready);
        assert!(state.check(Phase::Ready).is_ok());
    }

    #[test]
    fn test_error_sets_phase_and_cause() {
        let state = ProcessorState::new();
        state.error("broker unreachable");
        assert_eq!(state.phase(), Phase::Error);
        assert_eq!(state.last_error().as_deref(), Some("broker unreachable"));

        // transition() must not silently leave the error phase
        state.transition(Phase::Ready);
        assert_eq!(state.phase(), Phase::Error);

        state.clear();
        assert_eq!(state.phase(), Phase::Created);
        assert!(state.last_error().is_none());
    }
}
