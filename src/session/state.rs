//! Command lifecycle state machine.

use serde::Serialize;

/// Lifecycle state of the command owned by a [`CommandRunner`](crate::CommandRunner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No command running; a command may or may not be set.
    #[default]
    Idle,
    /// Session opened and command dispatched; raw streams are available.
    Started,
    /// A thread is waiting for the remote process to exit.
    AwaitingExit,
    /// Exit code (or its absence) is known and the session is closed.
    Finalized,
}

impl SessionState {
    /// Check if transition to target state is valid.
    ///
    /// Valid transitions:
    /// - Idle -> Idle (new command)
    /// - Idle -> Started
    /// - Started -> AwaitingExit
    /// - Started -> Finalized
    /// - AwaitingExit -> Finalized
    /// - Finalized -> Idle
    ///
    /// `reset` bypasses this table and may return to `Idle` from anywhere.
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (*self, target),
            (Idle, Idle)
                | (Idle, Started)
                | (Started, AwaitingExit)
                | (Started, Finalized)
                | (AwaitingExit, Finalized)
                | (Finalized, Idle)
        )
    }

    /// Attempt to transition to a new state.
    ///
    /// Returns `Ok(())` if the transition is valid; otherwise the state is
    /// left unchanged and an error naming `operation` is returned.
    pub fn transition_to(
        &mut self,
        target: SessionState,
        operation: &'static str,
    ) -> crate::Result<()> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(crate::error::RunnerError::InvalidState {
                operation,
                state: *self,
            })
        }
    }

    /// A command has been dispatched and has not been finalized yet.
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Started | SessionState::AwaitingExit)
    }

    /// Output streams (raw or cached) may be read.
    pub fn has_output(&self) -> bool {
        !matches!(self, SessionState::Idle)
    }
}
