//! Error types for ssh-runner.

use thiserror::Error;

use crate::session::SessionState;

/// Main error type for ssh-runner operations.
///
/// A command that does not finish in time is not an error: it shows up as an
/// absent exit code on [`CommandResult`](crate::CommandResult).
#[derive(Error, Debug)]
pub enum RunnerError {
    /// The transport could not open a session, dispatch a command or set up a tunnel.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote host rejected the supplied credentials.
    #[error("authentication failed for {user}@{host}: {reason}")]
    Authentication {
        user: String,
        host: String,
        reason: String,
    },

    /// Command text cannot be carried over the wire.
    #[error("command cannot be encoded: interior NUL byte at offset {position}")]
    Encoding { position: usize },

    /// Operation is not allowed in the current lifecycle state.
    #[error("cannot {operation} while runner is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// `start` was called before a command was set.
    #[error("no command set")]
    NoCommand,

    /// Output was requested before any command was started.
    #[error("no command has been started")]
    NotStarted,

    /// The raw streams were already drained or handed to another reader.
    #[error("output streams already consumed")]
    StreamsConsumed,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal lock was poisoned.
    #[error("internal lock poisoned")]
    LockPoisoned,

    /// A blocking task on the runtime could not be joined.
    #[error("runner task failed: {0}")]
    TaskFailed(String),
}

impl RunnerError {
    /// Shorthand for a transport failure.
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        RunnerError::Transport(msg.to_string())
    }
}

impl From<ssh2::Error> for RunnerError {
    fn from(err: ssh2::Error) -> Self {
        RunnerError::Transport(err.to_string())
    }
}

/// Convenience Result type for ssh-runner operations.
pub type Result<T> = std::result::Result<T, RunnerError>;
