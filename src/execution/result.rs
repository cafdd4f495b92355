//! Command result type.

use serde::Serialize;

/// Immutable outcome of one remote command.
///
/// An absent exit code means the outcome is unknown: the wait timed out, was
/// killed, or the connection broke. Such a result is neither a success nor a
/// failure, so branch on [`exit_code`](Self::exit_code) before judging it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl CommandResult {
    pub(crate) fn new(exit_code: Option<i32>, stdout: String, stderr: String) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
        }
    }

    /// Remote exit status, if the command was seen to finish.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    /// The command finished and its exit status is known.
    pub fn completed(&self) -> bool {
        self.exit_code.is_some()
    }

    /// Check if command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Check if command finished with a non-zero exit code.
    pub fn failed(&self) -> bool {
        matches!(self.exit_code, Some(c) if c != 0)
    }

    /// Get stdout lines.
    pub fn stdout_lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines()
    }

    /// Get stderr lines.
    pub fn stderr_lines(&self) -> impl Iterator<Item = &str> {
        self.stderr.lines()
    }

    /// Split into `(exit_code, stdout, stderr)`.
    pub fn into_parts(self) -> (Option<i32>, String, String) {
        (self.exit_code, self.stdout, self.stderr)
    }
}
