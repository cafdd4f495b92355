//! Options for a single `run_and_wait` call.

use std::time::Duration;

use crate::logging::{LogContext, Severity};

/// How to run, wait for and report one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Maximum time to wait for the process to exit. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Log output line by line while the command runs.
    pub live_log: bool,
    /// Read and log output at all. When off, the result carries only the
    /// exit code and both streams are left unread.
    pub capture_output: bool,
    /// Severity and tag for the command line, its output and exit code.
    pub log: LogContext,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the wait timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Wait for the process however long it takes.
    pub fn unbounded(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Set whether to log output as it arrives.
    pub fn live_log(mut self, live: bool) -> Self {
        self.live_log = live;
        self
    }

    /// Set whether to capture output.
    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.log.severity = severity;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.log.tag = tag.into();
        self
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            live_log: false,
            capture_output: true,
            log: LogContext::default(),
        }
    }
}
