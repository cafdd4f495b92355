//! Output stream handling.
//!
//! This module provides:
//! - Drain-once capture of a command's raw streams
//! - Live, line-by-line logging of both streams while the command runs

mod capture;
mod live;

pub use capture::{read_lines, StreamCapture};
pub use live::LiveStreamLogger;

use std::fmt;

use serde::Serialize;

/// Which output stream a piece of text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputSource {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl OutputSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputSource::Stdout => "stdout",
            OutputSource::Stderr => "stderr",
        }
    }
}

impl fmt::Display for OutputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
