//! # ssh-runner
//!
//! Remote command execution over SSH for test automation.
//!
//! A [`CommandRunner`] borrows one authenticated [`Transport`] and runs one
//! command at a time on it: dispatch, bounded wait, drain-once output
//! capture and cleanup. Waits never fail on a timeout; an unknown outcome is
//! an absent exit code.
//!
//! ## Features
//!
//! - **Bounded everything**: dispatch acknowledgement and process exit both
//!   have deadlines, and a timed-out command is closed, not leaked
//! - **Concurrent-safe**: start, wait, kill, reset and output reads can be
//!   called from different threads on a shared runner
//! - **Live logging**: stream stdout/stderr line by line while the command
//!   runs, then read the same text back as the result
//! - **Port forwarding**: local-to-remote tunnels with idempotent teardown
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use ssh_runner::{CommandRunner, RunOptions, SshConfig, SshTransport};
//!
//! fn main() -> ssh_runner::Result<()> {
//!     ssh_runner::logging::try_init().ok();
//!
//!     let transport = SshTransport::connect(&SshConfig::with_agent("build-01", "ci"))?;
//!     let runner = CommandRunner::new(Arc::new(transport));
//!
//!     let result = runner.run_and_wait(
//!         "make test",
//!         &RunOptions::new().timeout(Duration::from_secs(600)).live_log(true),
//!     )?;
//!
//!     match result.exit_code() {
//!         Some(0) => println!("passed"),
//!         Some(code) => println!("failed with {}", code),
//!         None => println!("did not finish in time"),
//!     }
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod execution;
pub mod forward;
pub mod logging;
pub mod output;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use error::{Result, RunnerError};
pub use execution::{CommandResult, CommandRunner, RunOptions, DEFAULT_EMERGENCY_TIMEOUT};
pub use forward::{free_local_port, PortForward};
pub use logging::{LogContext, Severity};
pub use output::{LiveStreamLogger, OutputSource, StreamCapture};
pub use session::SessionState;
pub use transport::{
    AuthMethod, ExecStreams, RemoteSession, SshConfig, SshTransport, Transport, Tunnel,
};
