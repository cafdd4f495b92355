//! Command execution engine.
//!
//! This module provides:
//! - A stateful, reusable [`CommandRunner`] bound to one transport
//! - Bounded waits that finalize the session on any outcome
//! - Blocking and async run-and-wait convenience calls
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use ssh_runner::execution::{CommandRunner, RunOptions};
//! use ssh_runner::transport::{SshConfig, SshTransport};
//!
//! # fn main() -> ssh_runner::Result<()> {
//! let transport = SshTransport::connect(&SshConfig::with_agent("build-box", "ci"))?;
//! let runner = CommandRunner::new(Arc::new(transport));
//!
//! let result = runner.run_and_wait(
//!     "uname -a",
//!     &RunOptions::new().timeout(Duration::from_secs(30)),
//! )?;
//! println!("{:?}: {}", result.exit_code(), result.stdout());
//! # Ok(())
//! # }
//! ```

mod options;
mod result;
mod runner;

pub use options::RunOptions;
pub use result::CommandResult;
pub use runner::{CommandRunner, DEFAULT_EMERGENCY_TIMEOUT};
