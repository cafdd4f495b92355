//! Transport abstraction layer.
//!
//! The runner never talks to a network library directly. It borrows a
//! [`Transport`] (one authenticated connection, shared by any number of
//! runners), opens a [`RemoteSession`] per command and reads the streams the
//! session hands back.

pub mod fake;
mod ssh;

pub use ssh::{AuthMethod, SshConfig, SshTransport};

use std::io::Read;
use std::time::Duration;

use crate::Result;

/// Boxed blocking byte stream produced by a remote command.
pub type OutputStream = Box<dyn Read + Send>;

/// An established, authenticated connection to one remote host.
pub trait Transport: Send + Sync {
    /// Hostname as the remote side reported it (or as it was dialed).
    fn remote_host(&self) -> &str;

    /// Login user, if known.
    fn username(&self) -> Option<&str>;

    /// Open a fresh session for a single command.
    fn open_session(&self) -> Result<Box<dyn RemoteSession>>;

    /// Listen on `local_port` (0 = any free port) and forward every
    /// connection to `remote_host:remote_port` through this connection.
    fn forward_local(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Box<dyn Tunnel>>;
}

/// Raw stdout/stderr of a dispatched command. Each stream is single-pass.
pub struct ExecStreams {
    pub stdout: OutputStream,
    pub stderr: OutputStream,
}

/// One remote process and its channel.
///
/// Everything except `exec` may be called from any thread while another
/// thread is blocked reading the streams.
pub trait RemoteSession: Send + Sync {
    /// Dispatch `command`. Returns once the remote side has acknowledged the
    /// request, or fails if that takes longer than `ack_timeout`.
    fn exec(&self, command: &str, ack_timeout: Option<Duration>) -> Result<ExecStreams>;

    /// Block until the process exits or `timeout` elapses.
    ///
    /// `Ok(true)` means the process exited; `Ok(false)` means the timeout
    /// elapsed first. An error means the channel broke and the outcome is unknown.
    fn join(&self, timeout: Option<Duration>) -> std::io::Result<bool>;

    /// Exit status reported by the remote side, once known.
    fn exit_status(&self) -> Option<i32>;

    /// Close the channel after the process exited. Output already received
    /// stays readable from the streams.
    fn close(&self) -> std::io::Result<()>;

    /// Close the channel without waiting for the process. Readers blocked on
    /// the streams observe end-of-stream and a blocked `join` returns an error.
    fn abort(&self) -> std::io::Result<()>;
}

/// A live local-to-remote forwarding tunnel.
pub trait Tunnel: Send {
    /// Local port actually bound.
    fn local_port(&self) -> u16;

    /// Stop listening and tear down forwarded connections.
    fn close(&mut self) -> std::io::Result<()>;
}
