//! Local port forwarding handles.

use std::fmt;
use std::io;
use std::net::TcpListener;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::RunnerError;
use crate::transport::{Transport, Tunnel};
use crate::Result;

/// A local listening port forwarded to `remote_host:remote_port`.
///
/// Owns the tunnel and closes it at most once, either through
/// [`close`](Self::close) or on drop. Close never fails from the caller's
/// point of view; problems are logged.
pub struct PortForward {
    local_port: u16,
    remote_host: String,
    remote_port: u16,
    tunnel: Mutex<Option<Box<dyn Tunnel>>>,
}

impl PortForward {
    /// Ask `transport` to forward `local_port` (0 picks a free port) to
    /// `remote_host:remote_port`.
    pub fn open(
        transport: &dyn Transport,
        remote_host: &str,
        remote_port: u16,
        local_port: u16,
    ) -> Result<Self> {
        let tunnel = transport
            .forward_local(local_port, remote_host, remote_port)
            .map_err(|e| match e {
                RunnerError::Io(err) => RunnerError::transport(format!(
                    "forwarding to {}:{} failed: {}",
                    remote_host, remote_port, err
                )),
                other => other,
            })?;

        let forward = Self {
            local_port: tunnel.local_port(),
            remote_host: remote_host.to_string(),
            remote_port,
            tunnel: Mutex::new(Some(tunnel)),
        };
        debug!("opened {}", forward);
        Ok(forward)
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// The tunnel has not been closed yet.
    pub fn is_open(&self) -> bool {
        self.tunnel
            .lock()
            .map(|t| t.is_some())
            .unwrap_or_else(|e| e.into_inner().is_some())
    }

    /// Tear down the tunnel. Calling this again does nothing.
    pub fn close(&self) {
        let tunnel = self
            .tunnel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut tunnel) = tunnel {
            match tunnel.close() {
                Ok(()) => debug!("closed {}", self),
                Err(e) => warn!("failed to close {}: {}", self, e),
            }
        }
    }
}

impl fmt::Display for PortForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[ForwardedPort localPort={} host={} remotePort={}]",
            self.local_port, self.remote_host, self.remote_port
        )
    }
}

impl fmt::Debug for PortForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortForward")
            .field("local_port", &self.local_port)
            .field("remote_host", &self.remote_host)
            .field("remote_port", &self.remote_port)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        self.close();
    }
}

/// Ask the OS for a currently unused local TCP port.
///
/// The port is released before returning, so another process may take it.
pub fn free_local_port() -> io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::FakeTransport;

    #[test]
    fn test_open_auto_assigns_port() {
        let transport = FakeTransport::new("bastion");
        let forward = PortForward::open(&transport, "10.0.0.5", 22, 0).unwrap();

        assert_ne!(forward.local_port(), 0);
        assert_eq!(forward.remote_host(), "10.0.0.5");
        assert_eq!(forward.remote_port(), 22);
        assert!(forward.is_open());
        assert_eq!(transport.open_tunnels(), 1);
    }

    #[test]
    fn test_explicit_local_port() {
        let transport = FakeTransport::new("bastion");
        let forward = PortForward::open(&transport, "db", 5432, 15432).unwrap();
        assert_eq!(forward.local_port(), 15432);
    }

    #[test]
    fn test_close_twice() {
        let transport = FakeTransport::new("bastion");
        let forward = PortForward::open(&transport, "10.0.0.5", 22, 0).unwrap();

        forward.close();
        forward.close();
        assert!(!forward.is_open());
        assert_eq!(transport.open_tunnels(), 0);
    }

    #[test]
    fn test_close_failure_is_swallowed() {
        let transport = FakeTransport::new("bastion").failing_tunnel_close();
        let forward = PortForward::open(&transport, "10.0.0.5", 22, 0).unwrap();
        forward.close();
        assert!(!forward.is_open());
    }

    #[test]
    fn test_drop_closes_tunnel() {
        let transport = FakeTransport::new("bastion");
        {
            let _forward = PortForward::open(&transport, "10.0.0.5", 80, 0).unwrap();
            assert_eq!(transport.open_tunnels(), 1);
        }
        assert_eq!(transport.open_tunnels(), 0);
    }

    #[test]
    fn test_refused_forwarding_is_transport_error() {
        let transport = FakeTransport::new("bastion").refusing_forwarding();
        let result = PortForward::open(&transport, "10.0.0.5", 22, 0);
        assert!(matches!(result, Err(RunnerError::Transport(_))));
    }

    #[test]
    fn test_display() {
        let transport = FakeTransport::new("bastion");
        let forward = PortForward::open(&transport, "10.0.0.5", 22, 41000).unwrap();
        assert_eq!(
            forward.to_string(),
            "[ForwardedPort localPort=41000 host=10.0.0.5 remotePort=22]"
        );
    }

    #[test]
    fn test_free_local_port() {
        let port = free_local_port().unwrap();
        assert_ne!(port, 0);
        assert!(TcpListener::bind(("127.0.0.1", port)).is_ok());
    }
}
