//! SSH transport built on libssh2.
//!
//! Handshake and authentication run in blocking mode. After that the
//! session is switched to non-blocking mode for good, so that a thread
//! parked on one channel never holds the session lock other threads need;
//! every libssh2 call below is therefore wrapped in a poll loop.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ssh2::{Channel, CheckResult, ErrorCode, KnownHostFileKind, Session};
use tracing::{debug, info, trace, warn};

use super::{ExecStreams, RemoteSession, Transport, Tunnel};
use crate::error::RunnerError;
use crate::Result;

/// libssh2's "would block" return code.
const EAGAIN: i32 = -37;

/// Back-off between non-blocking retries.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound for best-effort channel close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound for opening a command channel.
const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for opening a forwarded channel.
const FORWARD_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

const FORWARD_BUFFER_SIZE: usize = 16 * 1024;

/// SSH authentication method.
#[derive(Clone)]
pub enum AuthMethod {
    /// Password authentication.
    Password(String),
    /// Private key authentication.
    Key {
        /// Private key path (`~` is expanded).
        key_path: PathBuf,
        /// Key passphrase, if the key is encrypted.
        passphrase: Option<String>,
        /// Password tried when the key is rejected.
        password_fallback: Option<String>,
    },
    /// Keys held by a running ssh-agent.
    Agent,
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password(_) => f.write_str("Password(<redacted>)"),
            AuthMethod::Key {
                key_path,
                passphrase,
                password_fallback,
            } => f
                .debug_struct("Key")
                .field("key_path", key_path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .field(
                    "password_fallback",
                    &password_fallback.as_ref().map(|_| "<redacted>"),
                )
                .finish(),
            AuthMethod::Agent => f.write_str("Agent"),
        }
    }
}

/// Connection settings for [`SshTransport::connect`].
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Host name or address.
    pub host: String,
    /// Port (default 22).
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Authentication method.
    pub auth: AuthMethod,
    /// TCP connect and handshake timeout.
    pub connect_timeout: Duration,
    /// known_hosts file; `~/.ssh/known_hosts` when unset.
    pub known_hosts: Option<PathBuf>,
    /// Reject hosts whose key is missing from or differs in known_hosts.
    pub strict_host_key_checking: bool,
}

impl SshConfig {
    fn new(host: impl Into<String>, username: impl Into<String>, auth: AuthMethod) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            auth,
            connect_timeout: Duration::from_secs(30),
            known_hosts: None,
            strict_host_key_checking: true,
        }
    }

    /// Password authentication.
    pub fn with_password(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::new(host, username, AuthMethod::Password(password.into()))
    }

    /// Private key authentication.
    pub fn with_key(
        host: impl Into<String>,
        username: impl Into<String>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self::new(
            host,
            username,
            AuthMethod::Key {
                key_path: key_path.into(),
                passphrase: None,
                password_fallback: None,
            },
        )
    }

    /// ssh-agent authentication.
    pub fn with_agent(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self::new(host, username, AuthMethod::Agent)
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Use a specific known_hosts file.
    pub fn known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts = Some(path.into());
        self
    }

    /// Skip host key verification.
    pub fn insecure(mut self) -> Self {
        self.strict_host_key_checking = false;
        self
    }

    /// `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// An authenticated SSH connection.
///
/// Cheap to share behind an `Arc`; every runner opens its own channel on it.
pub struct SshTransport {
    session: Session,
    host: String,
    username: String,
}

impl SshTransport {
    /// Connect, verify the host key and authenticate.
    ///
    /// Authentication failure is terminal and never retried.
    pub fn connect(config: &SshConfig) -> Result<Self> {
        let address = config.address();
        info!("connecting to {}@{}", config.username, address);

        let socket_addr = address
            .to_socket_addrs()
            .map_err(|e| RunnerError::transport(format!("cannot resolve {}: {}", address, e)))?
            .next()
            .ok_or_else(|| RunnerError::transport(format!("no address for {}", address)))?;
        let tcp = TcpStream::connect_timeout(&socket_addr, config.connect_timeout)
            .map_err(|e| RunnerError::transport(format!("cannot connect to {}: {}", address, e)))?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(config.connect_timeout.as_millis().min(u32::MAX as u128) as u32);
        session.handshake()?;

        if config.strict_host_key_checking {
            verify_host_key(&session, config)?;
        } else {
            debug!("host key checking disabled for {}", address);
        }

        authenticate(&session, config)?;

        session.set_timeout(0);
        session.set_blocking(false);
        info!("connected to {}@{}", config.username, address);

        Ok(Self {
            session,
            host: config.host.clone(),
            username: config.username.clone(),
        })
    }
}

impl Transport for SshTransport {
    fn remote_host(&self) -> &str {
        &self.host
    }

    fn username(&self) -> Option<&str> {
        Some(&self.username)
    }

    fn open_session(&self) -> Result<Box<dyn RemoteSession>> {
        let deadline = Some(Instant::now() + CHANNEL_OPEN_TIMEOUT);
        let channel = poll(deadline, || self.session.channel_session())?
            .ok_or_else(|| RunnerError::transport("timed out opening session channel"))?;
        Ok(Box::new(SshSession {
            channel: Mutex::new(channel),
            closed: Arc::new(AtomicBool::new(false)),
            exit_status: Mutex::new(None),
        }))
    }

    fn forward_local(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Box<dyn Tunnel>> {
        let listener = TcpListener::bind(("127.0.0.1", local_port)).map_err(|e| {
            RunnerError::transport(format!("cannot listen on local port {}: {}", local_port, e))
        })?;
        let bound = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;

        let stop = Arc::new(AtomicBool::new(false));
        let target = ForwardTarget {
            session: self.session.clone(),
            host: remote_host.to_string(),
            port: remote_port,
            stop: Arc::clone(&stop),
        };
        let acceptor = thread::Builder::new()
            .name(format!("forward-{}", bound))
            .spawn(move || accept_loop(listener, target))?;

        info!(
            "forwarding 127.0.0.1:{} -> {}:{}",
            bound, remote_host, remote_port
        );
        Ok(Box::new(LocalForwarder {
            local_port: bound,
            stop,
            acceptor: Some(acceptor),
        }))
    }
}

fn verify_host_key(session: &Session, config: &SshConfig) -> Result<()> {
    let (key, _) = session
        .host_key()
        .ok_or_else(|| RunnerError::transport("server sent no host key"))?;

    let path = config
        .known_hosts
        .clone()
        .or_else(|| dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts")))
        .ok_or_else(|| RunnerError::transport("cannot locate known_hosts file"))?;

    let mut known = session.known_hosts()?;
    known.read_file(&path, KnownHostFileKind::OpenSSH)?;

    match known.check_port(&config.host, config.port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::NotFound => Err(RunnerError::transport(format!(
            "host key for {} not found in {}",
            config.host,
            path.display()
        ))),
        CheckResult::Mismatch => Err(RunnerError::transport(format!(
            "host key for {} does not match {}",
            config.host,
            path.display()
        ))),
        CheckResult::Failure => Err(RunnerError::transport(format!(
            "host key check failed for {}",
            config.host
        ))),
    }
}

fn authenticate(session: &Session, config: &SshConfig) -> Result<()> {
    let user = config.username.as_str();
    let outcome = match &config.auth {
        AuthMethod::Password(password) => session.userauth_password(user, password),
        AuthMethod::Key {
            key_path,
            passphrase,
            password_fallback,
        } => {
            let key_path = expand_path(key_path);
            let by_key = session.userauth_pubkey_file(user, None, &key_path, passphrase.as_deref());
            match (by_key, password_fallback) {
                (Err(e), Some(password)) if !session.authenticated() => {
                    debug!("key {} rejected ({}), trying password", key_path.display(), e);
                    session.userauth_password(user, password)
                }
                (outcome, _) => outcome,
            }
        }
        AuthMethod::Agent => session.userauth_agent(user),
    };

    if session.authenticated() {
        return Ok(());
    }
    let reason = match outcome {
        Err(e) => e.to_string(),
        Ok(()) => "server did not accept the credentials".to_string(),
    };
    Err(RunnerError::Authentication {
        user: user.to_string(),
        host: config.host.clone(),
        reason,
    })
}

/// Expand a leading `~` to the home directory.
fn expand_path(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    if let Some(rest) = text.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest.trim_start_matches('/'));
        }
    }
    path.to_path_buf()
}

fn would_block(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::Session(EAGAIN))
}

/// Repeat a non-blocking libssh2 call until it completes.
///
/// `Ok(None)` means `deadline` passed while the call kept returning EAGAIN.
fn poll<T>(
    deadline: Option<Instant>,
    mut op: impl FnMut() -> std::result::Result<T, ssh2::Error>,
) -> std::result::Result<Option<T>, ssh2::Error> {
    loop {
        match op() {
            Ok(value) => return Ok(Some(value)),
            Err(e) if would_block(&e) => {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Ok(None);
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(e),
        }
    }
}

struct SshSession {
    channel: Mutex<Channel>,
    closed: Arc<AtomicBool>,
    exit_status: Mutex<Option<i32>>,
}

impl SshSession {
    fn channel(&self) -> io::Result<std::sync::MutexGuard<'_, Channel>> {
        self.channel
            .lock()
            .map_err(|_| io::Error::other("channel lock poisoned"))
    }
}

impl RemoteSession for SshSession {
    fn exec(&self, command: &str, ack_timeout: Option<Duration>) -> Result<ExecStreams> {
        let mut channel = self.channel().map_err(RunnerError::Io)?;
        let deadline = ack_timeout.map(|t| Instant::now() + t);

        poll(deadline, || channel.exec(command))?.ok_or_else(|| {
            RunnerError::transport(format!(
                "command dispatch not acknowledged within {:?}",
                ack_timeout.unwrap_or_default()
            ))
        })?;

        Ok(ExecStreams {
            stdout: Box::new(PollingReader {
                stream: channel.stream(0),
                closed: Arc::clone(&self.closed),
            }),
            stderr: Box::new(PollingReader {
                stream: channel.stderr(),
                closed: Arc::clone(&self.closed),
            }),
        })
    }

    fn join(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "channel closed while waiting",
                ));
            }

            let step = {
                let mut channel = self.channel()?;
                match channel.wait_eof().and_then(|_| channel.wait_close()) {
                    Ok(()) => {
                        let signal = channel.exit_signal().ok().and_then(|s| s.exit_signal);
                        Ok(Some(resolve_exit(
                            channel.exit_status().ok(),
                            signal.as_deref(),
                        )))
                    }
                    Err(e) if would_block(&e) => Ok(None),
                    Err(e) => Err(io::Error::other(e)),
                }
            };

            match step? {
                Some(status) => {
                    trace!("remote process exited with {:?}", status);
                    if let Ok(mut slot) = self.exit_status.lock() {
                        *slot = status;
                    }
                    return Ok(true);
                }
                None if deadline.is_some_and(|d| Instant::now() >= d) => return Ok(false),
                None => thread::sleep(POLL_INTERVAL),
            }
        }
    }

    fn exit_status(&self) -> Option<i32> {
        self.exit_status.lock().ok().and_then(|slot| *slot)
    }

    fn close(&self) -> io::Result<()> {
        let mut channel = self.channel()?;
        let deadline = Some(Instant::now() + CLOSE_TIMEOUT);
        poll(deadline, || channel.close()).map_err(io::Error::other)?;
        Ok(())
    }

    fn abort(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        self.close()
    }
}

/// Blocking reader over a non-blocking channel stream.
struct PollingReader {
    stream: ssh2::Stream,
    closed: Arc<AtomicBool>,
}

impl Read for PollingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(0);
            }
            match self.stream.read(buf) {
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(POLL_INTERVAL);
                }
                other => return other,
            }
        }
    }
}

struct ForwardTarget {
    session: Session,
    host: String,
    port: u16,
    stop: Arc<AtomicBool>,
}

struct LocalForwarder {
    local_port: u16,
    stop: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl Tunnel for LocalForwarder {
    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn close(&mut self) -> io::Result<()> {
        self.stop.store(true, Ordering::Release);
        match self.acceptor.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| io::Error::other("forwarding thread panicked")),
            None => Ok(()),
        }
    }
}

impl Drop for LocalForwarder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

fn accept_loop(listener: TcpListener, target: ForwardTarget) {
    let target = Arc::new(target);
    while !target.stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((socket, peer)) => {
                debug!("forward: accepted {}", peer);
                let target = Arc::clone(&target);
                let spawned = thread::Builder::new()
                    .name(format!("forward-conn-{}", peer.port()))
                    .spawn(move || {
                        if let Err(e) = pump(socket, &target) {
                            debug!("forward: connection from {} ended: {}", peer, e);
                        }
                    });
                if let Err(e) = spawned {
                    warn!("forward: cannot spawn connection thread: {}", e);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                warn!("forward: accept failed: {}", e);
                break;
            }
        }
    }
    debug!("forward: listener stopped");
}

/// Copy bytes both ways between a local socket and a direct-tcpip channel.
fn pump(mut socket: TcpStream, target: &ForwardTarget) -> io::Result<()> {
    let deadline = Some(Instant::now() + FORWARD_OPEN_TIMEOUT);
    let mut channel = poll(deadline, || {
        target
            .session
            .channel_direct_tcpip(&target.host, target.port, None)
    })
    .map_err(io::Error::other)?
    .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "direct-tcpip open timed out"))?;

    socket.set_read_timeout(Some(POLL_INTERVAL))?;
    let mut buf = vec![0u8; FORWARD_BUFFER_SIZE];

    let result = loop {
        if target.stop.load(Ordering::Acquire) {
            break Ok(());
        }
        let mut idle = true;

        match socket.read(&mut buf) {
            Ok(0) => break Ok(()),
            Ok(n) => {
                idle = false;
                if let Err(e) = write_channel(&mut channel, &buf[..n], &target.stop) {
                    break Err(e);
                }
            }
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) => {}
            Err(e) => break Err(e),
        }

        match channel.read(&mut buf) {
            Ok(0) if channel.eof() => break Ok(()),
            Ok(0) => {}
            Ok(n) => {
                idle = false;
                if let Err(e) = socket.write_all(&buf[..n]) {
                    break Err(e);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => break Err(e),
        }

        if idle {
            thread::yield_now();
        }
    };

    let close_deadline = Some(Instant::now() + CLOSE_TIMEOUT);
    if let Err(e) = poll(close_deadline, || channel.close()) {
        debug!("forward: channel close failed: {}", e);
    }
    result
}

fn write_channel(channel: &mut Channel, mut data: &[u8], stop: &AtomicBool) -> io::Result<()> {
    while !data.is_empty() {
        if stop.load(Ordering::Acquire) {
            return Ok(());
        }
        match channel.write(data) {
            Ok(n) => data = &data[n..],
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Exit code of a finished channel. A process killed by a signal has no
/// exit code; libssh2 reports 0 for it, so the signal wins.
fn resolve_exit(status: Option<i32>, signal: Option<&str>) -> Option<i32> {
    match signal {
        Some(name) => {
            debug!("remote process killed by SIG{}", name);
            None
        }
        None => status,
    }
}
