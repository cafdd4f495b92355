//! In-memory transport for exercising runners without a network.
//!
//! Commands are either scripted with [`FakeTransport::script`] or handled by
//! a tiny built-in interpreter that understands `echo`, `sleep`, `exit`,
//! `true` and `false`. Anything else exits 127 with a "command not found"
//! message on stderr.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use super::{ExecStreams, RemoteSession, Transport, Tunnel};
use crate::error::RunnerError;
use crate::Result;

const FIRST_EPHEMERAL_PORT: u16 = 40000;

/// Scripted behaviour of one fake command.
#[derive(Debug, Clone, Default)]
pub struct FakeCommand {
    stdout: Vec<String>,
    stderr: Vec<String>,
    exit_code: i32,
    runtime: Duration,
    chunk_delay: Duration,
    disconnect: bool,
}

impl FakeCommand {
    /// A command that exits with `code` as soon as its output is written.
    pub fn exits(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    /// Append a chunk to stdout.
    pub fn stdout(mut self, chunk: impl Into<String>) -> Self {
        self.stdout.push(chunk.into());
        self
    }

    /// Append a chunk to stderr.
    pub fn stderr(mut self, chunk: impl Into<String>) -> Self {
        self.stderr.push(chunk.into());
        self
    }

    /// Minimum time between dispatch and exit.
    pub fn runtime(mut self, runtime: Duration) -> Self {
        self.runtime = runtime;
        self
    }

    /// Pause after each written chunk.
    pub fn chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Drop the connection instead of exiting: streams fail after the
    /// written output and no exit status is ever reported.
    pub fn disconnect(mut self) -> Self {
        self.disconnect = true;
        self
    }

    fn interpret(command: &str) -> Self {
        let command = command.trim();
        let (program, args) = command
            .split_once(char::is_whitespace)
            .map(|(p, a)| (p, a.trim()))
            .unwrap_or((command, ""));

        match program {
            "echo" => FakeCommand::exits(0).stdout(format!("{}\n", args)),
            "true" => FakeCommand::exits(0),
            "false" => FakeCommand::exits(1),
            "exit" => FakeCommand::exits(args.parse().unwrap_or(0)),
            "sleep" => match args.parse::<f64>() {
                Ok(secs) if secs >= 0.0 => {
                    FakeCommand::exits(0).runtime(Duration::from_secs_f64(secs))
                }
                _ => FakeCommand::exits(1).stderr("sleep: invalid time interval\n"),
            },
            _ => FakeCommand::exits(127).stderr(format!("sh: {}: command not found\n", program)),
        }
    }
}

#[derive(Default)]
struct Counters {
    open_sessions: AtomicUsize,
    open_tunnels: AtomicUsize,
    next_port: AtomicU16,
}

/// Scriptable [`Transport`] that runs commands in background threads.
pub struct FakeTransport {
    host: String,
    username: Option<String>,
    scripts: Mutex<HashMap<String, FakeCommand>>,
    executed: Arc<Mutex<Vec<String>>>,
    counters: Arc<Counters>,
    ack_delay: Duration,
    window: Option<usize>,
    refuse_sessions: AtomicBool,
    refuse_forwarding: bool,
    fail_tunnel_close: bool,
}

impl FakeTransport {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: None,
            scripts: Mutex::new(HashMap::new()),
            executed: Arc::new(Mutex::new(Vec::new())),
            counters: Arc::new(Counters {
                next_port: AtomicU16::new(FIRST_EPHEMERAL_PORT),
                ..Counters::default()
            }),
            ack_delay: Duration::ZERO,
            window: None,
            refuse_sessions: AtomicBool::new(false),
            refuse_forwarding: false,
            fail_tunnel_close: false,
        }
    }

    /// Report a login user.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.username = Some(user.into());
        self
    }

    /// Delay before the remote side acknowledges a dispatched command.
    pub fn with_ack_delay(mut self, delay: Duration) -> Self {
        self.ack_delay = delay;
        self
    }

    /// Bound each stream's unread bytes. A command writing past the bound
    /// stalls until its output is read, and cannot exit before that.
    pub fn with_window(mut self, bytes: usize) -> Self {
        self.window = Some(bytes.max(1));
        self
    }

    /// Make every `forward_local` call fail.
    pub fn refusing_forwarding(mut self) -> Self {
        self.refuse_forwarding = true;
        self
    }

    /// Make every tunnel close report an error.
    pub fn failing_tunnel_close(mut self) -> Self {
        self.fail_tunnel_close = true;
        self
    }

    /// Simulate a dropped connection: new sessions cannot be opened.
    pub fn set_refuse_sessions(&self, refuse: bool) {
        self.refuse_sessions.store(refuse, Ordering::Release);
    }

    /// Use `behaviour` whenever exactly `command` is executed.
    pub fn script(&self, command: impl Into<String>, behaviour: FakeCommand) {
        lock(&self.scripts).insert(command.into(), behaviour);
    }

    /// Sessions opened and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.counters.open_sessions.load(Ordering::Acquire)
    }

    /// Tunnels opened and not yet closed.
    pub fn open_tunnels(&self) -> usize {
        self.counters.open_tunnels.load(Ordering::Acquire)
    }

    /// Every command dispatched so far, in order.
    pub fn executed(&self) -> Vec<String> {
        lock(&self.executed).clone()
    }
}

impl Transport for FakeTransport {
    fn remote_host(&self) -> &str {
        &self.host
    }

    fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    fn open_session(&self) -> Result<Box<dyn RemoteSession>> {
        if self.refuse_sessions.load(Ordering::Acquire) {
            return Err(RunnerError::transport("connection dropped"));
        }
        self.counters.open_sessions.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(FakeSession {
            scripts: lock(&self.scripts).clone(),
            executed: Arc::clone(&self.executed),
            counters: Arc::clone(&self.counters),
            ack_delay: self.ack_delay,
            window: self.window,
            process: Arc::new(Process::default()),
            pipes: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    fn forward_local(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Box<dyn Tunnel>> {
        if self.refuse_forwarding {
            return Err(RunnerError::transport(format!(
                "forwarding to {}:{} refused",
                remote_host, remote_port
            )));
        }
        let port = if local_port == 0 {
            self.counters.next_port.fetch_add(1, Ordering::AcqRel)
        } else {
            local_port
        };
        self.counters.open_tunnels.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(FakeTunnel {
            local_port: port,
            counters: Arc::clone(&self.counters),
            fail_close: self.fail_tunnel_close,
            open: true,
        }))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct ProcessState {
    exit: Option<i32>,
    finished: bool,
    aborted: bool,
    broken: bool,
}

#[derive(Default)]
struct Process {
    state: Mutex<ProcessState>,
    changed: Condvar,
}

impl Process {
    fn update(&self, f: impl FnOnce(&mut ProcessState)) {
        f(&mut lock(&self.state));
        self.changed.notify_all();
    }

    fn aborted(&self) -> bool {
        lock(&self.state).aborted
    }
}

struct FakeSession {
    scripts: HashMap<String, FakeCommand>,
    executed: Arc<Mutex<Vec<String>>>,
    counters: Arc<Counters>,
    ack_delay: Duration,
    window: Option<usize>,
    process: Arc<Process>,
    pipes: Mutex<Option<(Arc<Pipe>, Arc<Pipe>)>>,
    closed: AtomicBool,
}

impl RemoteSession for FakeSession {
    fn exec(&self, command: &str, ack_timeout: Option<Duration>) -> Result<ExecStreams> {
        match ack_timeout {
            Some(limit) if self.ack_delay > limit => {
                thread::sleep(limit);
                return Err(RunnerError::transport(format!(
                    "command dispatch not acknowledged within {:?}",
                    limit
                )));
            }
            _ => thread::sleep(self.ack_delay),
        }

        lock(&self.executed).push(command.to_string());
        let behaviour = self
            .scripts
            .get(command)
            .cloned()
            .unwrap_or_else(|| FakeCommand::interpret(command));

        let stdout = Arc::new(Pipe::with_window(self.window));
        let stderr = Arc::new(Pipe::with_window(self.window));
        *lock(&self.pipes) = Some((Arc::clone(&stdout), Arc::clone(&stderr)));

        let process = Arc::clone(&self.process);
        let (out, err) = (Arc::clone(&stdout), Arc::clone(&stderr));
        thread::Builder::new()
            .name("fake-process".into())
            .spawn(move || run_process(behaviour, process, out, err))?;

        Ok(ExecStreams {
            stdout: Box::new(PipeReader(stdout)),
            stderr: Box::new(PipeReader(stderr)),
        })
    }

    fn join(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let state = lock(&self.process.state);
        let waiting = |s: &mut ProcessState| !(s.finished || s.aborted || s.broken);
        let state = match timeout {
            Some(limit) => {
                self.process
                    .changed
                    .wait_timeout_while(state, limit, waiting)
                    .unwrap_or_else(|e| e.into_inner())
                    .0
            }
            None => self
                .process
                .changed
                .wait_while(state, waiting)
                .unwrap_or_else(|e| e.into_inner()),
        };

        if state.aborted {
            Err(io::Error::new(io::ErrorKind::ConnectionAborted, "channel closed"))
        } else if state.broken {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection dropped"))
        } else {
            Ok(state.finished)
        }
    }

    fn exit_status(&self) -> Option<i32> {
        lock(&self.process.state).exit
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.process.update(|s| s.aborted = !s.finished);
        if let Some((out, err)) = lock(&self.pipes).as_ref() {
            out.finish(false);
            err.finish(false);
        }
        self.counters.open_sessions.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    fn abort(&self) -> io::Result<()> {
        // An exited fake process has already closed its pipes, so closing
        // covers both cases.
        self.close()
    }
}

fn run_process(cmd: FakeCommand, process: Arc<Process>, stdout: Arc<Pipe>, stderr: Arc<Pipe>) {
    let started = Instant::now();
    let longest = cmd.stdout.len().max(cmd.stderr.len());

    for i in 0..longest {
        if process.aborted() {
            return;
        }
        if let Some(chunk) = cmd.stdout.get(i) {
            stdout.write(chunk.as_bytes());
        }
        if let Some(chunk) = cmd.stderr.get(i) {
            stderr.write(chunk.as_bytes());
        }
        if !cmd.chunk_delay.is_zero() {
            thread::sleep(cmd.chunk_delay);
        }
    }

    let remaining = cmd.runtime.saturating_sub(started.elapsed());
    let state = lock(&process.state);
    let state = process
        .changed
        .wait_timeout_while(state, remaining, |s| !s.aborted)
        .unwrap_or_else(|e| e.into_inner())
        .0;
    if state.aborted {
        return;
    }
    drop(state);

    if cmd.disconnect {
        stdout.finish(true);
        stderr.finish(true);
        process.update(|s| s.broken = true);
    } else {
        stdout.finish(false);
        stderr.finish(false);
        process.update(|s| {
            s.exit = Some(cmd.exit_code);
            s.finished = true;
        });
    }
}

#[derive(Default)]
struct PipeState {
    buf: VecDeque<u8>,
    closed: bool,
    broken: bool,
}

/// Single-producer byte pipe with blocking reads and, optionally, blocking
/// writes once `window` bytes are unread.
#[derive(Default)]
struct Pipe {
    state: Mutex<PipeState>,
    window: Option<usize>,
    /// Signalled whenever data arrives, is consumed, or the pipe closes.
    changed: Condvar,
}

impl Pipe {
    fn with_window(window: Option<usize>) -> Self {
        Self {
            window,
            ..Self::default()
        }
    }

    fn write(&self, mut data: &[u8]) {
        let mut state = lock(&self.state);
        while !data.is_empty() {
            if let Some(window) = self.window {
                state = self
                    .changed
                    .wait_while(state, |s| s.buf.len() >= window && !s.closed)
                    .unwrap_or_else(|e| e.into_inner());
            }
            if state.closed {
                break;
            }
            let room = self
                .window
                .map_or(data.len(), |w| w.saturating_sub(state.buf.len()));
            let n = room.min(data.len());
            state.buf.extend(&data[..n]);
            data = &data[n..];
            self.changed.notify_all();
        }
    }

    fn finish(&self, broken: bool) {
        let mut state = lock(&self.state);
        if !state.closed {
            state.closed = true;
            state.broken = broken;
        }
        self.changed.notify_all();
    }
}

struct PipeReader(Arc<Pipe>);

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let state = lock(&self.0.state);
        let mut state = self
            .0
            .changed
            .wait_while(state, |s| s.buf.is_empty() && !s.closed)
            .unwrap_or_else(|e| e.into_inner());

        if !state.buf.is_empty() {
            let n = buf.len().min(state.buf.len());
            for (slot, byte) in buf.iter_mut().zip(state.buf.drain(..n)) {
                *slot = byte;
            }
            self.0.changed.notify_all();
            return Ok(n);
        }
        if state.broken {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection dropped",
            ));
        }
        Ok(0)
    }
}

struct FakeTunnel {
    local_port: u16,
    counters: Arc<Counters>,
    fail_close: bool,
    open: bool,
}

impl Tunnel for FakeTunnel {
    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn close(&mut self) -> io::Result<()> {
        if self.open {
            self.open = false;
            self.counters.open_tunnels.fetch_sub(1, Ordering::AcqRel);
        }
        if self.fail_close {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "tunnel already torn down"));
        }
        Ok(())
    }
}
