//! Command execution engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::options::RunOptions;
use super::result::CommandResult;
use crate::error::RunnerError;
use crate::logging::LogContext;
use crate::output::{LiveStreamLogger, OutputSource, StreamCapture};
use crate::session::SessionState;
use crate::transport::{ExecStreams, RemoteSession, Transport};
use crate::Result;

/// Default bound on the dispatch handshake.
pub const DEFAULT_EMERGENCY_TIMEOUT: Duration = Duration::from_millis(1000);

/// Granularity at which a wait notices `kill`.
const WAIT_SLICE: Duration = Duration::from_millis(50);

enum WaitOutcome {
    Exited,
    TimedOut,
    Killed,
}

struct Control {
    state: SessionState,
    command: Option<String>,
    session: Option<Arc<dyn RemoteSession>>,
    exit_code: Option<i32>,
    /// Bumped on every start and reset so a late waiter can tell its
    /// session is gone.
    generation: u64,
}

/// Runs one command at a time on a shared transport.
///
/// Every operation takes `&self`: the thread that starts a command, the
/// thread that waits for it and a live logger can all hold the runner
/// through an `Arc`. The control block (state, session, exit code) and each
/// output stream are guarded separately so that a blocking drain of one
/// stream never holds up a waiter's timeout.
pub struct CommandRunner {
    transport: Arc<dyn Transport>,
    emergency_timeout: Option<Duration>,
    control: Mutex<Control>,
    stdout: Mutex<StreamCapture>,
    stderr: Mutex<StreamCapture>,
    kill: AtomicBool,
}

impl CommandRunner {
    /// Create a runner borrowing `transport`. The runner never closes it.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            emergency_timeout: Some(DEFAULT_EMERGENCY_TIMEOUT),
            control: Mutex::new(Control {
                state: SessionState::Idle,
                command: None,
                session: None,
                exit_code: None,
                generation: 0,
            }),
            stdout: Mutex::new(StreamCapture::empty()),
            stderr: Mutex::new(StreamCapture::empty()),
            kill: AtomicBool::new(false),
        }
    }

    /// Set the dispatch handshake bound. `None` lets `start` wait forever.
    pub fn with_emergency_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.emergency_timeout = timeout;
        self
    }

    pub fn set_emergency_timeout(&mut self, timeout: Option<Duration>) {
        self.emergency_timeout = timeout;
    }

    pub fn emergency_timeout(&self) -> Option<Duration> {
        self.emergency_timeout
    }

    /// The shared transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn control(&self) -> Result<MutexGuard<'_, Control>> {
        self.control.lock().map_err(|_| RunnerError::LockPoisoned)
    }

    fn capture(&self, source: OutputSource) -> Result<MutexGuard<'_, StreamCapture>> {
        let slot = match source {
            OutputSource::Stdout => &self.stdout,
            OutputSource::Stderr => &self.stderr,
        };
        slot.lock().map_err(|_| RunnerError::LockPoisoned)
    }

    fn try_capture(&self, source: OutputSource) -> Result<MutexGuard<'_, StreamCapture>> {
        let slot = match source {
            OutputSource::Stdout => &self.stdout,
            OutputSource::Stderr => &self.stderr,
        };
        slot.try_lock().map_err(|e| match e {
            TryLockError::WouldBlock => RunnerError::StreamsConsumed,
            TryLockError::Poisoned(_) => RunnerError::LockPoisoned,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.control
            .lock()
            .map(|c| c.state)
            .unwrap_or_else(|e| e.into_inner().state)
    }

    /// Command text currently set, if any.
    pub fn command(&self) -> Option<String> {
        self.control().ok().and_then(|c| c.command.clone())
    }

    /// Exit code of the last finalized command.
    pub fn exit_code(&self) -> Option<i32> {
        self.control().ok().and_then(|c| c.exit_code)
    }

    /// The last command finished and reported an exit code.
    pub fn is_done(&self) -> bool {
        self.control()
            .map(|c| c.state == SessionState::Finalized && c.exit_code.is_some())
            .unwrap_or(false)
    }

    /// Store a new command, discarding the previous command's output.
    ///
    /// Not allowed while a command is running.
    pub fn set_command(&self, command: &str) -> Result<()> {
        let mut ctl = self.control()?;
        ctl.state.transition_to(SessionState::Idle, "set command")?;
        if let Some(stale) = ctl.session.take() {
            close_session(&*stale, false);
        }
        ctl.command = Some(command.to_string());
        ctl.exit_code = None;
        self.capture(OutputSource::Stdout)?.clear();
        self.capture(OutputSource::Stderr)?.clear();
        Ok(())
    }

    /// Open a session and dispatch the current command.
    ///
    /// The dispatch acknowledgement is bounded by the emergency timeout.
    /// On failure the runner stays `Idle`.
    pub fn start(&self, log: &LogContext) -> Result<()> {
        let mut ctl = self.control()?;
        if ctl.state != SessionState::Idle {
            return Err(RunnerError::InvalidState {
                operation: "start",
                state: ctl.state,
            });
        }
        let command = ctl.command.clone().ok_or(RunnerError::NoCommand)?;
        let wire = wire_command(&command)?;

        log.emit(format_args!("{}", self.describe(&command)));
        self.kill.store(false, Ordering::Release);

        let session: Arc<dyn RemoteSession> = Arc::from(self.transport.open_session()?);
        let ExecStreams { stdout, stderr } = match session.exec(wire, self.emergency_timeout) {
            Ok(streams) => streams,
            Err(e) => {
                close_session(&*session, true);
                return Err(e);
            }
        };

        *self.capture(OutputSource::Stdout)? = StreamCapture::raw(stdout);
        *self.capture(OutputSource::Stderr)? = StreamCapture::raw(stderr);
        ctl.exit_code = None;
        ctl.session = Some(session);
        ctl.generation += 1;
        ctl.state.transition_to(SessionState::Started, "start")
    }

    /// `set_command` followed by `start`.
    pub fn run_command(&self, command: &str, log: &LogContext) -> Result<()> {
        self.set_command(command)?;
        self.start(log)
    }

    /// Block until the process exits, `timeout` elapses, or `kill` is called.
    ///
    /// Returns the exit code, or `None` when the outcome is unknown. Either
    /// way the runner ends up `Finalized` with its session closed. Calling
    /// this again after finalization returns the stored exit code.
    pub fn wait_for_completion(&self, timeout: Option<Duration>) -> Option<i32> {
        let (session, generation) = {
            let mut ctl = match self.control() {
                Ok(ctl) => ctl,
                Err(e) => {
                    warn!("cannot wait for command: {}", e);
                    return None;
                }
            };
            match ctl.state {
                SessionState::Started => {
                    ctl.state = SessionState::AwaitingExit;
                }
                SessionState::AwaitingExit => {}
                SessionState::Finalized => return ctl.exit_code,
                SessionState::Idle => {
                    debug!("wait_for_completion called with no command running");
                    return None;
                }
            }
            match ctl.session.clone() {
                Some(session) => (session, ctl.generation),
                None => return None,
            }
        };

        let (exit_code, exited) = match self.join(&*session, timeout) {
            Ok(WaitOutcome::Exited) => (session.exit_status(), true),
            Ok(WaitOutcome::TimedOut) => {
                debug!("command did not complete within {:?}", timeout);
                (None, false)
            }
            Ok(WaitOutcome::Killed) => {
                debug!("stopped waiting for command on request");
                (None, false)
            }
            Err(e) => {
                debug!("wait interrupted: {}", e);
                (None, false)
            }
        };

        self.finalize(generation, exit_code, exited)
    }

    fn join(&self, session: &dyn RemoteSession, timeout: Option<Duration>) -> std::io::Result<WaitOutcome> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let slice = match deadline {
                Some(d) => d.saturating_duration_since(Instant::now()).min(WAIT_SLICE),
                None => WAIT_SLICE,
            };
            if session.join(Some(slice))? {
                return Ok(WaitOutcome::Exited);
            }
            if self.kill.load(Ordering::Acquire) {
                return Ok(WaitOutcome::Killed);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(WaitOutcome::TimedOut);
            }
        }
    }

    fn finalize(&self, generation: u64, exit_code: Option<i32>, exited: bool) -> Option<i32> {
        let session = {
            let mut ctl = self.control.lock().unwrap_or_else(|e| e.into_inner());
            if ctl.generation != generation || !ctl.state.is_running() {
                // Reset (or another waiter) got here first.
                return if ctl.generation == generation {
                    ctl.exit_code
                } else {
                    None
                };
            }
            ctl.exit_code = exit_code;
            ctl.state = SessionState::Finalized;
            ctl.session.take()
        };

        if let Some(session) = session {
            close_session(&*session, !exited);
        }
        if !exited {
            for slot in [&self.stdout, &self.stderr] {
                slot.lock().unwrap_or_else(|e| e.into_inner()).close();
            }
        }
        exit_code
    }

    /// Full stdout of the current command, drained once and cached.
    ///
    /// Blocks until the stream ends on first call. With a live logger
    /// attached, blocks until the logger has drained and returns its text.
    pub fn stdout(&self) -> Result<String> {
        self.output(OutputSource::Stdout)
    }

    /// Full stderr of the current command, drained once and cached.
    pub fn stderr(&self) -> Result<String> {
        self.output(OutputSource::Stderr)
    }

    fn output(&self, source: OutputSource) -> Result<String> {
        if !self.control()?.state.has_output() {
            return Err(RunnerError::NotStarted);
        }
        Ok(self.capture(source)?.text())
    }

    /// Hand both raw streams to a new live logger.
    ///
    /// From then on `stdout`/`stderr` report the logger's accumulated text.
    pub fn attach_live_logger(&self, log: LogContext) -> Result<LiveStreamLogger> {
        let ctl = self.control()?;
        if !ctl.state.is_running() {
            return Err(RunnerError::InvalidState {
                operation: "attach live logger",
                state: ctl.state,
            });
        }

        // A reader draining a stream holds its capture until end-of-stream;
        // waiting for it here would stall every other operation behind the
        // control lock.
        let mut stdout = self.try_capture(OutputSource::Stdout)?;
        let mut stderr = self.try_capture(OutputSource::Stderr)?;
        if !(stdout.is_raw() && stderr.is_raw()) {
            return Err(RunnerError::StreamsConsumed);
        }
        let streams = match (stdout.take_raw(), stderr.take_raw()) {
            (Some(stdout), Some(stderr)) => ExecStreams { stdout, stderr },
            _ => return Err(RunnerError::StreamsConsumed),
        };

        let logger = LiveStreamLogger::attach(streams, log)?;
        stdout.observe(logger.output(OutputSource::Stdout));
        stderr.observe(logger.output(OutputSource::Stderr));
        Ok(logger)
    }

    /// Snapshot of the current command's outcome. Drains output if needed.
    pub fn result(&self) -> Result<CommandResult> {
        let exit_code = self.exit_code();
        Ok(CommandResult::new(exit_code, self.stdout()?, self.stderr()?))
    }

    /// Run `command`, wait for it under `opts` and collect the result.
    pub fn run_and_wait(&self, command: &str, opts: &RunOptions) -> Result<CommandResult> {
        self.run_command(command, &opts.log)?;

        let live = opts.capture_output && opts.live_log;
        let logger = if live {
            Some(self.attach_live_logger(opts.log.clone())?)
        } else {
            None
        };

        let exit_code = if opts.capture_output && !live {
            self.wait_while_draining(opts.timeout)
        } else {
            self.wait_for_completion(opts.timeout)
        };

        if !opts.capture_output {
            return Ok(CommandResult::new(exit_code, String::new(), String::new()));
        }

        let result = CommandResult::new(exit_code, self.stdout()?, self.stderr()?);
        if !live {
            let log = &opts.log;
            log.emit(format_args!("Stdout: {}{}", block_prefix(result.stdout()), result.stdout()));
            log.emit(format_args!("Stderr: {}{}", block_prefix(result.stderr()), result.stderr()));
        }
        match exit_code {
            Some(code) => opts.log.emit(format_args!("ExitCode: {}", code)),
            None => opts.log.emit(format_args!("ExitCode: unknown")),
        }

        if let Some(logger) = logger {
            logger.join();
        }
        Ok(result)
    }

    /// Wait while both streams are read to completion on scoped threads.
    ///
    /// A remote process blocks once its unread output fills the channel
    /// window, and then never exits; reading alongside the wait keeps it
    /// moving. The drained text is cached in the captures.
    fn wait_while_draining(&self, timeout: Option<Duration>) -> Option<i32> {
        thread::scope(|scope| {
            for source in [OutputSource::Stdout, OutputSource::Stderr] {
                let spawned = thread::Builder::new()
                    .name(format!("drain-{}", source))
                    .spawn_scoped(scope, move || {
                        if let Err(e) = self.output(source) {
                            debug!("drain of {} stopped: {}", source, e);
                        }
                    });
                if let Err(e) = spawned {
                    debug!("cannot spawn {} drain, reading after exit: {}", source, e);
                }
            }
            self.wait_for_completion(timeout)
        })
    }

    /// `run_and_wait` on tokio's blocking pool.
    pub async fn run_and_wait_async(
        self: Arc<Self>,
        command: String,
        opts: RunOptions,
    ) -> Result<CommandResult> {
        tokio::task::spawn_blocking(move || self.run_and_wait(&command, &opts))
            .await
            .map_err(|e| RunnerError::TaskFailed(e.to_string()))?
    }

    /// Ask an in-progress wait to give up.
    ///
    /// Local only: the remote process is not signalled and may keep running.
    pub fn kill(&self) {
        self.kill.store(true, Ordering::Release);
    }

    /// Close everything and return to `Idle` with no command set.
    ///
    /// Valid from any state, including while another thread waits. Close
    /// failures are logged, never returned.
    pub fn reset(&self) {
        let session = {
            let mut ctl = self.control.lock().unwrap_or_else(|e| e.into_inner());
            ctl.generation += 1;
            ctl.state = SessionState::Idle;
            ctl.command = None;
            ctl.exit_code = None;
            ctl.session.take()
        };
        if let Some(session) = session {
            close_session(&*session, true);
        }
        for slot in [&self.stdout, &self.stderr] {
            slot.lock().unwrap_or_else(|e| e.into_inner()).clear();
        }
    }

    fn describe(&self, command: &str) -> String {
        match self.transport.username() {
            Some(user) => format!("ssh {}@{} {}", user, self.transport.remote_host(), command),
            None => format!("ssh {} {}", self.transport.remote_host(), command),
        }
    }
}

impl Drop for CommandRunner {
    fn drop(&mut self) {
        let session = self
            .control
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .session
            .take();
        if let Some(session) = session {
            close_session(&*session, true);
        }
    }
}

/// Best-effort session close; failures are only logged.
fn close_session(session: &dyn RemoteSession, abort: bool) {
    let outcome = if abort { session.abort() } else { session.close() };
    if let Err(e) = outcome {
        debug!("couldn't close session: {}", e);
    }
}

/// Validate that command text can travel over the wire.
fn wire_command(command: &str) -> Result<&str> {
    match command.find('\0') {
        Some(position) => Err(RunnerError::Encoding { position }),
        None => Ok(command),
    }
}

/// Multi-line output starts on its own line.
fn block_prefix(text: &str) -> &'static str {
    if text.lines().count() > 1 {
        "\n"
    } else {
        ""
    }
}
