//! Live logging of a running command's output.
//!
//! One blocking reader thread per stream pushes completed lines into a
//! channel; a collector thread logs each line as it arrives and keeps the
//! accumulated text. Both streams are thereby reported interleaved, in
//! arrival order.

use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::capture::read_lines;
use super::OutputSource;
use crate::logging::LogContext;
use crate::transport::{ExecStreams, OutputStream};

/// Lines buffered between the readers and the collector.
const LINE_BUFFER: usize = 256;

enum LiveEvent {
    Line(OutputSource, String),
    Interrupted(OutputSource, io::Error),
}

#[derive(Default)]
struct LiveState {
    stdout: String,
    stderr: String,
    stdout_lines: usize,
    stderr_lines: usize,
    interruptions: Vec<String>,
    drained: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<LiveState>,
    drained: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LiveState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait_drained(&self) -> MutexGuard<'_, LiveState> {
        let state = self.lock();
        self.drained
            .wait_while(state, |s| !s.drained)
            .unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle a [`StreamCapture`](super::StreamCapture) uses to obtain the
/// logger's text for one stream.
pub(crate) struct LiveOutput {
    shared: Arc<Shared>,
    source: OutputSource,
}

impl LiveOutput {
    pub(crate) fn wait_text(&self) -> String {
        let state = self.shared.wait_drained();
        match self.source {
            OutputSource::Stdout => state.stdout.clone(),
            OutputSource::Stderr => state.stderr.clone(),
        }
    }
}

/// Concurrently drains a command's stdout and stderr, logging every line.
///
/// The logger owns the raw streams from `attach` on. Draining ends when both
/// streams reach end-of-stream, which happens once the remote process exits
/// and the channel closes, or when the runner closes the channel early.
pub struct LiveStreamLogger {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl LiveStreamLogger {
    /// Start draining `streams`, logging under `ctx`.
    pub fn attach(streams: ExecStreams, ctx: LogContext) -> io::Result<Self> {
        let shared = Arc::new(Shared::default());
        let (tx, rx) = mpsc::channel::<LiveEvent>(LINE_BUFFER);

        let collector = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("live-log-collector".into())
                .spawn(move || collect(rx, shared, ctx))?
        };
        let stdout = spawn_reader(streams.stdout, OutputSource::Stdout, tx.clone())?;
        let stderr = spawn_reader(streams.stderr, OutputSource::Stderr, tx)?;

        Ok(Self {
            shared,
            threads: vec![collector, stdout, stderr],
        })
    }

    /// Accumulated stdout. Blocks until both streams are drained.
    pub fn stdout(&self) -> String {
        self.shared.wait_drained().stdout.clone()
    }

    /// Accumulated stderr. Blocks until both streams are drained.
    pub fn stderr(&self) -> String {
        self.shared.wait_drained().stderr.clone()
    }

    /// Lines seen so far on `source`.
    pub fn line_count(&self, source: OutputSource) -> usize {
        let state = self.shared.lock();
        match source {
            OutputSource::Stdout => state.stdout_lines,
            OutputSource::Stderr => state.stderr_lines,
        }
    }

    /// Whether both streams have reached end-of-stream.
    pub fn is_drained(&self) -> bool {
        self.shared.lock().drained
    }

    /// Block until drained or `timeout` elapses. Returns `true` when drained.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .drained
            .wait_timeout_while(state, timeout, |s| !s.drained)
            .unwrap_or_else(|e| e.into_inner());
        state.drained
    }

    /// Streams that ended with an error rather than a clean end-of-stream.
    ///
    /// Output read before the failure is kept; an interruption is never fatal.
    pub fn interruptions(&self) -> Vec<String> {
        self.shared.lock().interruptions.clone()
    }

    pub(crate) fn output(&self, source: OutputSource) -> LiveOutput {
        LiveOutput {
            shared: Arc::clone(&self.shared),
            source,
        }
    }

    /// Wait for the worker threads to finish.
    pub fn join(mut self) {
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("live logger thread panicked");
            }
        }
    }
}

fn spawn_reader(
    stream: OutputStream,
    source: OutputSource,
    tx: mpsc::Sender<LiveEvent>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("live-log-{}", source))
        .spawn(move || {
            let result = read_lines(stream, |line| {
                // Collector gone means nobody is listening; keep draining anyway.
                let _ = tx.blocking_send(LiveEvent::Line(source, line.to_string()));
            });
            match result {
                Ok(()) => debug!("live logger: {} reached end-of-stream", source),
                Err(e) => {
                    let _ = tx.blocking_send(LiveEvent::Interrupted(source, e));
                }
            }
        })
}

fn collect(mut rx: mpsc::Receiver<LiveEvent>, shared: Arc<Shared>, ctx: LogContext) {
    while let Some(event) = rx.blocking_recv() {
        match event {
            LiveEvent::Line(source, line) => {
                ctx.emit_line(source.as_str(), format_args!("{}", line));
                let mut guard = shared.lock();
                let state = &mut *guard;
                let (text, count) = match source {
                    OutputSource::Stdout => (&mut state.stdout, &mut state.stdout_lines),
                    OutputSource::Stderr => (&mut state.stderr, &mut state.stderr_lines),
                };
                text.push_str(&line);
                text.push('\n');
                *count += 1;
            }
            LiveEvent::Interrupted(source, e) => {
                warn!("live logger: {} closed abruptly, keeping partial output: {}", source, e);
                shared
                    .lock()
                    .interruptions
                    .push(format!("{}: {}", source, e));
            }
        }
    }

    shared.lock().drained = true;
    shared.drained.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    struct Dropped {
        data: Cursor<Vec<u8>>,
    }

    impl Read for Dropped {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.data.read(buf)? {
                0 => Err(io::Error::new(io::ErrorKind::ConnectionReset, "dropped")),
                n => Ok(n),
            }
        }
    }

    fn streams(stdout: &str, stderr: &str) -> ExecStreams {
        ExecStreams {
            stdout: Box::new(Cursor::new(stdout.as_bytes().to_vec())),
            stderr: Box::new(Cursor::new(stderr.as_bytes().to_vec())),
        }
    }

    #[test]
    fn test_accumulates_both_streams() {
        let logger =
            LiveStreamLogger::attach(streams("a\nb\nc\n", "oops\n"), LogContext::default())
                .unwrap();

        assert_eq!(logger.stdout(), "a\nb\nc\n");
        assert_eq!(logger.stderr(), "oops\n");
        assert_eq!(logger.line_count(OutputSource::Stdout), 3);
        assert_eq!(logger.line_count(OutputSource::Stderr), 1);
        assert!(logger.is_drained());
        assert!(logger.interruptions().is_empty());
        logger.join();
    }

    #[test]
    fn test_empty_streams() {
        let logger = LiveStreamLogger::attach(streams("", ""), LogContext::default()).unwrap();
        assert!(logger.wait_timeout(Duration::from_secs(5)));
        assert_eq!(logger.stdout(), "");
        assert_eq!(logger.stderr(), "");
    }

    #[test]
    fn test_abrupt_close_keeps_partial_output() {
        let broken = ExecStreams {
            stdout: Box::new(Dropped {
                data: Cursor::new(b"line one\nline two\nhalf".to_vec()),
            }),
            stderr: Box::new(Cursor::new(Vec::new())),
        };
        let logger = LiveStreamLogger::attach(broken, LogContext::default()).unwrap();

        assert_eq!(logger.stdout(), "line one\nline two\nhalf\n");
        let interruptions = logger.interruptions();
        assert_eq!(interruptions.len(), 1);
        assert!(interruptions[0].starts_with("stdout"));
    }

    #[test]
    fn test_live_output_handle_matches_logger() {
        let logger =
            LiveStreamLogger::attach(streams("x\n", "y\n"), LogContext::default()).unwrap();
        let out = logger.output(OutputSource::Stdout);
        let err = logger.output(OutputSource::Stderr);
        assert_eq!(out.wait_text(), logger.stdout());
        assert_eq!(err.wait_text(), logger.stderr());
    }
}
