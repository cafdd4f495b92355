//! Drain-once stream capture.

use std::io::{self, BufRead, BufReader, Read};
use std::mem;

use tracing::debug;

use super::live::LiveOutput;
use crate::transport::OutputStream;

/// Read `reader` to end-of-stream, calling `on_line` for every line.
///
/// Lines are handed over without their terminator; `\r\n` counts as one
/// terminator and a trailing partial line is still delivered. On error,
/// whatever was read before the failure has already been delivered.
pub fn read_lines<R: Read>(reader: R, mut on_line: impl FnMut(&str)) -> io::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw) {
            Ok(0) => return Ok(()),
            Ok(_) => on_line(&String::from_utf8_lossy(trim_line_ending(&raw))),
            Err(e) => {
                if !raw.is_empty() {
                    on_line(&String::from_utf8_lossy(trim_line_ending(&raw)));
                }
                return Err(e);
            }
        }
    }
}

fn trim_line_ending(raw: &[u8]) -> &[u8] {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    raw.strip_suffix(b"\r").unwrap_or(raw)
}

enum Source {
    /// Nothing attached yet, or cleared by a reset.
    Empty,
    /// Unread stream straight from the transport.
    Raw(OutputStream),
    /// Stream handed to a live logger; its text arrives from there.
    Live(LiveOutput),
    /// Materialised text. Never re-read.
    Captured(String),
}

/// One output stream of one command, materialised into text at most once.
pub struct StreamCapture {
    source: Source,
}

impl StreamCapture {
    /// A capture with nothing attached.
    pub fn empty() -> Self {
        Self {
            source: Source::Empty,
        }
    }

    /// Wrap a raw stream.
    pub fn raw(stream: OutputStream) -> Self {
        Self {
            source: Source::Raw(stream),
        }
    }

    /// Full text of the stream.
    ///
    /// The first call blocks until the stream ends (or, for a stream owned by
    /// a live logger, until the logger has drained it) and caches the result.
    /// Later calls return the cached text.
    pub fn text(&mut self) -> String {
        let text = match mem::replace(&mut self.source, Source::Empty) {
            Source::Empty => String::new(),
            Source::Raw(stream) => drain(stream),
            Source::Live(live) => live.wait_text(),
            Source::Captured(text) => text,
        };
        self.source = Source::Captured(text.clone());
        text
    }

    /// Whether the raw stream is still attached and unread.
    pub fn is_raw(&self) -> bool {
        matches!(self.source, Source::Raw(_))
    }

    /// Whether the text has already been materialised.
    pub fn is_captured(&self) -> bool {
        matches!(self.source, Source::Captured(_))
    }

    /// Hand the raw stream to another reader, leaving the capture empty.
    pub fn take_raw(&mut self) -> Option<OutputStream> {
        match mem::replace(&mut self.source, Source::Empty) {
            Source::Raw(stream) => Some(stream),
            other => {
                self.source = other;
                None
            }
        }
    }

    /// Take text from a live logger instead of reading a stream.
    pub(crate) fn observe(&mut self, live: LiveOutput) {
        self.source = Source::Live(live);
    }

    /// Drop an unread raw stream; its text becomes empty.
    ///
    /// Captured text and live observation are left alone.
    pub fn close(&mut self) {
        if self.is_raw() {
            self.source = Source::Captured(String::new());
        }
    }

    /// Forget everything, including cached text.
    pub fn clear(&mut self) {
        self.source = Source::Empty;
    }
}

impl Default for StreamCapture {
    fn default() -> Self {
        Self::empty()
    }
}

fn drain(stream: OutputStream) -> String {
    let mut text = String::new();
    let result = read_lines(stream, |line| {
        text.push_str(line);
        text.push('\n');
    });
    if let Err(e) = result {
        debug!("stream ended abruptly after {} bytes: {}", text.len(), e);
    }
    text
}
