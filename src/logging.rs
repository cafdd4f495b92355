//! Logging initialization and per-command log routing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "ssh_runner=info";

/// Initialize the logging system.
///
/// Uses the `RUST_LOG` environment variable for filtering. If not set,
/// defaults to `ssh_runner=info`.
///
/// # Panics
///
/// Panics if called more than once, or if another tracing subscriber
/// has already been set.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .init();
}

/// Try to initialize the logging system.
///
/// Returns `Ok(())` if successful, or `Err` if logging has already been
/// initialized.
pub fn try_init() -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .try_init()
}

/// Initialize logging with an explicit filter directive.
///
/// A bare level such as `debug` is scoped to this crate; anything else is
/// passed to [`EnvFilter`] as-is.
pub fn init_with_filter(directive: &str) -> Result<(), tracing_subscriber::util::TryInitError> {
    let directive = match directive.parse::<Severity>() {
        Ok(severity) => format!("ssh_runner={}", severity),
        Err(_) => directive.to_string(),
    };
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .try_init()
}

/// Severity used for a command's log lines, chosen per invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Trace => "trace",
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        };
        f.write_str(name)
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Severity::Trace),
            "debug" | "fine" => Ok(Severity::Debug),
            "info" | "action" => Ok(Severity::Info),
            "warn" | "warning" => Ok(Severity::Warn),
            "error" => Ok(Severity::Error),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// Severity and tag attached to every line logged for one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogContext {
    pub severity: Severity,
    pub tag: String,
}

impl LogContext {
    pub fn new(severity: Severity, tag: impl Into<String>) -> Self {
        Self {
            severity,
            tag: tag.into(),
        }
    }

    /// Log a message under this context.
    pub fn emit(&self, message: fmt::Arguments<'_>) {
        emit(self.severity, &self.tag, message);
    }

    /// Log one line of command output, with the stream it came from as a
    /// `stream` field.
    pub fn emit_line(&self, stream: &str, line: fmt::Arguments<'_>) {
        emit_line(self.severity, &self.tag, stream, line);
    }
}

impl Default for LogContext {
    fn default() -> Self {
        Self::new(Severity::Info, "ssh")
    }
}

/// Emit one event at a severity picked at runtime.
pub fn emit(severity: Severity, tag: &str, message: fmt::Arguments<'_>) {
    match severity {
        Severity::Trace => tracing::trace!(tag, "{}", message),
        Severity::Debug => tracing::debug!(tag, "{}", message),
        Severity::Info => tracing::info!(tag, "{}", message),
        Severity::Warn => tracing::warn!(tag, "{}", message),
        Severity::Error => tracing::error!(tag, "{}", message),
    }
}

/// Emit one output line at a severity picked at runtime.
pub fn emit_line(severity: Severity, tag: &str, stream: &str, line: fmt::Arguments<'_>) {
    match severity {
        Severity::Trace => tracing::trace!(tag, stream, "{}", line),
        Severity::Debug => tracing::debug!(tag, stream, "{}", line),
        Severity::Info => tracing::info!(tag, stream, "{}", line),
        Severity::Warn => tracing::warn!(tag, stream, "{}", line),
        Severity::Error => tracing::error!(tag, stream, "{}", line),
    }
}
