//! Command-line interface for ssh-runner.
//!
//! Uses lexopt for minimal binary size overhead.

use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;

use lexopt::prelude::*;

/// A `-L LOCAL:HOST:PORT` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    /// Local port; 0 lets the OS pick.
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl FromStr for ForwardSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (local, rest) = s.split_once(':').ok_or_else(|| s.to_string())?;
        let (host, remote) = rest.rsplit_once(':').ok_or_else(|| s.to_string())?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(s.to_string());
        }
        Ok(Self {
            local_port: local.parse().map_err(|_| s.to_string())?,
            remote_host: host.to_string(),
            remote_port: remote.parse().map_err(|_| s.to_string())?,
        })
    }
}

/// Command-line arguments.
#[derive(Debug, Clone, Default)]
pub struct Args {
    /// Remote host.
    pub host: Option<String>,
    /// SSH port.
    pub port: Option<u16>,
    /// Login user.
    pub user: Option<String>,
    /// Private key file.
    pub identity: Option<PathBuf>,
    /// Wait timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Dispatch timeout in milliseconds.
    pub emergency_timeout_ms: Option<u64>,
    /// Log output while the command runs.
    pub live: bool,
    /// Don't read output at all.
    pub no_capture: bool,
    /// Print the result as JSON.
    pub json: bool,
    /// Local forwards held open while the command runs.
    pub forwards: Vec<ForwardSpec>,
    /// Skip host key verification.
    pub insecure: bool,
    /// Path to configuration file.
    pub config: Option<PathBuf>,
    /// Log level (error, warn, info, debug, trace).
    pub log_level: Option<String>,
    /// Remote command words.
    pub command: Vec<String>,
    /// Show version and exit.
    pub version: bool,
    /// Show help and exit.
    pub help: bool,
}

impl Args {
    /// Remote command as a single line.
    pub fn command_line(&self) -> Option<String> {
        if self.command.is_empty() {
            None
        } else {
            Some(self.command.join(" "))
        }
    }
}

/// Parse command-line arguments.
pub fn parse_args() -> Result<Args, ArgsError> {
    parse_args_from(std::env::args_os())
}

/// Parse arguments from an iterator (for testing).
///
/// The first positional argument starts the remote command; it and
/// everything after it are passed through untouched.
pub fn parse_args_from<I>(args: I) -> Result<Args, ArgsError>
where
    I: IntoIterator<Item = OsString>,
{
    let mut result = Args::default();
    let mut parser = lexopt::Parser::from_iter(args);

    while let Some(arg) = parser.next()? {
        match arg {
            Short('h') | Long("help") => {
                result.help = true;
            }
            Short('V') | Long("version") => {
                result.version = true;
            }
            Short('H') | Long("host") => {
                result.host = Some(parser.value()?.parse()?);
            }
            Short('p') | Long("port") => {
                result.port = Some(parse_number(&mut parser, "port")?);
            }
            Short('u') | Long("user") => {
                result.user = Some(parser.value()?.parse()?);
            }
            Short('i') | Long("identity") => {
                result.identity = Some(parser.value()?.parse()?);
            }
            Short('t') | Long("timeout") => {
                result.timeout_ms = Some(parse_number(&mut parser, "timeout")?);
            }
            Short('e') | Long("emergency-timeout") => {
                result.emergency_timeout_ms = Some(parse_number(&mut parser, "emergency-timeout")?);
            }
            Long("live") => {
                result.live = true;
            }
            Long("no-capture") => {
                result.no_capture = true;
            }
            Long("json") => {
                result.json = true;
            }
            Short('L') | Long("forward") => {
                let value: String = parser.value()?.parse()?;
                let spec = value
                    .parse()
                    .map_err(|_| ArgsError::InvalidValue("forward", value))?;
                result.forwards.push(spec);
            }
            Long("insecure") => {
                result.insecure = true;
            }
            Short('c') | Long("config") => {
                result.config = Some(parser.value()?.parse()?);
            }
            Short('l') | Long("log-level") => {
                result.log_level = Some(parser.value()?.parse()?);
            }
            Value(val) => {
                result.command.push(into_string(val)?);
                for rest in parser.raw_args()? {
                    result.command.push(into_string(rest)?);
                }
            }
            _ => return Err(arg.unexpected().into()),
        }
    }

    Ok(result)
}

fn parse_number<T: FromStr>(
    parser: &mut lexopt::Parser,
    name: &'static str,
) -> Result<T, ArgsError> {
    let value: String = parser.value()?.parse()?;
    value
        .parse()
        .map_err(|_| ArgsError::InvalidValue(name, value))
}

fn into_string(value: OsString) -> Result<String, ArgsError> {
    value
        .into_string()
        .map_err(|v| ArgsError::UnexpectedArgument(v.to_string_lossy().into()))
}

/// Print help message.
pub fn print_help() {
    let version = env!("CARGO_PKG_VERSION");
    println!(
        r#"ssh-runner {version}
Run a command on a remote host over SSH and report its outcome

USAGE:
    ssh-runner [OPTIONS] -H <HOST> <COMMAND>...

OPTIONS:
    -H, --host <HOST>              Remote host
    -p, --port <PORT>              SSH port [default: 22]
    -u, --user <USER>              Login user
    -i, --identity <FILE>          Private key file
    -t, --timeout <MS>             Wait at most this long for the command to exit
    -e, --emergency-timeout <MS>   Bound on command dispatch, 0 = none [default: 1000]
        --live                     Log output line by line as it arrives
        --no-capture               Don't read output, report the exit code only
        --json                     Print the result as JSON
    -L, --forward <L:HOST:PORT>    Forward local port L to HOST:PORT (repeatable)
        --insecure                 Skip host key verification
    -c, --config <FILE>            Path to configuration file (JSON)
    -l, --log-level <LVL>          Log level (error, warn, info, debug, trace)
    -h, --help                     Print help
    -V, --version                  Print version

ENVIRONMENT VARIABLES:
    SSH_RUNNER_HOST                    Remote host (overrides config)
    SSH_RUNNER_PORT                    SSH port (overrides config)
    SSH_RUNNER_USER                    Login user (overrides config)
    SSH_RUNNER_PASSWORD                Password, or fallback when a key is rejected
    SSH_RUNNER_KEY                     Private key file (overrides config)
    SSH_RUNNER_EMERGENCY_TIMEOUT_MS    Dispatch bound (overrides config)
    SSH_RUNNER_LOG_LEVEL               Log level (overrides config)
    RUST_LOG                           Alternative log level setting

EXIT STATUS:
    The remote command's exit code, 124 when it did not finish in time,
    2 for usage errors and 1 for connection failures.

EXAMPLES:
    # Run with agent authentication
    ssh-runner -H build-01 -u ci uname -a

    # Stream output, give up after a minute
    ssh-runner -H build-01 -u ci --live -t 60000 make test

    # Reach a database behind the host while a migration runs
    ssh-runner -H bastion -u ops -L 15432:db.internal:5432 ./migrate.sh
"#
    );
}

/// Print version.
pub fn print_version() {
    println!("ssh-runner {}", env!("CARGO_PKG_VERSION"));
}

/// Argument parsing errors.
#[derive(Debug)]
pub enum ArgsError {
    /// Lexopt parsing error.
    Lexopt(lexopt::Error),
    /// Invalid argument value.
    InvalidValue(&'static str, String),
    /// Argument that is not valid UTF-8.
    UnexpectedArgument(String),
}

impl std::fmt::Display for ArgsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lexopt(e) => write!(f, "{}", e),
            Self::InvalidValue(name, value) => {
                write!(f, "invalid value for --{}: '{}'", name, value)
            }
            Self::UnexpectedArgument(arg) => {
                write!(f, "unexpected argument: '{}'", arg)
            }
        }
    }
}

impl std::error::Error for ArgsError {}

impl From<lexopt::Error> for ArgsError {
    fn from(e: lexopt::Error) -> Self {
        Self::Lexopt(e)
    }
}
