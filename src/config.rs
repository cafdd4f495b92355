//! Configuration management for ssh-runner.
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. Configuration file (JSON)
//! 4. Default values

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cli::Args;
use crate::execution::RunOptions;
use crate::logging::{LogContext, Severity};
use crate::transport::{AuthMethod, SshConfig};

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where and how to connect.
    pub connection: ConnectionSection,
    /// Runner behaviour.
    pub runner: RunnerSection,
    /// Logging configuration.
    pub logging: LoggingSection,
}

/// Connection configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    /// Remote host name or address.
    pub host: Option<String>,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub user: Option<String>,
    /// Password, or fallback password when a key is also set.
    pub password: Option<String>,
    /// Private key path.
    pub key: Option<PathBuf>,
    /// Passphrase for an encrypted key.
    pub passphrase: Option<String>,
    /// known_hosts file.
    pub known_hosts: Option<PathBuf>,
    /// Verify the host key against known_hosts.
    pub strict_host_key_checking: bool,
    /// TCP connect and handshake timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            host: None,
            port: 22,
            user: None,
            password: None,
            key: None,
            passphrase: None,
            known_hosts: None,
            strict_host_key_checking: true,
            connect_timeout_ms: 30_000,
        }
    }
}

/// Runner configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSection {
    /// Bound on command dispatch, in milliseconds. `null` or 0 waits forever.
    pub emergency_timeout_ms: Option<u64>,
    /// Bound on waiting for the command to exit. `null` waits forever.
    pub wait_timeout_ms: Option<u64>,
    /// Log output line by line while the command runs.
    pub live_log: bool,
    /// Capture and report output.
    pub capture_output: bool,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            emergency_timeout_ms: Some(1000),
            wait_timeout_ms: None,
            live_log: false,
            capture_output: true,
        }
    }
}

impl RunnerSection {
    /// Dispatch bound as a duration; `None` is unbounded.
    pub fn emergency_timeout(&self) -> Option<Duration> {
        self.emergency_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level or filter directive (error, warn, info, debug, trace).
    pub level: String,
    /// Severity of command, output and exit code lines.
    pub command_severity: Severity,
    /// Tag attached to command lines.
    pub tag: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            command_severity: Severity::Info,
            tag: "ssh".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        serde_json::from_str(&content).map_err(ConfigError::Json)
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(host) = var("SSH_RUNNER_HOST") {
            self.connection.host = Some(host);
        }

        if let Some(port) = var("SSH_RUNNER_PORT") {
            self.connection.port = port
                .parse()
                .map_err(|_| ConfigError::InvalidValue("SSH_RUNNER_PORT", port))?;
        }

        if let Some(user) = var("SSH_RUNNER_USER") {
            self.connection.user = Some(user);
        }

        if let Some(password) = var("SSH_RUNNER_PASSWORD") {
            if !password.is_empty() {
                self.connection.password = Some(password);
            }
        }

        if let Some(key) = var("SSH_RUNNER_KEY") {
            if !key.is_empty() {
                self.connection.key = Some(PathBuf::from(key));
            }
        }

        if let Some(ms) = var("SSH_RUNNER_EMERGENCY_TIMEOUT_MS") {
            self.runner.emergency_timeout_ms = Some(ms.parse().map_err(|_| {
                ConfigError::InvalidValue("SSH_RUNNER_EMERGENCY_TIMEOUT_MS", ms)
            })?);
        }

        if let Some(level) = var("SSH_RUNNER_LOG_LEVEL") {
            self.logging.level = level;
        } else if let Some(level) = var("RUST_LOG") {
            self.logging.level = level;
        }

        Ok(())
    }

    /// Apply CLI argument overrides.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(ref host) = args.host {
            self.connection.host = Some(host.clone());
        }
        if let Some(port) = args.port {
            self.connection.port = port;
        }
        if let Some(ref user) = args.user {
            self.connection.user = Some(user.clone());
        }
        if let Some(ref identity) = args.identity {
            self.connection.key = Some(identity.clone());
        }
        if args.insecure {
            self.connection.strict_host_key_checking = false;
        }

        if let Some(ms) = args.timeout_ms {
            self.runner.wait_timeout_ms = Some(ms);
        }
        if let Some(ms) = args.emergency_timeout_ms {
            self.runner.emergency_timeout_ms = Some(ms);
        }
        if args.live {
            self.runner.live_log = true;
        }
        if args.no_capture {
            self.runner.capture_output = false;
        }

        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }
    }

    /// Load configuration with full priority chain.
    ///
    /// Priority: CLI args > env vars > config file > defaults
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let mut config = match args.config {
            Some(ref path) => Config::from_file(path)?,
            None => Config::default(),
        };

        config.apply_env()?;
        config.apply_args(args);

        Ok(config)
    }

    /// Build transport settings.
    ///
    /// Authentication is picked from what is configured: a key (with the
    /// password as fallback), else a password, else the ssh-agent.
    pub fn to_ssh_config(&self) -> Result<SshConfig, ConfigError> {
        let conn = &self.connection;
        let host = conn.host.clone().ok_or(ConfigError::Missing("host"))?;
        let user = conn.user.clone().ok_or(ConfigError::Missing("user"))?;

        let auth = match (&conn.key, &conn.password) {
            (Some(key), password) => AuthMethod::Key {
                key_path: key.clone(),
                passphrase: conn.passphrase.clone(),
                password_fallback: password.clone(),
            },
            (None, Some(password)) => AuthMethod::Password(password.clone()),
            (None, None) => AuthMethod::Agent,
        };

        Ok(SshConfig {
            host,
            port: conn.port,
            username: user,
            auth,
            connect_timeout: Duration::from_millis(conn.connect_timeout_ms),
            known_hosts: conn.known_hosts.clone(),
            strict_host_key_checking: conn.strict_host_key_checking,
        })
    }

    /// Build per-command run options.
    pub fn to_run_options(&self) -> RunOptions {
        RunOptions {
            timeout: self.runner.wait_timeout_ms.map(Duration::from_millis),
            live_log: self.runner.live_log,
            capture_output: self.runner.capture_output,
            log: LogContext::new(self.logging.command_severity, self.logging.tag.clone()),
        }
    }

    /// Get the log level filter string.
    pub fn log_filter(&self) -> &str {
        &self.logging.level
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(std::io::Error),
    /// JSON parsing error.
    Json(serde_json::Error),
    /// Unparseable override value.
    InvalidValue(&'static str, String),
    /// Required setting not provided anywhere.
    Missing(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read config file: {}", e),
            Self::Json(e) => write!(f, "failed to parse config file: {}", e),
            Self::InvalidValue(name, value) => write!(f, "invalid value for {}: '{}'", name, value),
            Self::Missing(name) => write!(f, "no {} configured", name),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.connection.host.is_none());
        assert_eq!(config.connection.port, 22);
        assert!(config.connection.strict_host_key_checking);
        assert_eq!(config.runner.emergency_timeout(), Some(Duration::from_millis(1000)));
        assert!(config.runner.capture_output);
        assert_eq!(config.log_filter(), "info");
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "connection": {
                "host": "build-01",
                "port": 2222,
                "user": "ci",
                "key": "~/.ssh/id_ed25519"
            },
            "runner": {
                "emergency_timeout_ms": null,
                "wait_timeout_ms": 60000,
                "live_log": true
            },
            "logging": {
                "command_severity": "debug"
            }
        }"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.connection.host.as_deref(), Some("build-01"));
        assert_eq!(config.connection.port, 2222);
        assert_eq!(config.runner.emergency_timeout(), None);
        assert_eq!(config.runner.wait_timeout_ms, Some(60000));
        assert!(config.runner.live_log);
        assert_eq!(config.logging.command_severity, Severity::Debug);
        assert_eq!(config.logging.tag, "ssh");
    }

    #[test]
    fn test_config_partial_json() {
        let json = r#"{ "connection": { "host": "db" } }"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.connection.host.as_deref(), Some("db"));
        assert_eq!(config.connection.port, 22); // Default
        assert_eq!(config.runner.emergency_timeout_ms, Some(1000));
    }

    #[test]
    fn test_config_bad_json() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let result = Config::from_file(Path::new("/nonexistent/ssh-runner.json"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_vars(vars(&[
                ("SSH_RUNNER_HOST", "10.0.0.7"),
                ("SSH_RUNNER_PORT", "2200"),
                ("SSH_RUNNER_USER", "deploy"),
                ("SSH_RUNNER_PASSWORD", "hunter2"),
                ("SSH_RUNNER_EMERGENCY_TIMEOUT_MS", "250"),
                ("RUST_LOG", "debug"),
            ]))
            .unwrap();

        assert_eq!(config.connection.host.as_deref(), Some("10.0.0.7"));
        assert_eq!(config.connection.port, 2200);
        assert_eq!(config.connection.user.as_deref(), Some("deploy"));
        assert_eq!(config.connection.password.as_deref(), Some("hunter2"));
        assert_eq!(config.runner.emergency_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.log_filter(), "debug");
    }

    #[test]
    fn test_env_log_level_beats_rust_log() {
        let mut config = Config::default();
        config
            .apply_vars(vars(&[("SSH_RUNNER_LOG_LEVEL", "warn"), ("RUST_LOG", "trace")]))
            .unwrap();
        assert_eq!(config.log_filter(), "warn");
    }

    #[test]
    fn test_env_invalid_port() {
        let mut config = Config::default();
        let result = config.apply_vars(vars(&[("SSH_RUNNER_PORT", "ssh")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue("SSH_RUNNER_PORT", _))
        ));
    }

    #[test]
    fn test_zero_emergency_timeout_is_unbounded() {
        let mut config = Config::default();
        config
            .apply_vars(vars(&[("SSH_RUNNER_EMERGENCY_TIMEOUT_MS", "0")]))
            .unwrap();
        assert_eq!(config.runner.emergency_timeout(), None);
    }

    #[test]
    fn test_apply_args() {
        let mut config = Config::default();
        config.connection.host = Some("from-file".into());
        let args = Args {
            host: Some("from-cli".into()),
            user: Some("root".into()),
            port: Some(2022),
            timeout_ms: Some(5000),
            live: true,
            no_capture: true,
            insecure: true,
            log_level: Some("trace".into()),
            ..Args::default()
        };

        config.apply_args(&args);

        assert_eq!(config.connection.host.as_deref(), Some("from-cli"));
        assert_eq!(config.connection.user.as_deref(), Some("root"));
        assert_eq!(config.connection.port, 2022);
        assert!(!config.connection.strict_host_key_checking);
        assert_eq!(config.runner.wait_timeout_ms, Some(5000));
        assert!(config.runner.live_log);
        assert!(!config.runner.capture_output);
        assert_eq!(config.log_filter(), "trace");
    }

    #[test]
    fn test_apply_args_keeps_unset_values() {
        let mut config = Config::default();
        config.connection.host = Some("from-file".into());
        config.apply_args(&Args::default());
        assert_eq!(config.connection.host.as_deref(), Some("from-file"));
        assert!(config.connection.strict_host_key_checking);
    }

    #[test]
    fn test_to_ssh_config_auth_selection() {
        let mut config = Config::default();
        config.connection.host = Some("box".into());
        config.connection.user = Some("ci".into());

        let ssh = config.to_ssh_config().unwrap();
        assert!(matches!(ssh.auth, AuthMethod::Agent));
        assert_eq!(ssh.address(), "box:22");

        config.connection.password = Some("pw".into());
        let ssh = config.to_ssh_config().unwrap();
        assert!(matches!(ssh.auth, AuthMethod::Password(_)));

        config.connection.key = Some(PathBuf::from("/keys/id"));
        let ssh = config.to_ssh_config().unwrap();
        match ssh.auth {
            AuthMethod::Key {
                key_path,
                password_fallback,
                ..
            } => {
                assert_eq!(key_path, PathBuf::from("/keys/id"));
                assert_eq!(password_fallback.as_deref(), Some("pw"));
            }
            other => panic!("unexpected auth {:?}", other),
        }
    }

    #[test]
    fn test_to_ssh_config_requires_host_and_user() {
        let mut config = Config::default();
        assert!(matches!(
            config.to_ssh_config(),
            Err(ConfigError::Missing("host"))
        ));
        config.connection.host = Some("box".into());
        assert!(matches!(
            config.to_ssh_config(),
            Err(ConfigError::Missing("user"))
        ));
    }

    #[test]
    fn test_to_run_options() {
        let mut config = Config::default();
        config.runner.wait_timeout_ms = Some(1500);
        config.logging.command_severity = Severity::Warn;

        let opts = config.to_run_options();
        assert_eq!(opts.timeout, Some(Duration::from_millis(1500)));
        assert!(opts.capture_output);
        assert_eq!(opts.log.severity, Severity::Warn);
        assert_eq!(opts.log.tag, "ssh");
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        assert!(json.contains("\"emergency_timeout_ms\""));
        assert!(json.contains("\"strict_host_key_checking\""));
    }
}
