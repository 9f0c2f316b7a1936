//! Client and service configuration.
//!
//! `ClientConfig` describes how to launch a sidecar and how long to wait on
//! it. Values default to sensible constants and may be overridden from the
//! environment:
//!
//! - `SIDECAR_PATH` - sidecar executable (required by `from_env`)
//! - `SIDECAR_ARGS` - whitespace-separated extra arguments
//! - `SIDECAR_TIMEOUT_MS` - default per-request timeout

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Default request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Budget for the `shutdown` request sent by `stop()`.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long `stop()` waits for a natural exit before killing the process.
pub const DEFAULT_EXIT_GRACE: Duration = Duration::from_secs(2);

/// Number of stderr lines retained by the diagnostic collector.
pub const DEFAULT_DIAGNOSTICS_CAPACITY: usize = 1000;

pub const ENV_SIDECAR_PATH: &str = "SIDECAR_PATH";
pub const ENV_SIDECAR_ARGS: &str = "SIDECAR_ARGS";
pub const ENV_SIDECAR_TIMEOUT_MS: &str = "SIDECAR_TIMEOUT_MS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Environment variable {0} is not set")]
    MissingVar(&'static str),

    #[error("Environment variable {var} has invalid value {value:?}: expected milliseconds")]
    InvalidDuration { var: &'static str, value: String },
}

/// How to launch and talk to a sidecar process.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Executable to spawn.
    pub program: PathBuf,
    /// Arguments passed to the executable.
    pub args: Vec<OsString>,
    /// Extra environment variables for the child.
    pub env: Vec<(OsString, OsString)>,
    /// Timeout for `send_request` when the caller passes none.
    pub request_timeout: Duration,
    /// Timeout for the `shutdown` request issued by `stop()`.
    pub shutdown_timeout: Duration,
    /// Wait for a natural exit after `shutdown` before forcing termination.
    pub exit_grace: Duration,
    /// Maximum stderr lines kept in memory.
    pub diagnostics_capacity: usize,
}

impl ClientConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            exit_grace: DEFAULT_EXIT_GRACE,
            diagnostics_capacity: DEFAULT_DIAGNOSTICS_CAPACITY,
        }
    }

    /// Build a config from `SIDECAR_PATH`, `SIDECAR_ARGS` and
    /// `SIDECAR_TIMEOUT_MS`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingVar` if `SIDECAR_PATH` is unset, or
    /// `ConfigError::InvalidDuration` if the timeout is not an integer.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let program = lookup(ENV_SIDECAR_PATH).ok_or(ConfigError::MissingVar(ENV_SIDECAR_PATH))?;
        let mut config = Self::new(program);

        if let Some(args) = lookup(ENV_SIDECAR_ARGS) {
            config.args = args.split_whitespace().map(OsString::from).collect();
        }

        if let Some(raw) = lookup(ENV_SIDECAR_TIMEOUT_MS) {
            let millis = raw
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidDuration {
                    var: ENV_SIDECAR_TIMEOUT_MS,
                    value: raw.clone(),
                })?;
            config.request_timeout = Duration::from_millis(millis);
        }

        Ok(config)
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }

    pub fn with_diagnostics_capacity(mut self, capacity: usize) -> Self {
        self.diagnostics_capacity = capacity;
        self
    }
}

/// Identity reported by the service's `health` method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub version: String,
    pub build: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            build: option_env!("SIDECAR_BUILD").unwrap_or("dev").to_string(),
        }
    }
}
