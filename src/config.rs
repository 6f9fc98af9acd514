//! Configuration resolution.
//!
//! Values are resolved with a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SSHPLEX_CONNECT_TIMEOUT` | 30s | Connection timeout in seconds |
//! | `SSHPLEX_WAIT_TIMEOUT_MS` | 100ms | Upper bound of one `Session::wait` suspension |
//! | `SSHPLEX_CLOSE_TIMEOUT_MS` | 2000ms | How long a channel close waits for the peer's close |
//! | `SSHPLEX_MAX_RETRIES` | 3 | Maximum connect retry attempts |
//! | `SSHPLEX_RETRY_DELAY_MS` | 1000ms | Initial connect retry delay in milliseconds |
//! | `SSHPLEX_COMPRESSION` | true | Enable zlib compression |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::logging::LogVerbosity;

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub(crate) const DEFAULT_WAIT_TIMEOUT_MS: u64 = 100;
pub(crate) const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 2000;
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 3;
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Maximum retry delay cap in seconds (10 seconds)
pub(crate) const MAX_RETRY_DELAY_SECS: u64 = 10;

/// Maximum retry delay cap as Duration
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(MAX_RETRY_DELAY_SECS);

/// Size of one read from a forwarded local socket.
pub(crate) const FORWARD_CHUNK_SIZE: usize = 8192;

pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "SSHPLEX_CONNECT_TIMEOUT";
pub(crate) const WAIT_TIMEOUT_MS_ENV_VAR: &str = "SSHPLEX_WAIT_TIMEOUT_MS";
pub(crate) const CLOSE_TIMEOUT_MS_ENV_VAR: &str = "SSHPLEX_CLOSE_TIMEOUT_MS";
pub(crate) const MAX_RETRIES_ENV_VAR: &str = "SSHPLEX_MAX_RETRIES";
pub(crate) const RETRY_DELAY_MS_ENV_VAR: &str = "SSHPLEX_RETRY_DELAY_MS";
pub(crate) const COMPRESSION_ENV_VAR: &str = "SSHPLEX_COMPRESSION";

/// Resolve a value with priority: parameter -> env var -> default.
///
/// An environment value that does not parse is ignored.
fn resolve<T: FromStr>(param: Option<T>, env_var: &str, default: T) -> T {
    if let Some(value) = param {
        return value;
    }

    if let Ok(raw) = env::var(env_var)
        && let Ok(value) = raw.trim().parse::<T>()
    {
        return value;
    }

    default
}

pub(crate) fn resolve_connect_timeout(timeout_param: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        timeout_param,
        CONNECT_TIMEOUT_ENV_VAR,
        DEFAULT_CONNECT_TIMEOUT_SECS,
    ))
}

/// The wait timeout is never zero; a zero value falls back to the default.
pub(crate) fn resolve_wait_timeout(timeout_param: Option<u64>) -> Duration {
    match resolve(timeout_param, WAIT_TIMEOUT_MS_ENV_VAR, DEFAULT_WAIT_TIMEOUT_MS) {
        0 => Duration::from_millis(DEFAULT_WAIT_TIMEOUT_MS),
        ms => Duration::from_millis(ms),
    }
}

pub(crate) fn resolve_close_timeout(timeout_param: Option<u64>) -> Duration {
    Duration::from_millis(resolve(
        timeout_param,
        CLOSE_TIMEOUT_MS_ENV_VAR,
        DEFAULT_CLOSE_TIMEOUT_MS,
    ))
}

pub(crate) fn resolve_max_retries(max_retries_param: Option<u32>) -> u32 {
    resolve(max_retries_param, MAX_RETRIES_ENV_VAR, DEFAULT_MAX_RETRIES)
}

pub(crate) fn resolve_retry_delay(retry_delay_param: Option<u64>) -> Duration {
    Duration::from_millis(resolve(
        retry_delay_param,
        RETRY_DELAY_MS_ENV_VAR,
        DEFAULT_RETRY_DELAY_MS,
    ))
}

/// Resolve the compression setting with priority: parameter -> env var -> default (true)
pub(crate) fn resolve_compression(compress_param: Option<bool>) -> bool {
    if let Some(compress) = compress_param {
        return compress;
    }

    if let Ok(env_compress) = env::var(COMPRESSION_ENV_VAR) {
        return env_compress.eq_ignore_ascii_case("true") || env_compress == "1";
    }

    true
}

/// Parse an address string into host and port components.
///
/// Supports `host:port` and bare `host` (default port 22). Uses `rsplit_once`
/// so bracketed IPv6 addresses such as `[::1]:22` split on the last colon.
pub fn parse_address(address: &str) -> Result<(String, u16)> {
    if let Some((host, port_str)) = address.rsplit_once(':') {
        let port = port_str
            .parse::<u16>()
            .map_err(|e| Error::InvalidArgument(format!("invalid port number: {e}")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok((host.to_string(), port))
    } else {
        Ok((address.to_string(), DEFAULT_PORT))
    }
}

/// Client connection settings.
///
/// Unset optional fields are resolved through the environment when the
/// connection is made. Deserializable so it can live in an application's own
/// configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    pub password: Option<String>,
    pub key_path: Option<PathBuf>,
    pub connect_timeout_secs: Option<u64>,
    pub wait_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub compression: Option<bool>,
    pub log_verbosity: LogVerbosity,
}

impl ClientConfig {
    /// Build a config from a `host[:port]` address and a user name.
    pub fn new(address: &str, user: impl Into<String>) -> Result<Self> {
        let (host, port) = parse_address(address)?;
        Ok(Self {
            host,
            port: Some(port),
            user: user.into(),
            ..Default::default()
        })
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port())
    }

    pub fn connect_timeout(&self) -> Duration {
        resolve_connect_timeout(self.connect_timeout_secs)
    }

    pub fn wait_timeout(&self) -> Duration {
        resolve_wait_timeout(self.wait_timeout_ms)
    }

    pub fn max_retries(&self) -> u32 {
        resolve_max_retries(self.max_retries)
    }

    pub fn retry_delay(&self) -> Duration {
        resolve_retry_delay(self.retry_delay_ms)
    }

    pub fn compression(&self) -> bool {
        resolve_compression(self.compression)
    }
}
