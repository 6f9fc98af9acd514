//! Log verbosity levels and tracing setup.
//!
//! Sessions and servers carry a numeric verbosity in the classic SSH library
//! style (0 = nothing, 4 = function tracing). [`LogVerbosity`] maps those
//! levels onto `tracing` filters so one knob controls both the protocol
//! engine option and what this crate emits.

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LogVerbosity {
    #[default]
    NoLog = 0,
    Warning = 1,
    Protocol = 2,
    Packet = 3,
    Functions = 4,
}

impl LogVerbosity {
    pub fn level_filter(self) -> LevelFilter {
        match self {
            LogVerbosity::NoLog => LevelFilter::OFF,
            LogVerbosity::Warning => LevelFilter::WARN,
            LogVerbosity::Protocol => LevelFilter::INFO,
            LogVerbosity::Packet => LevelFilter::DEBUG,
            LogVerbosity::Functions => LevelFilter::TRACE,
        }
    }

    pub fn as_int(self) -> i64 {
        self as i64
    }
}

impl TryFrom<i64> for LogVerbosity {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(LogVerbosity::NoLog),
            1 => Ok(LogVerbosity::Warning),
            2 => Ok(LogVerbosity::Protocol),
            3 => Ok(LogVerbosity::Packet),
            4 => Ok(LogVerbosity::Functions),
            other => Err(Error::InvalidArgument(format!(
                "log verbosity must be between 0 and 4, got {other}"
            ))),
        }
    }
}

/// Install a global `fmt` subscriber.
///
/// `RUST_LOG` wins over `default`. Returns false if a subscriber was already
/// installed, which is not an error for a library.
pub fn init_tracing(default: LogVerbosity) -> bool {
    let filter = EnvFilter::builder()
        .with_default_directive(default.level_filter().into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}

/// Log a teardown failure from a spawned task instead of the caller's stack.
///
/// Used on `allow_fail` paths and from `Drop`, where raising is not possible.
/// Without a runtime the warning is emitted inline.
pub(crate) fn defer_warn(context: &'static str, error: impl std::fmt::Display) {
    let message = error.to_string();
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                warn!("{}: {}", context, message);
            });
        }
        Err(_) => warn!("{}: {}", context, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_ordered() {
        assert!(LogVerbosity::NoLog < LogVerbosity::Warning);
        assert!(LogVerbosity::Packet < LogVerbosity::Functions);
        assert_eq!(LogVerbosity::Protocol.as_int(), 2);
    }

    #[test]
    fn test_level_filter_mapping() {
        assert_eq!(LogVerbosity::NoLog.level_filter(), LevelFilter::OFF);
        assert_eq!(LogVerbosity::Warning.level_filter(), LevelFilter::WARN);
        assert_eq!(LogVerbosity::Functions.level_filter(), LevelFilter::TRACE);
    }

    #[test]
    fn test_try_from_int() {
        assert_eq!(LogVerbosity::try_from(3).unwrap(), LogVerbosity::Packet);
        assert!(LogVerbosity::try_from(9).unwrap_err().is_usage());
        assert!(LogVerbosity::try_from(-1).is_err());
    }

    #[test]
    fn test_serde_names() {
        let level: LogVerbosity = serde_json::from_str("\"no_log\"").unwrap();
        assert_eq!(level, LogVerbosity::NoLog);
        assert_eq!(
            serde_json::to_string(&LogVerbosity::Packet).unwrap(),
            "\"packet\""
        );
    }

    #[tokio::test]
    async fn test_defer_warn_inside_runtime() {
        defer_warn("closing channel", "already closed");
        tokio::task::yield_now().await;
    }
}
