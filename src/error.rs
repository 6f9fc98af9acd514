//! Error types and error classification.
//!
//! Every fallible operation in the crate returns [`Result`]. The variants fall
//! into four groups:
//!
//! 1. **Usage errors** ([`Error::InvalidArgument`], [`Error::InvalidState`]):
//!    the caller did something the object's state does not allow, such as
//!    writing to a channel after sending EOF or using a closed session.
//!
//! 2. **Protocol errors** ([`Error::Protocol`], [`Error::Allocation`]): the
//!    protocol engine reported a failure. The message carries the engine's
//!    last error string.
//!
//! 3. **Process failures** ([`Error::ProcessFailed`]): a remote command ran but
//!    exited with a non-zero status. Kept apart from protocol errors so callers
//!    can tell "the command failed" from "the transport failed".
//!
//! 4. **Task and I/O errors** ([`Error::Task`], [`Error::Io`]).
//!
//! The error is `Clone` so a background task's outcome can be handed to more
//! than one waiter.
//!
//! # Retry classification
//!
//! [`is_retryable_error`] decides whether a connection failure is worth
//! retrying. Authentication failures take precedence over connection errors:
//! a message that contains both is never retried, to avoid repeatedly failing
//! with bad credentials.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Errors produced by sessions, channels, processes, forwarders and servers.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// An argument was rejected before anything was attempted.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The object is in a state that does not allow the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The protocol engine reported a failure.
    #[error("{operation} failed: {message}")]
    Protocol {
        operation: &'static str,
        message: String,
    },

    /// The protocol engine could not allocate a resource.
    #[error("failed to allocate {0}")]
    Allocation(&'static str),

    /// A remote command exited with a non-zero (or missing) status.
    #[error("process `{command}` exited with {}", describe_exit(.code))]
    ProcessFailed { command: String, code: Option<i32> },

    /// A background task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(String),

    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "no exit status".to_string(),
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Io(Arc::new(error))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(error: tokio::task::JoinError) -> Self {
        Error::Task(error.to_string())
    }
}

impl Error {
    pub(crate) fn protocol(operation: &'static str, message: impl Into<String>) -> Self {
        Error::Protocol {
            operation,
            message: message.into(),
        }
    }

    /// True for errors caused by the caller rather than the remote side.
    pub fn is_usage(&self) -> bool {
        matches!(self, Error::InvalidArgument(_) | Error::InvalidState(_))
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, Error::Protocol { .. } | Error::Allocation(_))
    }

    /// Exit code of a failed process, if this is a process failure.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::ProcessFailed { code, .. } => *code,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Authentication error patterns that indicate permanent failures.
///
/// These errors will never succeed by retrying and should fail immediately
/// to avoid wasting time and potentially locking out accounts.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "authentication rejected",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
];

/// Connection error patterns that indicate transient failures.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timeout",
    "timed out",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "handshake failed",
    "failed to connect",
    "broken pipe",
    "would block",
];

/// Determines if a connection error is transient and worth retrying.
///
/// 1. Authentication failures are checked first and are never retryable.
/// 2. Known connection errors are retryable.
/// 3. Anything else is retried unless it looks like an SSH protocol error
///    that does not also mention a timeout or connect failure.
pub fn is_retryable_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    if AUTH_ERRORS.iter().any(|pattern| error_lower.contains(pattern)) {
        return false;
    }

    if RETRYABLE_ERRORS
        .iter()
        .any(|pattern| error_lower.contains(pattern))
    {
        return true;
    }

    !error_lower.contains("ssh") || error_lower.contains("timeout") || error_lower.contains("connect")
}

/// I/O errors that signal "try again" rather than failure.
pub(crate) fn is_transient_io(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    )
}

/// I/O errors raised when a descriptor is closed underneath a waiter.
pub(crate) fn is_closed_io(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    mod classification {
        use super::*;

        #[test]
        fn test_auth_errors_not_retryable() {
            assert!(!is_retryable_error("Authentication failed"));
            assert!(!is_retryable_error("Permission denied (publickey,password)"));
            assert!(!is_retryable_error("password authentication rejected"));
            assert!(!is_retryable_error("All authentication methods failed"));
        }

        #[test]
        fn test_connection_errors_retryable() {
            assert!(is_retryable_error("Connection refused"));
            assert!(is_retryable_error("connection reset by peer"));
            assert!(is_retryable_error("Network is unreachable"));
            assert!(is_retryable_error("Resource temporarily unavailable"));
        }

        #[test]
        fn test_auth_takes_priority_over_connection() {
            assert!(!is_retryable_error(
                "Connection timeout during authentication failed"
            ));
        }

        #[test]
        fn test_ssh_protocol_errors_not_retryable() {
            assert!(!is_retryable_error("SSH protocol error"));
            assert!(!is_retryable_error("ssh: unexpected packet"));
        }

        #[test]
        fn test_ssh_errors_with_connect_keywords_retryable() {
            assert!(is_retryable_error("SSH connection timeout"));
            assert!(is_retryable_error("ssh connect error"));
        }

        #[test]
        fn test_unknown_errors_retryable() {
            assert!(is_retryable_error("something odd happened"));
            assert!(is_retryable_error(""));
        }
    }

    mod io_kinds {
        use super::*;

        #[test]
        fn test_transient_kinds() {
            assert!(is_transient_io(&io::Error::from(io::ErrorKind::WouldBlock)));
            assert!(is_transient_io(&io::Error::from(io::ErrorKind::Interrupted)));
            assert!(!is_transient_io(&io::Error::from(io::ErrorKind::BrokenPipe)));
        }

        #[test]
        fn test_closed_kinds() {
            assert!(is_closed_io(&io::Error::from(io::ErrorKind::NotConnected)));
            assert!(!is_closed_io(&io::Error::from(io::ErrorKind::WouldBlock)));
        }
    }

    mod variants {
        use super::*;

        #[test]
        fn test_usage_errors() {
            assert!(Error::InvalidArgument("x".into()).is_usage());
            assert!(Error::InvalidState("x".into()).is_usage());
            assert!(!Error::protocol("connect", "refused").is_usage());
        }

        #[test]
        fn test_protocol_message_embeds_operation() {
            let err = Error::protocol("channel open", "administratively prohibited");
            assert!(err.is_protocol());
            assert_eq!(
                err.to_string(),
                "channel open failed: administratively prohibited"
            );
        }

        #[test]
        fn test_process_failed_display() {
            let err = Error::ProcessFailed {
                command: "false".into(),
                code: Some(7),
            };
            assert_eq!(err.exit_code(), Some(7));
            assert_eq!(err.to_string(), "process `false` exited with code 7");

            let err = Error::ProcessFailed {
                command: "sleep 1".into(),
                code: None,
            };
            assert_eq!(err.to_string(), "process `sleep 1` exited with no exit status");
        }

        #[test]
        fn test_io_error_is_clone() {
            let err: Error = io::Error::new(io::ErrorKind::Other, "boom").into();
            let copy = err.clone();
            assert_eq!(err.to_string(), copy.to_string());
        }
    }
}
