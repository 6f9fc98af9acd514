//! The protocol engine seam.
//!
//! Sessions, channels and servers never talk to the wire themselves. They
//! drive an engine through the traits in this module:
//!
//! - [`Transport`]: one SSH connection (client or server side)
//! - [`ChannelHandle`]: one multiplexed channel on a transport
//! - [`BindHandle`]: one listening endpoint that accepts transports
//!
//! Engine primitives are non-blocking and report a tri-state [`Status`]:
//! `Ok`, `Again` (would block, retry after [`Transport::wait_ready`]) or
//! `Error` (details in `last_error`). Callers turn these into
//! [`crate::Error`] values; engines never raise.
//!
//! Two engines ship with the crate:
//!
//! - [`ssh`]: real SSH over TCP (built on `russh`), client and server
//! - [`loopback`]: an in-process engine that pairs clients and servers
//!   through a registry, for embedding and tests

pub mod loopback;
pub mod options;
pub(crate) mod queue;
pub mod ssh;

use std::io;
use std::ops::BitOr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::callbacks::{CallbackSet, MessageCallback};
use crate::lock::ReentrantLock;
pub use options::{BindOption, OptionValue, SessionOption, ValueKind};

/// Result of a non-blocking engine primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Again,
    Error,
}

/// Result of an authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Success,
    Denied,
    Again,
    Error,
}

/// Result of polling one channel sub-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Nothing was pending.
    Idle,
    /// Events were delivered; carries the data bytes delivered on the polled stream.
    Ready(usize),
    /// The remote side sent EOF and every event before it was delivered.
    Eof,
    Error,
}

/// Statuses that can ask the caller to try again.
pub trait Retryable {
    fn is_again(&self) -> bool;
}

impl Retryable for Status {
    fn is_again(&self) -> bool {
        matches!(self, Status::Again)
    }
}

impl Retryable for AuthStatus {
    fn is_again(&self) -> bool {
        matches!(self, AuthStatus::Again)
    }
}

impl<T> Retryable for std::result::Result<T, Status> {
    fn is_again(&self) -> bool {
        matches!(self, Err(Status::Again))
    }
}

/// Channel sub-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// What a transport is waiting for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub read: bool,
    pub write: bool,
}

impl Readiness {
    pub const NONE: Readiness = Readiness {
        read: false,
        write: false,
    };
    pub const READ: Readiness = Readiness {
        read: true,
        write: false,
    };
}

/// Authentication methods a server accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AuthMethods(u8);

impl AuthMethods {
    pub const NONE: AuthMethods = AuthMethods(0b0001);
    pub const PASSWORD: AuthMethods = AuthMethods(0b0010);
    pub const PUBLIC_KEY: AuthMethods = AuthMethods(0b0100);
    pub const KEYBOARD_INTERACTIVE: AuthMethods = AuthMethods(0b1000);

    pub const fn empty() -> Self {
        AuthMethods(0)
    }

    pub const fn contains(self, other: AuthMethods) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for AuthMethods {
    fn default() -> Self {
        AuthMethods::PASSWORD | AuthMethods::PUBLIC_KEY
    }
}

impl BitOr for AuthMethods {
    type Output = AuthMethods;

    fn bitor(self, rhs: AuthMethods) -> AuthMethods {
        AuthMethods(self.0 | rhs.0)
    }
}

/// Terminal parameters for a PTY request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
    pub pix_width: u32,
    pub pix_height: u32,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "xterm".to_string(),
            cols: 80,
            rows: 24,
            pix_width: 0,
            pix_height: 0,
        }
    }
}

/// One SSH connection as seen by the engine.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Blocking engines make `Session::wait` a no-op.
    fn is_blocking(&self) -> bool {
        false
    }

    fn is_connected(&self) -> bool;

    fn is_authenticated(&self) -> bool;

    async fn connect(&self) -> Status;

    async fn auth_password(&self, user: &str, password: &str) -> AuthStatus;

    async fn auth_publickey_file(&self, user: &str, key_path: &Path) -> AuthStatus;

    async fn auth_agent(&self, user: &str) -> AuthStatus;

    async fn disconnect(&self);

    /// Release engine resources. Further calls fail.
    fn free(&self);

    /// Interest to wait for, given what the engine has buffered.
    fn pending(&self) -> Readiness {
        Readiness::READ
    }

    /// Suspend until the engine has activity or `timeout` elapses.
    ///
    /// Errors when the underlying connection is gone.
    async fn wait_ready(&self, interest: Readiness, timeout: Duration) -> io::Result<Readiness>;

    /// Deliver everything buffered to callbacks: server messages and channel
    /// events. `Again` when nothing was pending.
    async fn process_events(&self) -> Status;

    /// Allocate an unopened channel. `None` when the engine cannot.
    fn new_channel(&self) -> Option<Arc<dyn ChannelHandle>>;

    fn last_error(&self) -> String;

    fn set_option(&self, option: SessionOption, value: &OptionValue) -> Status;

    fn get_option(&self, option: SessionOption) -> Option<String>;

    /// The port has its own getter; it is not readable through `get_option`.
    fn port(&self) -> Option<u16>;

    fn set_auth_methods(&self, _methods: AuthMethods) -> Status {
        Status::Error
    }

    fn set_message_callback(&self, _callback: Option<MessageCallback>) -> Status {
        Status::Error
    }
}

/// One channel on a transport.
///
/// `close` and `poll` deliver buffered events to the installed callbacks
/// before returning, so callbacks may run (and re-enter channel operations)
/// from inside either call.
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    fn id(&self) -> u32;

    fn is_open(&self) -> bool;

    /// True once the remote EOF has been delivered.
    fn is_eof(&self) -> bool;

    async fn open_session(&self) -> Status;

    async fn open_forward(
        &self,
        host: &str,
        port: u16,
        originator: &str,
        originator_port: u16,
    ) -> Status;

    async fn request_env(&self, name: &str, value: &str) -> Status;

    async fn request_exec(&self, command: &str) -> Status;

    async fn request_pty(&self, request: &PtyRequest) -> Status;

    async fn request_shell(&self) -> Status;

    /// Write up to `data.len()` bytes; `Err(Again)` when the window is full.
    async fn write(&self, data: &[u8], stream: Stream) -> std::result::Result<usize, Status>;

    /// Suspend until the write window may have room again, or `timeout`.
    async fn writable(&self, timeout: Duration);

    async fn send_eof(&self) -> Status;

    async fn send_exit_status(&self, code: u32) -> Status;

    async fn close(&self) -> Status;

    fn free(&self);

    async fn poll(&self, stream: Stream) -> PollStatus;

    /// Replace the callback set; `None` detaches.
    fn set_callbacks(&self, callbacks: Option<Arc<CallbackSet>>) -> Status;

    fn last_error(&self) -> String;

    /// Held while queued events are delivered to callbacks.
    ///
    /// Closing an owning channel takes this same lock, so a close on one
    /// task and a callback-driven close on another cannot wait on each other.
    fn dispatch_lock(&self) -> &ReentrantLock;
}

/// A listening endpoint.
#[async_trait]
pub trait BindHandle: Send + Sync {
    async fn listen(&self) -> Status;

    fn is_open(&self) -> bool;

    /// Wait for a pending connection. `Ok(false)` on timeout.
    ///
    /// Errors when the handle is closed concurrently.
    async fn wait_incoming(&self, timeout: Duration) -> io::Result<bool>;

    /// Accept the pending connection as a server-side transport.
    async fn accept(&self) -> Option<Arc<dyn Transport>>;

    fn set_option(&self, option: BindOption, value: &OptionValue) -> Status;

    /// Port actually bound, once listening.
    fn bound_port(&self) -> Option<u16>;

    fn last_error(&self) -> String;

    fn close(&self);
}
