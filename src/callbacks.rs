//! Channel callbacks and server message callbacks.
//!
//! A [`CallbackSet`] maps channel event kinds to async handlers. Handlers are
//! closures: whatever they capture is the "user context". Engines queue
//! [`ChannelEvent`]s and hand them to [`CallbackSet::dispatch`] when the
//! channel is polled, closed, or the session processes events.
//!
//! Request events (env, exec, pty, shell) expect an accept/reject answer. A
//! missing handler rejects. Handlers that answer requests should return
//! promptly and push bulk work onto another task: the remote side waits for
//! the answer.
//!
//! Handlers that need the channel should capture a `Weak` reference to it;
//! the channel owns its callback set.
//!
//! ```ignore
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = seen.clone();
//! let callbacks = CallbackSet::new()
//!     .on_data(move |data, _stream| {
//!         let sink = sink.clone();
//!         async move { sink.lock().extend_from_slice(&data) }
//!     })
//!     .on_exit_status(|code| async move { tracing::info!("exit {code}") });
//! channel.set_callbacks(Some(callbacks))?;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::channel::BorrowedChannel;
use crate::transport::{PtyRequest, Stream};

/// An event delivered on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Data { data: Vec<u8>, stream: Stream },
    Eof,
    Close,
    ExitStatus(i32),
    EnvRequest { name: String, value: String },
    ExecRequest(String),
    PtyRequest(PtyRequest),
    ShellRequest,
    /// The peer consumed data; carries the window space now available.
    WriteUnblocked(usize),
}

impl ChannelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChannelEvent::Data { .. } => EventKind::Data,
            ChannelEvent::Eof => EventKind::Eof,
            ChannelEvent::Close => EventKind::Close,
            ChannelEvent::ExitStatus(_) => EventKind::ExitStatus,
            ChannelEvent::EnvRequest { .. } => EventKind::EnvRequest,
            ChannelEvent::ExecRequest(_) => EventKind::ExecRequest,
            ChannelEvent::PtyRequest(_) => EventKind::PtyRequest,
            ChannelEvent::ShellRequest => EventKind::ShellRequest,
            ChannelEvent::WriteUnblocked(_) => EventKind::WriteUnblocked,
        }
    }

    /// Requests need an accept/reject answer sent back to the peer.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            ChannelEvent::EnvRequest { .. }
                | ChannelEvent::ExecRequest(_)
                | ChannelEvent::PtyRequest(_)
                | ChannelEvent::ShellRequest
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Data,
    Eof,
    Close,
    ExitStatus,
    EnvRequest,
    ExecRequest,
    PtyRequest,
    ShellRequest,
    WriteUnblocked,
}

type Handler<A, R> = Box<dyn Fn(A) -> BoxFuture<'static, R> + Send + Sync>;

/// Event handlers for one channel.
#[derive(Default)]
pub struct CallbackSet {
    data: Option<Handler<(Vec<u8>, Stream), ()>>,
    eof: Option<Handler<(), ()>>,
    close: Option<Handler<(), ()>>,
    exit_status: Option<Handler<i32, ()>>,
    env_request: Option<Handler<(String, String), bool>>,
    exec_request: Option<Handler<String, bool>>,
    pty_request: Option<Handler<PtyRequest, bool>>,
    shell_request: Option<Handler<(), bool>>,
    write_unblocked: Option<Handler<usize, ()>>,
}

impl CallbackSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_data<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Vec<u8>, Stream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.data = Some(Box::new(move |(data, stream)| handler(data, stream).boxed()));
        self
    }

    pub fn on_eof<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.eof = Some(Box::new(move |()| handler().boxed()));
        self
    }

    pub fn on_close<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.close = Some(Box::new(move |()| handler().boxed()));
        self
    }

    pub fn on_exit_status<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(i32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.exit_status = Some(Box::new(move |code| handler(code).boxed()));
        self
    }

    pub fn on_env_request<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.env_request = Some(Box::new(move |(name, value)| handler(name, value).boxed()));
        self
    }

    pub fn on_exec_request<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.exec_request = Some(Box::new(move |command| handler(command).boxed()));
        self
    }

    pub fn on_pty_request<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(PtyRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.pty_request = Some(Box::new(move |request| handler(request).boxed()));
        self
    }

    pub fn on_shell_request<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.shell_request = Some(Box::new(move |()| handler().boxed()));
        self
    }

    pub fn on_write_unblocked<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.write_unblocked = Some(Box::new(move |window| handler(window).boxed()));
        self
    }

    pub fn handles(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Data => self.data.is_some(),
            EventKind::Eof => self.eof.is_some(),
            EventKind::Close => self.close.is_some(),
            EventKind::ExitStatus => self.exit_status.is_some(),
            EventKind::EnvRequest => self.env_request.is_some(),
            EventKind::ExecRequest => self.exec_request.is_some(),
            EventKind::PtyRequest => self.pty_request.is_some(),
            EventKind::ShellRequest => self.shell_request.is_some(),
            EventKind::WriteUnblocked => self.write_unblocked.is_some(),
        }
    }

    /// Run the handler for `event`.
    ///
    /// Returns the answer for request events (false when unhandled) and
    /// `None` for notifications.
    pub async fn dispatch(&self, event: ChannelEvent) -> Option<bool> {
        match event {
            ChannelEvent::Data { data, stream } => {
                if let Some(handler) = &self.data {
                    handler((data, stream)).await;
                }
                None
            }
            ChannelEvent::Eof => {
                if let Some(handler) = &self.eof {
                    handler(()).await;
                }
                None
            }
            ChannelEvent::Close => {
                if let Some(handler) = &self.close {
                    handler(()).await;
                }
                None
            }
            ChannelEvent::ExitStatus(code) => {
                if let Some(handler) = &self.exit_status {
                    handler(code).await;
                }
                None
            }
            ChannelEvent::WriteUnblocked(window) => {
                if let Some(handler) = &self.write_unblocked {
                    handler(window).await;
                }
                None
            }
            ChannelEvent::EnvRequest { name, value } => Some(match &self.env_request {
                Some(handler) => handler((name, value)).await,
                None => false,
            }),
            ChannelEvent::ExecRequest(command) => Some(match &self.exec_request {
                Some(handler) => handler(command).await,
                None => false,
            }),
            ChannelEvent::PtyRequest(request) => Some(match &self.pty_request {
                Some(handler) => handler(request).await,
                None => false,
            }),
            ChannelEvent::ShellRequest => Some(match &self.shell_request {
                Some(handler) => handler(()).await,
                None => false,
            }),
        }
    }
}

impl fmt::Debug for CallbackSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<EventKind> = [
            EventKind::Data,
            EventKind::Eof,
            EventKind::Close,
            EventKind::ExitStatus,
            EventKind::EnvRequest,
            EventKind::ExecRequest,
            EventKind::PtyRequest,
            EventKind::ShellRequest,
            EventKind::WriteUnblocked,
        ]
        .into_iter()
        .filter(|kind| self.handles(*kind))
        .collect();
        f.debug_struct("CallbackSet").field("handles", &kinds).finish()
    }
}

/// How a client tried to authenticate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthAttempt {
    None,
    Password(String),
    PublicKey { algorithm: String, fingerprint: String },
}

/// Kind of channel a client asked to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOpenKind {
    Session,
    DirectTcpip {
        host: String,
        port: u16,
        originator: String,
        originator_port: u16,
    },
}

/// A session-level request delivered to a server's message callback.
pub enum Message {
    Auth { user: String, attempt: AuthAttempt },
    /// The channel is non-owning: the server session owns it.
    ChannelOpen {
        kind: ChannelOpenKind,
        channel: BorrowedChannel,
    },
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Auth { user, attempt } => {
                let method = match attempt {
                    AuthAttempt::None => "none",
                    AuthAttempt::Password(_) => "password",
                    AuthAttempt::PublicKey { .. } => "publickey",
                };
                f.debug_struct("Auth")
                    .field("user", user)
                    .field("method", &method)
                    .finish()
            }
            Message::ChannelOpen { kind, channel } => f
                .debug_struct("ChannelOpen")
                .field("kind", kind)
                .field("channel", &channel.id())
                .finish(),
        }
    }
}

/// Answers session-level requests. `true` accepts, `false` rejects.
pub type MessageCallback = Arc<dyn Fn(Message) -> BoxFuture<'static, bool> + Send + Sync>;

pub fn message_callback<F, Fut>(handler: F) -> MessageCallback
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    Arc::new(move |message| handler(message).boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn test_data_handler_receives_stream() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callbacks = CallbackSet::new().on_data(move |data, stream| {
            let sink = sink.clone();
            async move { sink.lock().push((data, stream)) }
        });

        let answer = callbacks
            .dispatch(ChannelEvent::Data {
                data: b"out".to_vec(),
                stream: Stream::Stderr,
            })
            .await;
        assert_eq!(answer, None);
        assert_eq!(seen.lock().as_slice(), &[(b"out".to_vec(), Stream::Stderr)]);
    }

    #[tokio::test]
    async fn test_unhandled_request_is_rejected() {
        let callbacks = CallbackSet::new();
        let answer = callbacks
            .dispatch(ChannelEvent::ExecRequest("ls".into()))
            .await;
        assert_eq!(answer, Some(false));
        assert_eq!(callbacks.dispatch(ChannelEvent::Eof).await, None);
    }

    #[tokio::test]
    async fn test_request_handler_answer() {
        let callbacks = CallbackSet::new()
            .on_env_request(|name, _value| async move { name.starts_with("LC_") });
        let accepted = callbacks
            .dispatch(ChannelEvent::EnvRequest {
                name: "LC_ALL".into(),
                value: "C".into(),
            })
            .await;
        let rejected = callbacks
            .dispatch(ChannelEvent::EnvRequest {
                name: "PATH".into(),
                value: "/tmp".into(),
            })
            .await;
        assert_eq!(accepted, Some(true));
        assert_eq!(rejected, Some(false));
    }

    #[test]
    fn test_handles_reports_installed_kinds() {
        let callbacks = CallbackSet::new()
            .on_eof(|| async {})
            .on_exit_status(|_| async {});
        assert!(callbacks.handles(EventKind::Eof));
        assert!(callbacks.handles(EventKind::ExitStatus));
        assert!(!callbacks.handles(EventKind::Data));
        assert!(format!("{callbacks:?}").contains("ExitStatus"));
    }

    #[test]
    fn test_request_classification() {
        assert!(ChannelEvent::ShellRequest.is_request());
        assert!(!ChannelEvent::Close.is_request());
        assert_eq!(ChannelEvent::WriteUnblocked(1).kind(), EventKind::WriteUnblocked);
    }
}
