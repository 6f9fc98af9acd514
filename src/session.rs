//! SSH sessions.
//!
//! A [`Session`] is one SSH connection. Clients create one with
//! [`Session::ssh`] (or any engine through [`Session::new`]), set host, port
//! and user, then [`connect`](Session::connect) and authenticate. Servers
//! receive already-accepted sessions from [`crate::Server::listen`].
//!
//! `Session` is a cheap handle: clones share the connection. Channels hold a
//! clone too, so a session stays alive while any of its channels does.
//!
//! # Non-blocking protocol
//!
//! Engine primitives may answer "try again". [`Session::retry`] is the one
//! loop every operation goes through: call, and on `Again` suspend on
//! [`Session::wait`] until the transport has activity, then call again.
//!
//! # Channel tracking
//!
//! Every owning [`Channel`](crate::Channel) registers here on creation and
//! unregisters when it closes. [`Session::disconnect`] closes whatever is
//! still registered, newest first, before tearing the connection down.

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::channel::ChannelInner;
use crate::config;
use crate::error::{Error, Result};
use crate::logging::LogVerbosity;
use crate::transport::loopback::LoopbackTransport;
use crate::transport::options::{check_kind, session_option};
use crate::transport::ssh::RusshTransport;
use crate::transport::{AuthStatus, OptionValue, Retryable, SessionOption, Status, Transport};
use crate::types::SessionInfo;

struct SessionInner {
    id: Uuid,
    /// `None` once the session has been closed.
    transport: RwLock<Option<Arc<dyn Transport>>>,
    /// Insertion order; disconnect walks it backwards.
    channels: Mutex<Vec<Weak<ChannelInner>>>,
    log_verbosity: Mutex<LogVerbosity>,
    wait_timeout: Mutex<Duration>,
    created_at: DateTime<Utc>,
}

/// One SSH connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Wrap an engine transport.
    pub fn new(transport: Arc<dyn Transport>) -> Session {
        Session {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                transport: RwLock::new(Some(transport)),
                channels: Mutex::new(Vec::new()),
                log_verbosity: Mutex::new(LogVerbosity::default()),
                wait_timeout: Mutex::new(config::resolve_wait_timeout(None)),
                created_at: Utc::now(),
            }),
        }
    }

    /// A client session over SSH/TCP.
    pub fn ssh() -> Session {
        Session::new(Arc::new(RusshTransport::new()))
    }

    /// A client session over the in-process engine.
    pub fn loopback() -> Session {
        Session::new(Arc::new(LoopbackTransport::client()))
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// The engine transport; fails once the session is closed.
    pub(crate) fn transport(&self) -> Result<Arc<dyn Transport>> {
        self.inner
            .transport
            .read()
            .clone()
            .ok_or_else(|| Error::InvalidState("session is closed".to_string()))
    }

    fn transport_opt(&self) -> Option<Arc<dyn Transport>> {
        self.inner.transport.read().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.transport.read().is_none()
    }

    pub fn is_connected(&self) -> bool {
        self.transport_opt().is_some_and(|t| t.is_connected())
    }

    pub fn is_authenticated(&self) -> bool {
        self.transport_opt().is_some_and(|t| t.is_authenticated())
    }

    /// Upper bound for one [`Session::wait`].
    pub fn set_wait_timeout(&self, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(Error::InvalidArgument(
                "wait timeout must be positive".to_string(),
            ));
        }
        *self.inner.wait_timeout.lock() = timeout;
        Ok(())
    }

    pub fn wait_timeout(&self) -> Duration {
        *self.inner.wait_timeout.lock()
    }

    /// Open the connection. A no-op when already connected.
    pub async fn connect(&self) -> Result<()> {
        let transport = self.transport()?;
        if transport.is_connected() {
            return Ok(());
        }
        let status = self.retry(|| transport.connect()).await?;
        if status != Status::Ok {
            return Err(Error::protocol("connect", transport.last_error()));
        }
        info!(
            "Session {} connected to {}:{}",
            self.inner.id,
            self.host().unwrap_or_default(),
            transport.port().unwrap_or(config::DEFAULT_PORT)
        );
        Ok(())
    }

    fn auth_user(&self) -> Result<String> {
        self.user()
            .ok_or_else(|| Error::InvalidState("user must be set before authenticating".to_string()))
    }

    /// `Success` or `Denied`; engine failures are errors.
    pub async fn userauth_password(&self, password: &str) -> Result<AuthStatus> {
        let transport = self.transport()?;
        let user = self.auth_user()?;
        let status = self
            .retry(|| transport.auth_password(&user, password))
            .await?;
        auth_outcome(status, "userauth_password", &transport)
    }

    pub async fn userauth_publickey_file(&self, key_path: &Path) -> Result<AuthStatus> {
        let transport = self.transport()?;
        let user = self.auth_user()?;
        let status = self
            .retry(|| transport.auth_publickey_file(&user, key_path))
            .await?;
        auth_outcome(status, "userauth_publickey", &transport)
    }

    pub async fn userauth_agent(&self) -> Result<AuthStatus> {
        let transport = self.transport()?;
        let user = self.auth_user()?;
        let status = self.retry(|| transport.auth_agent(&user)).await?;
        auth_outcome(status, "userauth_agent", &transport)
    }

    /// Close tracked channels newest first, then disconnect.
    ///
    /// Channel close failures are logged, not returned. A no-op when not
    /// connected.
    pub async fn disconnect(&self) -> Result<()> {
        let Some(transport) = self.transport_opt() else {
            return Ok(());
        };
        if !transport.is_connected() {
            return Ok(());
        }

        // Snapshot: closing a channel unregisters it.
        let snapshot: Vec<Arc<ChannelInner>> = self
            .inner
            .channels
            .lock()
            .iter()
            .rev()
            .filter_map(Weak::upgrade)
            .collect();
        if !snapshot.is_empty() {
            debug!(
                "Session {}: closing {} channels before disconnect",
                self.inner.id,
                snapshot.len()
            );
        }
        for channel in snapshot {
            channel.close(true).await?;
        }
        self.inner.channels.lock().clear();

        transport.disconnect().await;
        info!("Session {} disconnected", self.inner.id);
        Ok(())
    }

    /// Disconnect and release the engine. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.disconnect().await?;
        let released = self.inner.transport.write().take();
        if let Some(transport) = released {
            transport.free();
        }
        Ok(())
    }

    /// Suspend until the transport has activity, bounded by the wait timeout.
    ///
    /// Blocking engines return at once.
    pub async fn wait(&self) -> Result<()> {
        let transport = self.transport()?;
        if transport.is_blocking() {
            return Ok(());
        }
        let interest = transport.pending();
        let timeout = self.wait_timeout();
        transport.wait_ready(interest, timeout).await?;
        Ok(())
    }

    /// Repeat `op` while it answers `Again`, waiting in between.
    ///
    /// An I/O failure while waiting ends the loop and hands back the last
    /// status for the caller to classify; any other wait error propagates.
    pub async fn retry<S, F, Fut>(&self, mut op: F) -> Result<S>
    where
        S: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = S>,
    {
        loop {
            let status = op().await;
            if !status.is_again() {
                return Ok(status);
            }
            match self.wait().await {
                Ok(()) => {}
                Err(Error::Io(e)) => {
                    trace!("Session {}: wait failed: {}", self.inner.id, e);
                    return Ok(status);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Deliver buffered server messages and channel events.
    ///
    /// `Ok(true)` when anything was delivered.
    pub async fn process_events(&self) -> Result<bool> {
        let transport = self.transport()?;
        match transport.process_events().await {
            Status::Ok => Ok(true),
            Status::Again => Ok(false),
            Status::Error => Err(Error::protocol("process_events", transport.last_error())),
        }
    }

    /// Process events until the peer disconnects or the session is closed.
    ///
    /// This is the body of a typical server session handler.
    pub async fn run_until_disconnected(&self) -> Result<()> {
        loop {
            let Some(transport) = self.transport_opt() else {
                return Ok(());
            };
            match transport.process_events().await {
                Status::Ok => continue,
                Status::Again => {}
                Status::Error if !transport.is_connected() => return Ok(()),
                Status::Error => {
                    return Err(Error::protocol("process_events", transport.last_error()));
                }
            }
            match self.wait().await {
                Ok(()) => {}
                Err(Error::Io(_)) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) fn track(&self, channel: &Arc<ChannelInner>) {
        self.inner.channels.lock().push(Arc::downgrade(channel));
    }

    /// Forget a channel. Absent channels are tolerated.
    pub(crate) fn untrack(&self, channel: &Arc<ChannelInner>) {
        let target = Arc::downgrade(channel);
        self.inner.channels.lock().retain(|tracked| {
            !tracked.ptr_eq(&target) && tracked.strong_count() > 0
        });
    }

    /// Channels still registered and open.
    pub fn open_channels(&self) -> usize {
        self.inner
            .channels
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|channel| channel.is_open())
            .count()
    }

    /// Channels registered, open or not yet opened.
    pub fn tracked_channels(&self) -> usize {
        self.inner
            .channels
            .lock()
            .iter()
            .filter(|channel| channel.strong_count() > 0)
            .count()
    }

    pub fn host(&self) -> Option<String> {
        self.transport_opt()?.get_option(SessionOption::Host)
    }

    pub fn set_host(&self, host: &str) -> Result<()> {
        self.set_property("host", host)
    }

    pub fn port(&self) -> Option<u16> {
        self.transport_opt()?.port()
    }

    pub fn set_port(&self, port: u16) -> Result<()> {
        self.set_property("port", port)
    }

    pub fn user(&self) -> Option<String> {
        self.transport_opt()?.get_option(SessionOption::User)
    }

    pub fn set_user(&self, user: &str) -> Result<()> {
        self.set_property("user", user)
    }

    /// Cached locally; the engine cannot report it back.
    pub fn log_verbosity(&self) -> LogVerbosity {
        *self.inner.log_verbosity.lock()
    }

    pub fn set_log_verbosity(&self, verbosity: LogVerbosity) -> Result<()> {
        self.set_property("log_verbosity", verbosity.as_int())
    }

    /// Read a property by name.
    ///
    /// The port is read through its dedicated getter and the log verbosity
    /// from the local cache; everything else comes from the engine.
    pub fn get_property(&self, name: &str) -> Result<Option<String>> {
        let spec = session_option(name)?;
        let transport = self.transport()?;
        Ok(match spec.option {
            SessionOption::Port => transport.port().map(|port| port.to_string()),
            SessionOption::LogVerbosity => Some(self.log_verbosity().as_int().to_string()),
            other => transport.get_option(other),
        })
    }

    /// Set a property by name. The value's kind must match the option.
    pub fn set_property(&self, name: &str, value: impl Into<OptionValue>) -> Result<()> {
        let spec = session_option(name)?;
        let value = value.into();
        check_kind(spec, &value)?;

        let verbosity = match spec.option {
            SessionOption::LogVerbosity => {
                let level = value.as_int().ok_or_else(|| {
                    Error::InvalidArgument("log_verbosity takes an integer".to_string())
                })?;
                Some(LogVerbosity::try_from(level)?)
            }
            _ => None,
        };

        let transport = self.transport()?;
        if transport.set_option(spec.option, &value) != Status::Ok {
            return Err(Error::protocol("set_property", transport.last_error()));
        }
        if let Some(verbosity) = verbosity {
            *self.inner.log_verbosity.lock() = verbosity;
        }
        debug!("Session {}: set {} = {:?}", self.inner.id, name, value);
        Ok(())
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.inner.id.to_string(),
            host: self.host(),
            port: self.port(),
            user: self.user(),
            connected: self.is_connected(),
            authenticated: self.is_authenticated(),
            open_channels: self.open_channels(),
            created_at: self.inner.created_at.to_rfc3339(),
        }
    }
}

fn auth_outcome(
    status: AuthStatus,
    operation: &'static str,
    transport: &Arc<dyn Transport>,
) -> Result<AuthStatus> {
    match status {
        AuthStatus::Success | AuthStatus::Denied => Ok(status),
        AuthStatus::Again | AuthStatus::Error => {
            Err(Error::protocol(operation, transport.last_error()))
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("connected", &self.is_connected())
            .field("channels", &self.tracked_channels())
            .finish()
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let Some(transport) = self.transport.get_mut().take() else {
            return;
        };
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if transport.is_connected() {
                        transport.disconnect().await;
                    }
                    transport.free();
                    trace!("Session {} released", id);
                });
            }
            Err(_) => {
                warn!("Session {} dropped outside a runtime; freeing without disconnect", id);
                transport.free();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod properties {
        use super::*;

        #[test]
        fn test_host_user_round_trip() {
            let session = Session::loopback();
            session.set_host("example.internal").unwrap();
            session.set_user("ci").unwrap();
            assert_eq!(session.host().as_deref(), Some("example.internal"));
            assert_eq!(session.user().as_deref(), Some("ci"));
            assert_eq!(
                session.get_property("host").unwrap().as_deref(),
                Some("example.internal")
            );
        }

        #[test]
        fn test_port_uses_dedicated_getter() {
            let session = Session::loopback();
            assert_eq!(session.port(), None);
            session.set_port(2222).unwrap();
            assert_eq!(session.port(), Some(2222));
            assert_eq!(session.get_property("port").unwrap().as_deref(), Some("2222"));
        }

        #[test]
        fn test_log_verbosity_is_cached() {
            let session = Session::loopback();
            assert_eq!(session.log_verbosity(), LogVerbosity::NoLog);
            session.set_log_verbosity(LogVerbosity::Packet).unwrap();
            assert_eq!(session.log_verbosity(), LogVerbosity::Packet);
            assert_eq!(
                session.get_property("log_verbosity").unwrap().as_deref(),
                Some("3")
            );
        }

        #[test]
        fn test_out_of_range_verbosity_rejected() {
            let session = Session::loopback();
            let err = session.set_property("log_verbosity", 9i64).unwrap_err();
            assert!(err.is_usage());
            assert_eq!(session.log_verbosity(), LogVerbosity::NoLog);
        }

        #[test]
        fn test_unknown_property_rejected() {
            let session = Session::loopback();
            assert!(session.set_property("ciphers", "aes").unwrap_err().is_usage());
            assert!(session.get_property("ciphers").unwrap_err().is_usage());
        }

        #[test]
        fn test_wrong_kind_rejected() {
            let session = Session::loopback();
            assert!(session.set_property("port", "22").unwrap_err().is_usage());
            assert!(session.set_property("user", 5i64).unwrap_err().is_usage());
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn test_close_is_idempotent() {
            let session = Session::loopback();
            session.close().await.unwrap();
            assert!(session.is_closed());
            session.close().await.unwrap();
            assert!(session.set_user("ci").unwrap_err().is_usage());
        }

        #[tokio::test]
        async fn test_disconnect_when_not_connected_is_noop() {
            let session = Session::loopback();
            session.disconnect().await.unwrap();
            assert!(!session.is_connected());
        }

        #[tokio::test]
        async fn test_auth_requires_user() {
            let session = Session::loopback();
            let err = session.userauth_password("pw").await.unwrap_err();
            assert!(err.is_usage());
        }

        #[tokio::test]
        async fn test_zero_wait_timeout_rejected() {
            let session = Session::loopback();
            assert!(session.set_wait_timeout(Duration::ZERO).unwrap_err().is_usage());
            session.set_wait_timeout(Duration::from_millis(5)).unwrap();
            assert_eq!(session.wait_timeout(), Duration::from_millis(5));
        }

        #[tokio::test]
        async fn test_connect_without_listener_fails() {
            let session = Session::loopback();
            session.set_host("nowhere").unwrap();
            session.set_port(1).unwrap();
            let err = session.connect().await.unwrap_err();
            assert!(err.is_protocol());
            assert!(!session.is_connected());
        }
    }

    #[test]
    fn test_info_snapshot() {
        let session = Session::loopback();
        session.set_user("ci").unwrap();
        let info = session.info();
        assert_eq!(info.session_id, session.id().to_string());
        assert_eq!(info.user.as_deref(), Some("ci"));
        assert!(!info.connected);
        assert_eq!(info.open_channels, 0);
    }
}
