//! SSH servers.
//!
//! A [`Server`] owns a listening [`BindHandle`] and runs an accept loop:
//! every accepted connection becomes a [`Session`] handed to the caller's
//! handler on its own worker task. Whatever the handler does, the worker
//! disconnects and closes the session afterwards, and handler errors and
//! panics are logged rather than taking the accept loop down.
//!
//! Authentication and channel-open requests reach the application through
//! the [`MessageCallback`] in [`ServerConfig`]; it runs while the session
//! handler processes events (see [`Session::run_until_disconnected`]).
//!
//! # Locking
//!
//! Property changes go through [`Server::lock`], which serializes them and
//! keeps the local mirror in step with the bind handle. The accept loop
//! reads the auth methods and message callback without that lock.

use std::future::Future;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use russh::keys::PrivateKey;
use tokio::sync::{MutexGuard, watch};
use tracing::{debug, error, info, warn};

use crate::callbacks::MessageCallback;
use crate::error::{Error, Result, is_closed_io, is_transient_io};
use crate::logging::LogVerbosity;
use crate::session::Session;
use crate::transport::loopback::LoopbackBind;
use crate::transport::options::{bind_option, check_kind};
use crate::transport::ssh::RusshBind;
use crate::transport::{AuthMethods, BindHandle, BindOption, OptionValue, Status};
use crate::types::ServerInfo;

/// How to set up a [`Server`].
///
/// Exactly one of `host_key_path` and `host_key` must be set.
#[derive(Clone)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    pub host_key_path: Option<PathBuf>,
    pub host_key: Option<Arc<PrivateKey>>,
    pub auth_methods: AuthMethods,
    pub log_verbosity: LogVerbosity,
    pub banner: Option<String>,
    pub message_callback: Option<MessageCallback>,
}

impl ServerConfig {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            host_key_path: None,
            host_key: None,
            auth_methods: AuthMethods::default(),
            log_verbosity: LogVerbosity::default(),
            banner: None,
            message_callback: None,
        }
    }

    pub fn with_host_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_key_path = Some(path.into());
        self
    }

    pub fn with_host_key(mut self, key: PrivateKey) -> Self {
        self.host_key = Some(Arc::new(key));
        self
    }

    pub fn with_auth_methods(mut self, methods: AuthMethods) -> Self {
        self.auth_methods = methods;
        self
    }

    pub fn with_log_verbosity(mut self, verbosity: LogVerbosity) -> Self {
        self.log_verbosity = verbosity;
        self
    }

    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = Some(banner.into());
        self
    }

    pub fn with_message_callback(mut self, callback: MessageCallback) -> Self {
        self.message_callback = Some(callback);
        self
    }
}

/// Local mirror of the properties pushed to the bind handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub address: String,
    pub port: u16,
    pub host_key_path: Option<String>,
    pub has_host_key: bool,
    pub log_verbosity: LogVerbosity,
    pub banner: Option<String>,
}

impl ServerSettings {
    fn mirror(&mut self, option: BindOption, value: &OptionValue) -> Result<()> {
        match option {
            BindOption::Address => {
                if let Some(address) = value.as_str() {
                    self.address = address.to_string();
                }
            }
            BindOption::Port => {
                if let Some(port) = crate::transport::options::port_from(value) {
                    self.port = port;
                }
            }
            BindOption::HostKeyPath => self.host_key_path = value.as_str().map(str::to_string),
            BindOption::HostKey => self.has_host_key = value.as_key().is_some(),
            BindOption::LogVerbosity => {
                if let Some(level) = value.as_int() {
                    self.log_verbosity = LogVerbosity::try_from(level)?;
                }
            }
            BindOption::Banner => self.banner = value.as_str().map(str::to_string),
        }
        Ok(())
    }
}

struct ServerInner {
    bind: RwLock<Option<Arc<dyn BindHandle>>>,
    settings: tokio::sync::Mutex<ServerSettings>,
    auth_methods: RwLock<AuthMethods>,
    message_callback: RwLock<Option<MessageCallback>>,
    started: watch::Sender<bool>,
    active: AtomicUsize,
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        if let Some(bind) = self.bind.get_mut().take() {
            bind.close();
        }
    }
}

/// A listening SSH server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

/// Exclusive access to the server's properties.
pub struct ServerGuard<'a> {
    bind: Option<Arc<dyn BindHandle>>,
    settings: MutexGuard<'a, ServerSettings>,
}

impl ServerGuard<'_> {
    /// Push a property to the bind handle, then mirror it locally.
    pub fn set_property(&mut self, name: &str, value: impl Into<OptionValue>) -> Result<()> {
        let bind = self
            .bind
            .as_ref()
            .ok_or_else(|| Error::InvalidState("server is closed".to_string()))?;
        push_option(bind.as_ref(), &mut self.settings, name, value.into())
    }
}

impl Deref for ServerGuard<'_> {
    type Target = ServerSettings;

    fn deref(&self) -> &ServerSettings {
        &self.settings
    }
}

fn push_option(
    bind: &dyn BindHandle,
    settings: &mut ServerSettings,
    name: &str,
    value: OptionValue,
) -> Result<()> {
    let spec = bind_option(name)?;
    check_kind(spec, &value)?;
    if spec.option == BindOption::LogVerbosity
        && let Some(level) = value.as_int()
    {
        LogVerbosity::try_from(level)?;
    }
    if bind.set_option(spec.option, &value) != Status::Ok {
        return Err(Error::protocol("set_property", bind.last_error()));
    }
    settings.mirror(spec.option, &value)
}

impl Server {
    /// Configure `bind` from `config`. Nothing listens until [`Server::listen`].
    pub fn new(config: ServerConfig, bind: Arc<dyn BindHandle>) -> Result<Server> {
        match (&config.host_key_path, &config.host_key) {
            (Some(_), Some(_)) => {
                return Err(Error::InvalidArgument(
                    "set either host_key_path or host_key, not both".to_string(),
                ));
            }
            (None, None) => {
                return Err(Error::InvalidArgument("a host key is required".to_string()));
            }
            _ => {}
        }

        let mut settings = ServerSettings {
            address: config.address.clone(),
            port: config.port,
            host_key_path: None,
            has_host_key: false,
            log_verbosity: LogVerbosity::default(),
            banner: None,
        };
        push_option(bind.as_ref(), &mut settings, "addr", config.address.into())?;
        push_option(bind.as_ref(), &mut settings, "port", config.port.into())?;
        if let Some(path) = &config.host_key_path {
            let path = path.to_string_lossy().into_owned();
            push_option(bind.as_ref(), &mut settings, "host_key_path", path.into())?;
        }
        if let Some(key) = config.host_key {
            push_option(bind.as_ref(), &mut settings, "host_key", key.into())?;
        }
        push_option(
            bind.as_ref(),
            &mut settings,
            "log_verbosity",
            config.log_verbosity.as_int().into(),
        )?;
        if let Some(banner) = config.banner {
            push_option(bind.as_ref(), &mut settings, "banner", banner.into())?;
        }

        let (started, _) = watch::channel(false);
        Ok(Server {
            inner: Arc::new(ServerInner {
                bind: RwLock::new(Some(bind)),
                settings: tokio::sync::Mutex::new(settings),
                auth_methods: RwLock::new(config.auth_methods),
                message_callback: RwLock::new(config.message_callback),
                started,
                active: AtomicUsize::new(0),
            }),
        })
    }

    /// An SSH/TCP server.
    pub fn ssh(config: ServerConfig) -> Result<Server> {
        Server::new(config, Arc::new(RusshBind::new()))
    }

    /// An in-process server reachable by [`Session::loopback`] clients.
    pub fn loopback(config: ServerConfig) -> Result<Server> {
        Server::new(config, Arc::new(LoopbackBind::new()))
    }

    fn bind(&self) -> Result<Arc<dyn BindHandle>> {
        self.inner
            .bind
            .read()
            .clone()
            .ok_or_else(|| Error::InvalidState("server is closed".to_string()))
    }

    pub fn is_open(&self) -> bool {
        self.inner
            .bind
            .read()
            .as_ref()
            .is_some_and(|bind| bind.is_open())
    }

    /// Lock the properties for a multi-step change.
    pub async fn lock(&self) -> ServerGuard<'_> {
        let settings = self.inner.settings.lock().await;
        ServerGuard {
            bind: self.inner.bind.read().clone(),
            settings,
        }
    }

    pub async fn set_property(&self, name: &str, value: impl Into<OptionValue>) -> Result<()> {
        self.lock().await.set_property(name, value)
    }

    pub async fn settings(&self) -> ServerSettings {
        self.inner.settings.lock().await.clone()
    }

    /// Applies to sessions accepted from now on.
    pub fn set_auth_methods(&self, methods: AuthMethods) {
        *self.inner.auth_methods.write() = methods;
    }

    /// Applies to sessions accepted from now on.
    pub fn set_message_callback(&self, callback: Option<MessageCallback>) {
        *self.inner.message_callback.write() = callback;
    }

    /// Port actually bound once listening, else the configured one.
    pub async fn port(&self) -> Option<u16> {
        let bound = self.bind().ok().and_then(|bind| bind.bound_port());
        match bound {
            Some(port) => Some(port),
            None => Some(self.inner.settings.lock().await.port),
        }
    }

    /// Sessions whose worker is still running.
    pub fn active_sessions(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Listen and run `handler` on a worker task for every accepted session.
    ///
    /// Returns once the server is closed. `poll_timeout` bounds each wait for
    /// an incoming connection and must be positive, so a closed listener is
    /// always noticed.
    pub async fn listen<H, Fut>(&self, handler: H, poll_timeout: Duration) -> Result<()>
    where
        H: Fn(Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if poll_timeout.is_zero() {
            return Err(Error::InvalidArgument(
                "poll timeout must be positive".to_string(),
            ));
        }
        let bind = self.bind()?;
        if bind.listen().await != Status::Ok {
            return Err(Error::protocol("listen", bind.last_error()));
        }
        info!(
            "Server listening on port {}",
            bind.bound_port().map(|p| p.to_string()).unwrap_or_default()
        );

        let handler = Arc::new(handler);
        while self.is_open() {
            self.inner.started.send_if_modified(|started| !std::mem::replace(started, true));

            let ready = match bind.wait_incoming(poll_timeout).await {
                Ok(ready) => ready,
                Err(e) if is_closed_io(&e) || is_transient_io(&e) => {
                    debug!("wait for connection interrupted: {}", e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            // Closed while we were waiting.
            if !self.is_open() {
                break;
            }
            if !ready {
                continue;
            }

            let Some(transport) = bind.accept().await else {
                warn!("accept failed: {}", bind.last_error());
                continue;
            };
            transport.set_auth_methods(*self.inner.auth_methods.read());
            let callback = self.inner.message_callback.read().clone();
            transport.set_message_callback(callback);

            let session = Session::new(transport);
            self.spawn_worker(session, handler.clone());
        }
        info!("Server stopped listening");
        Ok(())
    }

    fn spawn_worker<H, Fut>(&self, session: Session, handler: Arc<H>)
    where
        H: Fn(Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let inner = self.inner.clone();
        inner.active.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let id = session.id();
            debug!("Session {} accepted", id);
            match tokio::spawn((*handler)(session.clone())).await {
                Ok(Ok(())) => debug!("Session {} handler finished", id),
                Ok(Err(e)) => warn!("Session {} handler failed: {}", id, e),
                Err(e) if e.is_panic() => error!("Session {} handler panicked", id),
                Err(e) => warn!("Session {} handler task failed: {}", id, e),
            }
            if let Err(e) = session.disconnect().await {
                warn!("Session {} disconnect failed: {}", id, e);
            }
            if let Err(e) = session.close().await {
                warn!("Session {} close failed: {}", id, e);
            }
            inner.active.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Resolve once [`Server::listen`] has bound and entered its loop.
    pub async fn wait_for_listener(&self) -> Result<()> {
        let mut started = self.inner.started.subscribe();
        started
            .wait_for(|started| *started)
            .await
            .map(|_| ())
            .map_err(|e| Error::Task(e.to_string()))
    }

    /// Stop listening. Idempotent; running sessions are left to finish.
    pub fn close(&self) {
        let bind = self.inner.bind.write().take();
        if let Some(bind) = bind {
            bind.close();
            debug!("Server closed");
        }
    }

    pub async fn info(&self) -> ServerInfo {
        ServerInfo {
            address: self.inner.settings.lock().await.address.clone(),
            port: self.port().await,
            listening: self.is_open(),
            active_sessions: self.active_sessions(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServerConfig {
        ServerConfig::new("localhost", 0).with_host_key_path("/etc/ssh/ssh_host_ed25519_key")
    }

    mod construction {
        use super::*;

        #[test]
        fn test_requires_a_host_key() {
            let err = Server::loopback(ServerConfig::new("localhost", 0)).err().unwrap();
            assert!(err.is_usage());
        }

        #[tokio::test]
        async fn test_settings_mirrored() {
            let server = Server::loopback(config().with_banner("hello")).unwrap();
            let settings = server.settings().await;
            assert_eq!(settings.address, "localhost");
            assert_eq!(settings.banner.as_deref(), Some("hello"));
            assert_eq!(
                settings.host_key_path.as_deref(),
                Some("/etc/ssh/ssh_host_ed25519_key")
            );
        }
    }

    mod properties {
        use super::*;

        #[tokio::test]
        async fn test_guard_applies_several_changes() {
            let server = Server::loopback(config()).unwrap();
            {
                let mut guard = server.lock().await;
                guard.set_property("banner", "maintenance").unwrap();
                guard.set_property("log_verbosity", 2i64).unwrap();
                assert_eq!(guard.banner.as_deref(), Some("maintenance"));
            }
            assert_eq!(server.settings().await.log_verbosity, LogVerbosity::Protocol);
        }

        #[tokio::test]
        async fn test_invalid_values_rejected_before_push() {
            let server = Server::loopback(config()).unwrap();
            assert!(server.set_property("log_verbosity", 7i64).await.unwrap_err().is_usage());
            assert!(server.set_property("port", "22").await.unwrap_err().is_usage());
            assert!(server.set_property("ciphers", "x").await.unwrap_err().is_usage());
            assert_eq!(server.settings().await.log_verbosity, LogVerbosity::NoLog);
        }

        #[tokio::test]
        async fn test_closed_server_rejects_properties() {
            let server = Server::loopback(config()).unwrap();
            server.close();
            server.close();
            assert!(server.set_property("banner", "x").await.unwrap_err().is_usage());
        }
    }

    #[tokio::test]
    async fn test_zero_poll_timeout_rejected_before_binding() {
        let server = Server::loopback(config()).unwrap();
        let err = server
            .listen(|_session| async { Ok(()) }, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.is_usage());
        assert!(!server.is_open());
    }
}
