//! Server side of the russh engine.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::keys::{self, HashAlg, PrivateKey};
use russh::server::{self as russh_server, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::callbacks::{
    AuthAttempt, CallbackSet, ChannelEvent, ChannelOpenKind, Message, MessageCallback,
};
use crate::channel::BorrowedChannel;
use crate::lock::ReentrantLock;
use crate::transport::options::port_from;
use crate::transport::queue::{Activity, ChannelCore, MessageQueue, Reply};
use crate::transport::{
    AuthMethods, AuthStatus, BindHandle, BindOption, ChannelHandle, OptionValue, PollStatus,
    PtyRequest, Readiness, SessionOption, Status, Stream, Transport,
};

fn not_connected(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, message.to_string())
}

#[derive(Debug, Default)]
struct BindSettings {
    address: Option<String>,
    port: u16,
    host_key_path: Option<PathBuf>,
    host_key: Option<Arc<PrivateKey>>,
    banner: Option<String>,
}

/// A TCP listening endpoint that accepts SSH connections.
pub struct RusshBind {
    settings: Mutex<BindSettings>,
    listener: tokio::sync::Mutex<Option<TcpListener>>,
    bound_port: Mutex<Option<u16>>,
    stashed: Mutex<Option<(TcpStream, SocketAddr)>>,
    closed: CancellationToken,
    last_error: Mutex<String>,
}

impl RusshBind {
    pub fn new() -> Self {
        Self {
            settings: Mutex::new(BindSettings::default()),
            listener: tokio::sync::Mutex::new(None),
            bound_port: Mutex::new(None),
            stashed: Mutex::new(None),
            closed: CancellationToken::new(),
            last_error: Mutex::new(String::new()),
        }
    }

    fn fail(&self, message: impl Into<String>) {
        *self.last_error.lock() = message.into();
    }

    fn host_key(&self) -> Result<PrivateKey, String> {
        let settings = self.settings.lock();
        if let Some(key) = &settings.host_key {
            return Ok(PrivateKey::clone(key));
        }
        match &settings.host_key_path {
            Some(path) => load_host_key(path),
            None => Err("no host key configured".to_string()),
        }
    }
}

impl Default for RusshBind {
    fn default() -> Self {
        Self::new()
    }
}

fn load_host_key(path: &Path) -> Result<PrivateKey, String> {
    keys::load_secret_key(path, None)
        .map_err(|e| format!("Failed to load host key from {path:?}: {e}"))
}

#[async_trait]
impl BindHandle for RusshBind {
    async fn listen(&self) -> Status {
        if self.closed.is_cancelled() {
            self.fail("bind handle closed");
            return Status::Error;
        }
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return Status::Ok;
        }
        // Fail early on a bad key rather than on the first connection.
        if let Err(e) = self.host_key() {
            self.fail(e);
            return Status::Error;
        }

        let (address, port) = {
            let settings = self.settings.lock();
            (
                settings.address.clone().unwrap_or_else(|| "0.0.0.0".to_string()),
                settings.port,
            )
        };
        let bound = match TcpListener::bind((address.as_str(), port)).await {
            Ok(bound) => bound,
            Err(e) => {
                self.fail(format!("Failed to bind to {address}:{port}: {e}"));
                return Status::Error;
            }
        };
        let local = match bound.local_addr() {
            Ok(local) => local,
            Err(e) => {
                self.fail(format!("Failed to get local address: {e}"));
                return Status::Error;
            }
        };
        info!("SSH server listening on {}", local);
        *self.bound_port.lock() = Some(local.port());
        *listener = Some(bound);
        Status::Ok
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && self.bound_port.lock().is_some()
    }

    async fn wait_incoming(&self, timeout: Duration) -> io::Result<bool> {
        if self.closed.is_cancelled() {
            return Err(not_connected("bind handle closed"));
        }
        if self.stashed.lock().is_some() {
            return Ok(true);
        }
        let mut guard = self.listener.lock().await;
        let Some(listener) = guard.as_ref() else {
            return Err(not_connected("not listening"));
        };
        let result = tokio::select! {
            _ = self.closed.cancelled() => Err(not_connected("bind handle closed")),
            accepted = tokio::time::timeout(timeout, listener.accept()) => match accepted {
                Err(_) => Ok(false),
                Ok(Ok(connection)) => {
                    *self.stashed.lock() = Some(connection);
                    Ok(true)
                }
                Ok(Err(e)) => Err(e),
            },
        };
        if self.closed.is_cancelled() {
            guard.take();
        }
        result
    }

    async fn accept(&self) -> Option<Arc<dyn Transport>> {
        let (stream, peer_addr) = self.stashed.lock().take()?;
        let key = match self.host_key() {
            Ok(key) => key,
            Err(e) => {
                self.fail(e);
                return None;
            }
        };
        let config = Arc::new(russh_server::Config {
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys: vec![key],
            ..Default::default()
        });

        let shared = Arc::new(ServerShared::new());
        let handler = ServerHandler {
            shared: shared.clone(),
        };
        let session_shared = shared.clone();
        tokio::spawn(async move {
            debug!("Starting SSH session for {}", peer_addr);
            let cancel = session_shared.cancel.clone();
            match russh_server::run_stream(config, stream, handler).await {
                Ok(session) => {
                    tokio::select! {
                        _ = cancel.cancelled() => debug!("SSH session for {} disconnected locally", peer_addr),
                        result = session => {
                            if let Err(e) = result {
                                warn!("SSH session error for {}: {:?}", peer_addr, e);
                            }
                        }
                    }
                }
                Err(e) => warn!("SSH handshake failed for {}: {}", peer_addr, e),
            }
            session_shared.shut_down();
        });

        Some(Arc::new(RusshServerTransport { shared }))
    }

    fn set_option(&self, option: BindOption, value: &OptionValue) -> Status {
        let mut settings = self.settings.lock();
        match option {
            BindOption::Address => match value.as_str() {
                Some(address) => settings.address = Some(address.to_string()),
                None => return Status::Error,
            },
            BindOption::Port => match port_from(value) {
                Some(port) => settings.port = port,
                None => return Status::Error,
            },
            BindOption::HostKeyPath => match value.as_str() {
                Some(path) => settings.host_key_path = Some(PathBuf::from(path)),
                None => return Status::Error,
            },
            BindOption::HostKey => match value.as_key() {
                Some(key) => settings.host_key = Some(key.clone()),
                None => return Status::Error,
            },
            BindOption::Banner => match value.as_str() {
                Some(banner) => settings.banner = Some(banner.to_string()),
                None => return Status::Error,
            },
            // Verbosity is applied through tracing, not per engine.
            BindOption::LogVerbosity => {
                if value.as_int().is_none() {
                    return Status::Error;
                }
            }
        }
        Status::Ok
    }

    fn bound_port(&self) -> Option<u16> {
        *self.bound_port.lock()
    }

    fn last_error(&self) -> String {
        self.last_error.lock().clone()
    }

    fn close(&self) {
        self.closed.cancel();
        self.stashed.lock().take();
        // A concurrent wait_incoming holds the listener; it drops out on cancel.
        if let Ok(mut listener) = self.listener.try_lock() {
            listener.take();
        }
    }
}

/// State shared between the russh handler task and the owning application.
struct ServerShared {
    activity: Activity,
    /// Activity generation seen by the last `wait_ready`.
    seen: AtomicU64,
    messages: MessageQueue,
    channels: Mutex<HashMap<ChannelId, Arc<RusshServerChannel>>>,
    next_channel: AtomicU32,
    connected: AtomicBool,
    authenticated: AtomicBool,
    cancel: CancellationToken,
}

impl ServerShared {
    fn new() -> Self {
        Self {
            activity: Activity::new(),
            seen: AtomicU64::new(0),
            messages: MessageQueue::new(),
            channels: Mutex::new(HashMap::new()),
            next_channel: AtomicU32::new(0),
            connected: AtomicBool::new(true),
            authenticated: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    fn channel(&self, id: ChannelId) -> Option<Arc<RusshServerChannel>> {
        self.channels.lock().get(&id).cloned()
    }

    fn channels(&self) -> Vec<Arc<RusshServerChannel>> {
        self.channels.lock().values().cloned().collect()
    }

    /// Queue a message for the application and wait for its answer.
    async fn ask(&self, message: Message) -> bool {
        let (tx, rx) = oneshot::channel();
        self.messages.push(
            message,
            Box::new(move |answer| {
                let _ = tx.send(answer);
            }),
        );
        self.activity.bump();
        rx.await.unwrap_or(false)
    }

    fn push(&self, id: ChannelId, event: ChannelEvent) {
        if let Some(channel) = self.channel(id) {
            channel.core.push(event);
            self.activity.bump();
        }
    }

    fn shut_down(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.messages.discard();
        for channel in self.channels() {
            // The peer is gone; nothing more will arrive.
            channel.core.push(ChannelEvent::Close);
        }
        self.activity.bump();
    }
}

/// Per-connection russh handler.
///
/// Every callback hands the event to the application's queues; answers to
/// channel requests are sent once the application has delivered them.
struct ServerHandler {
    shared: Arc<ServerShared>,
}

impl ServerHandler {
    fn verdict(&self, accepted: bool) -> Auth {
        if accepted {
            self.shared.authenticated.store(true, Ordering::SeqCst);
            Auth::Accept
        } else {
            Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            }
        }
    }

    async fn open(
        &mut self,
        channel: Channel<Msg>,
        kind: ChannelOpenKind,
        session: &mut Session,
    ) -> bool {
        let id = channel.id();
        let handle = RusshServerChannel {
            id: self.shared.next_channel.fetch_add(1, Ordering::SeqCst),
            channel: id,
            handle: session.handle(),
            core: ChannelCore::new(),
            opened: AtomicBool::new(false),
            eof_sent: AtomicBool::new(false),
            close_sent: AtomicBool::new(false),
            freed: AtomicBool::new(false),
            shared: Arc::downgrade(&self.shared),
            last_error: Mutex::new(String::new()),
        };
        let handle = Arc::new(handle);
        self.shared.channels.lock().insert(id, handle.clone());

        let accepted = self
            .shared
            .ask(Message::ChannelOpen {
                kind,
                channel: BorrowedChannel::new(handle.clone()),
            })
            .await;
        if accepted {
            handle.opened.store(true, Ordering::SeqCst);
        } else {
            self.shared.channels.lock().remove(&id);
        }
        accepted
    }

    /// Queue a channel request; the server replies once it is answered.
    fn request(&self, id: ChannelId, event: ChannelEvent, session: &mut Session) {
        let handle = session.handle();
        let reply: Reply = Box::new(move |accepted| {
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                return;
            };
            runtime.spawn(async move {
                if accepted {
                    let _ = handle.channel_success(id).await;
                } else {
                    let _ = handle.channel_failure(id).await;
                }
            });
        });
        match self.shared.channel(id) {
            Some(channel) => {
                channel.core.push_request(event, reply);
                self.shared.activity.bump();
            }
            None => reply(false),
        }
    }
}

impl russh_server::Handler for ServerHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        let accepted = self
            .shared
            .ask(Message::Auth {
                user: user.to_string(),
                attempt: AuthAttempt::None,
            })
            .await;
        Ok(self.verdict(accepted))
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let accepted = self
            .shared
            .ask(Message::Auth {
                user: user.to_string(),
                attempt: AuthAttempt::Password(password.to_string()),
            })
            .await;
        Ok(self.verdict(accepted))
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        let accepted = self
            .shared
            .ask(Message::Auth {
                user: user.to_string(),
                attempt: AuthAttempt::PublicKey {
                    algorithm: public_key.algorithm().as_str().to_string(),
                    fingerprint: public_key.fingerprint(HashAlg::Sha256).to_string(),
                },
            })
            .await;
        Ok(self.verdict(accepted))
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.open(channel, ChannelOpenKind::Session, session).await)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let (Ok(port), Ok(originator_port)) =
            (u16::try_from(port_to_connect), u16::try_from(originator_port))
        else {
            return Ok(false);
        };
        let kind = ChannelOpenKind::DirectTcpip {
            host: host_to_connect.to_string(),
            port,
            originator: originator_address.to_string(),
            originator_port,
        };
        Ok(self.open(channel, kind, session).await)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.shared.push(
            channel,
            ChannelEvent::Data {
                data: data.to_vec(),
                stream: Stream::Stdout,
            },
        );
        Ok(())
    }

    async fn extended_data(
        &mut self,
        channel: ChannelId,
        code: u32,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if code == 1 {
            self.shared.push(
                channel,
                ChannelEvent::Data {
                    data: data.to_vec(),
                    stream: Stream::Stderr,
                },
            );
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.shared.push(channel, ChannelEvent::Eof);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.shared.push(channel, ChannelEvent::Close);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.request(
            channel,
            ChannelEvent::EnvRequest {
                name: variable_name.to_string(),
                value: variable_value.to_string(),
            },
            session,
        );
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        self.request(channel, ChannelEvent::ExecRequest(command), session);
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = PtyRequest {
            term: term.to_string(),
            cols: col_width,
            rows: row_height,
            pix_width,
            pix_height,
        };
        self.request(channel, ChannelEvent::PtyRequest(request), session);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.request(channel, ChannelEvent::ShellRequest, session);
        Ok(())
    }
}

/// Server side of an accepted connection.
pub struct RusshServerTransport {
    shared: Arc<ServerShared>,
}

#[async_trait]
impl Transport for RusshServerTransport {
    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn is_authenticated(&self) -> bool {
        self.is_connected() && self.shared.authenticated.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Status {
        if self.is_connected() { Status::Ok } else { Status::Error }
    }

    async fn auth_password(&self, _user: &str, _password: &str) -> AuthStatus {
        AuthStatus::Error
    }

    async fn auth_publickey_file(&self, _user: &str, _key_path: &Path) -> AuthStatus {
        AuthStatus::Error
    }

    async fn auth_agent(&self, _user: &str) -> AuthStatus {
        AuthStatus::Error
    }

    async fn disconnect(&self) {
        self.shared.cancel.cancel();
        self.shared.shut_down();
    }

    fn free(&self) {
        self.shared.cancel.cancel();
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.channels.lock().clear();
    }

    async fn wait_ready(&self, interest: Readiness, timeout: Duration) -> io::Result<Readiness> {
        if !self.is_connected() {
            return Err(not_connected("client disconnected"));
        }
        let seen = self.shared.seen.load(Ordering::SeqCst);
        match self.shared.activity.wait_past(seen, timeout).await {
            Some(generation) => {
                self.shared.seen.store(generation, Ordering::SeqCst);
                Ok(interest)
            }
            None => Ok(Readiness::NONE),
        }
    }

    async fn process_events(&self) -> Status {
        let mut delivered = self.shared.messages.deliver().await;
        for channel in self.shared.channels() {
            delivered += channel.core.deliver(Stream::Stdout).await.events;
            if channel.core.close_delivered() {
                channel.finish().await;
            }
        }
        if delivered > 0 {
            Status::Ok
        } else if self.is_connected() {
            Status::Again
        } else {
            Status::Error
        }
    }

    fn new_channel(&self) -> Option<Arc<dyn ChannelHandle>> {
        None
    }

    fn last_error(&self) -> String {
        if self.is_connected() {
            String::new()
        } else {
            "client disconnected".to_string()
        }
    }

    fn set_option(&self, _option: SessionOption, _value: &OptionValue) -> Status {
        Status::Error
    }

    fn get_option(&self, _option: SessionOption) -> Option<String> {
        None
    }

    fn port(&self) -> Option<u16> {
        None
    }

    fn set_auth_methods(&self, methods: AuthMethods) -> Status {
        self.shared.messages.set_methods(methods);
        Status::Ok
    }

    fn set_message_callback(&self, callback: Option<MessageCallback>) -> Status {
        self.shared.messages.set_callback(callback);
        Status::Ok
    }
}

/// A channel the client opened on an accepted connection.
pub struct RusshServerChannel {
    id: u32,
    channel: ChannelId,
    handle: russh_server::Handle,
    core: ChannelCore,
    opened: AtomicBool,
    eof_sent: AtomicBool,
    close_sent: AtomicBool,
    freed: AtomicBool,
    shared: std::sync::Weak<ServerShared>,
    last_error: Mutex<String>,
}

impl RusshServerChannel {
    fn fail(&self, message: impl Into<String>) {
        *self.last_error.lock() = message.into();
    }

    fn connected(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.connected.load(Ordering::SeqCst))
    }

    /// Answer the client's close and forget the channel.
    async fn finish(&self) {
        if !self.close_sent.swap(true, Ordering::SeqCst) {
            let _ = self.handle.close(self.channel).await;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.channels.lock().remove(&self.channel);
        }
    }
}

#[async_trait]
impl ChannelHandle for RusshServerChannel {
    fn id(&self) -> u32 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
            && !self.close_sent.load(Ordering::SeqCst)
            && !self.freed.load(Ordering::SeqCst)
            && !self.core.close_delivered()
            && self.connected()
    }

    fn is_eof(&self) -> bool {
        self.core.eof_delivered()
    }

    async fn open_session(&self) -> Status {
        self.fail("server channels are opened by the client");
        Status::Error
    }

    async fn open_forward(&self, _: &str, _: u16, _: &str, _: u16) -> Status {
        self.fail("server channels are opened by the client");
        Status::Error
    }

    async fn request_env(&self, _name: &str, _value: &str) -> Status {
        Status::Error
    }

    async fn request_exec(&self, _command: &str) -> Status {
        Status::Error
    }

    async fn request_pty(&self, _request: &PtyRequest) -> Status {
        Status::Error
    }

    async fn request_shell(&self) -> Status {
        Status::Error
    }

    async fn write(&self, data: &[u8], stream: Stream) -> Result<usize, Status> {
        if !self.is_open() || self.eof_sent.load(Ordering::SeqCst) {
            self.fail("channel is not writable");
            return Err(Status::Error);
        }
        let payload = CryptoVec::from_slice(data);
        let result = match stream {
            Stream::Stdout => self.handle.data(self.channel, payload).await,
            Stream::Stderr => self.handle.extended_data(self.channel, 1, payload).await,
        };
        match result {
            Ok(()) => Ok(data.len()),
            Err(_) => {
                self.fail("connection closed while writing");
                Err(Status::Error)
            }
        }
    }

    async fn writable(&self, _timeout: Duration) {}

    async fn send_eof(&self) -> Status {
        if !self.is_open() {
            self.fail("channel is not open");
            return Status::Error;
        }
        if self.eof_sent.swap(true, Ordering::SeqCst) {
            return Status::Ok;
        }
        match self.handle.eof(self.channel).await {
            Ok(()) => Status::Ok,
            Err(_) => Status::Error,
        }
    }

    async fn send_exit_status(&self, code: u32) -> Status {
        if !self.is_open() {
            self.fail("channel is not open");
            return Status::Error;
        }
        match self.handle.exit_status_request(self.channel, code).await {
            Ok(()) => Status::Ok,
            Err(_) => Status::Error,
        }
    }

    async fn close(&self) -> Status {
        if self.freed.load(Ordering::SeqCst) {
            return Status::Error;
        }
        if self.opened.load(Ordering::SeqCst) && !self.close_sent.swap(true, Ordering::SeqCst) {
            let _ = self.handle.close(self.channel).await;
        }
        self.core.deliver(Stream::Stdout).await;
        Status::Ok
    }

    fn free(&self) {
        if self.freed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.core.discard();
        if let Some(shared) = self.shared.upgrade() {
            shared.channels.lock().remove(&self.channel);
        }
    }

    async fn poll(&self, stream: Stream) -> PollStatus {
        if self.freed.load(Ordering::SeqCst) {
            return PollStatus::Error;
        }
        let delivered = self.core.deliver(stream).await;
        if self.core.eof_delivered() {
            PollStatus::Eof
        } else if delivered.events > 0 {
            PollStatus::Ready(delivered.stream_bytes)
        } else if !self.connected() {
            PollStatus::Error
        } else {
            PollStatus::Idle
        }
    }

    fn set_callbacks(&self, callbacks: Option<Arc<CallbackSet>>) -> Status {
        if self.freed.load(Ordering::SeqCst) {
            return Status::Error;
        }
        self.core.set_callbacks(callbacks);
        Status::Ok
    }

    fn last_error(&self) -> String {
        self.last_error.lock().clone()
    }

    fn dispatch_lock(&self) -> &ReentrantLock {
        self.core.dispatch_lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listen_requires_host_key() {
        let bind = RusshBind::new();
        bind.set_option(BindOption::Address, &OptionValue::from("127.0.0.1"));
        assert_eq!(bind.listen().await, Status::Error);
        assert!(bind.last_error().contains("host key"));
        assert!(!bind.is_open());
    }

    #[test]
    fn test_option_kinds_enforced() {
        let bind = RusshBind::new();
        assert_eq!(
            bind.set_option(BindOption::Port, &OptionValue::from("22")),
            Status::Error
        );
        assert_eq!(
            bind.set_option(BindOption::HostKey, &OptionValue::from("/etc/ssh/key")),
            Status::Error
        );
        assert_eq!(
            bind.set_option(BindOption::Banner, &OptionValue::from("welcome")),
            Status::Ok
        );
    }

    #[tokio::test]
    async fn test_missing_key_file_reported() {
        let bind = RusshBind::new();
        bind.set_option(
            BindOption::HostKeyPath,
            &OptionValue::from("/nonexistent/ssh_host_ed25519_key"),
        );
        assert_eq!(bind.listen().await, Status::Error);
        assert!(bind.last_error().contains("Failed to load host key"));
    }

    #[tokio::test]
    async fn test_unparseable_key_file_reported() {
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut key_file, b"not a private key\n").unwrap();

        let bind = RusshBind::new();
        bind.set_option(
            BindOption::HostKeyPath,
            &OptionValue::from(key_file.path().to_string_lossy().as_ref()),
        );
        assert_eq!(bind.listen().await, Status::Error);
        assert!(bind.last_error().contains("Failed to load host key"));
        assert!(!bind.is_open());
    }
}
