//! Client side of the russh engine.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::client::{self as russh_client, Msg};
use russh::keys::{self, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, ChannelReadHalf, ChannelWriteHalf, Disconnect};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ClientHandler, build_client_config, parse_compression};
use crate::callbacks::{CallbackSet, ChannelEvent};
use crate::config;
use crate::lock::ReentrantLock;
use crate::transport::options::port_from;
use crate::transport::queue::{Activity, ChannelCore};
use crate::transport::{
    AuthStatus, ChannelHandle, OptionValue, PollStatus, PtyRequest, Readiness, SessionOption,
    Status, Stream, Transport,
};

type SharedHandle = Arc<tokio::sync::Mutex<Option<russh_client::Handle<ClientHandler>>>>;

fn not_connected(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, message.to_string())
}

#[derive(Debug, Default)]
struct Settings {
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    timeout: Option<Duration>,
    compression: Option<bool>,
    extra: HashMap<SessionOption, String>,
}

/// Client connection over TCP.
pub struct RusshTransport {
    settings: Mutex<Settings>,
    handle: SharedHandle,
    connected: AtomicBool,
    authenticated: AtomicBool,
    freed: AtomicBool,
    activity: Arc<Activity>,
    /// Activity generation seen by the last `wait_ready`.
    seen: AtomicU64,
    channels: Mutex<Vec<Weak<RusshChannel>>>,
    next_channel: AtomicU32,
    last_error: Arc<Mutex<String>>,
}

impl RusshTransport {
    pub fn new() -> Self {
        Self {
            settings: Mutex::new(Settings::default()),
            handle: Arc::new(tokio::sync::Mutex::new(None)),
            connected: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            freed: AtomicBool::new(false),
            activity: Arc::new(Activity::new()),
            seen: AtomicU64::new(0),
            channels: Mutex::new(Vec::new()),
            next_channel: AtomicU32::new(0),
            last_error: Arc::new(Mutex::new(String::new())),
        }
    }

    fn fail(&self, message: impl Into<String>) {
        *self.last_error.lock() = message.into();
    }

    fn live_channels(&self) -> Vec<Arc<RusshChannel>> {
        let mut channels = self.channels.lock();
        channels.retain(|channel| channel.strong_count() > 0);
        channels.iter().filter_map(Weak::upgrade).collect()
    }

    fn auth_result(&self, method: &str, result: Result<bool, String>) -> AuthStatus {
        match result {
            Ok(true) => {
                self.authenticated.store(true, Ordering::SeqCst);
                info!("{} authentication succeeded", method);
                AuthStatus::Success
            }
            Ok(false) => {
                self.fail(format!("{method} authentication rejected"));
                AuthStatus::Denied
            }
            Err(e) => {
                self.fail(e);
                AuthStatus::Error
            }
        }
    }
}

impl Default for RusshTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for RusshTransport {
    fn is_connected(&self) -> bool {
        !self.freed.load(Ordering::SeqCst) && self.connected.load(Ordering::SeqCst)
    }

    fn is_authenticated(&self) -> bool {
        self.is_connected() && self.authenticated.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Status {
        if self.freed.load(Ordering::SeqCst) {
            self.fail("transport freed");
            return Status::Error;
        }
        if self.is_connected() {
            return Status::Ok;
        }

        let (host, port, timeout, compress) = {
            let settings = self.settings.lock();
            (
                settings.host.clone().unwrap_or_else(|| "localhost".to_string()),
                settings.port.unwrap_or(config::DEFAULT_PORT),
                settings
                    .timeout
                    .unwrap_or_else(|| config::resolve_connect_timeout(None)),
                settings
                    .compression
                    .unwrap_or_else(|| config::resolve_compression(None)),
            )
        };

        let connect_future = russh_client::connect(
            build_client_config(compress),
            (host.as_str(), port),
            ClientHandler,
        );
        let handle = match tokio::time::timeout(timeout, connect_future).await {
            Err(_) => {
                self.fail(format!("Connection timed out after {timeout:?}"));
                return Status::Error;
            }
            Ok(Err(e)) => {
                self.fail(format!("Failed to connect: {e}"));
                return Status::Error;
            }
            Ok(Ok(handle)) => handle,
        };

        *self.handle.lock().await = Some(handle);
        self.connected.store(true, Ordering::SeqCst);
        debug!("connected to {}:{}", host, port);
        Status::Ok
    }

    async fn auth_password(&self, user: &str, password: &str) -> AuthStatus {
        let mut guard = self.handle.lock().await;
        let Some(handle) = guard.as_mut() else {
            self.fail("not connected");
            return AuthStatus::Error;
        };
        let result = handle
            .authenticate_password(user, password)
            .await
            .map(|result| result.success())
            .map_err(|e| format!("Password authentication failed: {e}"));
        drop(guard);
        self.auth_result("password", result)
    }

    async fn auth_publickey_file(&self, user: &str, key_path: &Path) -> AuthStatus {
        let key_pair = match keys::load_secret_key(key_path, None) {
            Ok(key) => key,
            Err(e) => {
                self.fail(format!("Failed to load private key from {key_path:?}: {e}"));
                return AuthStatus::Error;
            }
        };

        let mut guard = self.handle.lock().await;
        let Some(handle) = guard.as_mut() else {
            self.fail("not connected");
            return AuthStatus::Error;
        };

        // RSA keys sign with the best hash the server supports.
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!("Using RSA hash algorithm for key auth: {:?}", hash_alg);

        let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);
        let result = handle
            .authenticate_publickey(user, key_with_hash)
            .await
            .map(|result| result.success())
            .map_err(|e| format!("Key authentication failed: {e}"));
        drop(guard);
        self.auth_result("public key", result)
    }

    async fn auth_agent(&self, user: &str) -> AuthStatus {
        let mut agent = match keys::agent::client::AgentClient::connect_env().await {
            Ok(agent) => agent,
            Err(e) => {
                self.fail(format!("Failed to connect to SSH agent: {e}"));
                return AuthStatus::Error;
            }
        };
        let identities = match agent.request_identities().await {
            Ok(identities) if identities.is_empty() => {
                self.fail("No identities found in SSH agent");
                return AuthStatus::Error;
            }
            Ok(identities) => identities,
            Err(e) => {
                self.fail(format!("Failed to get identities from SSH agent: {e}"));
                return AuthStatus::Error;
            }
        };

        let mut guard = self.handle.lock().await;
        let Some(handle) = guard.as_mut() else {
            self.fail("not connected");
            return AuthStatus::Error;
        };
        for identity in identities {
            debug!("Trying SSH agent identity: {:?}", identity.comment());
            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();
            match handle
                .authenticate_publickey_with(user, identity.clone(), hash_alg, &mut agent)
                .await
            {
                Ok(result) if result.success() => {
                    drop(guard);
                    return self.auth_result("agent", Ok(true));
                }
                Ok(_) => debug!("Agent identity not accepted, trying next..."),
                Err(e) => debug!("Agent authentication error: {}, trying next...", e),
            }
        }
        drop(guard);
        self.auth_result("agent", Ok(false))
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().await.take()
            && let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
        {
            debug!("disconnect: {}", e);
        }
        self.activity.bump();
    }

    fn free(&self) {
        if self.freed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        for channel in self.live_channels() {
            channel.free();
        }
        // Dropping the handle ends the russh session task.
        if let Ok(mut handle) = self.handle.try_lock() {
            handle.take();
        }
        self.activity.bump();
    }

    async fn wait_ready(&self, interest: Readiness, timeout: Duration) -> io::Result<Readiness> {
        if !self.is_connected() {
            return Err(not_connected("not connected"));
        }
        if let Ok(handle) = self.handle.try_lock()
            && handle.as_ref().is_some_and(|handle| handle.is_closed())
        {
            self.connected.store(false, Ordering::SeqCst);
            return Err(not_connected("connection closed by peer"));
        }
        let seen = self.seen.load(Ordering::SeqCst);
        match self.activity.wait_past(seen, timeout).await {
            Some(generation) => {
                self.seen.store(generation, Ordering::SeqCst);
                Ok(interest)
            }
            None => Ok(Readiness::NONE),
        }
    }

    async fn process_events(&self) -> Status {
        if !self.is_connected() {
            self.fail("not connected");
            return Status::Error;
        }
        let mut delivered = 0;
        for channel in self.live_channels() {
            delivered += channel.core.deliver(Stream::Stdout).await.events;
        }
        if delivered > 0 { Status::Ok } else { Status::Again }
    }

    fn new_channel(&self) -> Option<Arc<dyn ChannelHandle>> {
        if !self.is_connected() {
            return None;
        }
        let timeout = self
            .settings
            .lock()
            .timeout
            .unwrap_or_else(|| config::resolve_connect_timeout(None));
        let channel = Arc::new(RusshChannel::new(
            self.next_channel.fetch_add(1, Ordering::SeqCst),
            self.handle.clone(),
            self.activity.clone(),
            timeout,
        ));
        self.channels.lock().push(Arc::downgrade(&channel));
        Some(channel)
    }

    fn last_error(&self) -> String {
        self.last_error.lock().clone()
    }

    fn set_option(&self, option: SessionOption, value: &OptionValue) -> Status {
        let mut settings = self.settings.lock();
        match option {
            SessionOption::Host => settings.host = value.as_str().map(str::to_string),
            SessionOption::User => settings.user = value.as_str().map(str::to_string),
            SessionOption::Port => match port_from(value) {
                Some(port) => settings.port = Some(port),
                None => return Status::Error,
            },
            SessionOption::Timeout => match value.as_int().and_then(|secs| u64::try_from(secs).ok()) {
                Some(secs) => settings.timeout = Some(Duration::from_secs(secs)),
                None => return Status::Error,
            },
            SessionOption::Compression => match value.as_str().and_then(parse_compression) {
                Some(compress) => settings.compression = Some(compress),
                None => return Status::Error,
            },
            other => match value.display_value() {
                Some(text) => {
                    settings.extra.insert(other, text);
                }
                None => return Status::Error,
            },
        }
        Status::Ok
    }

    fn get_option(&self, option: SessionOption) -> Option<String> {
        let settings = self.settings.lock();
        match option {
            SessionOption::Host => settings.host.clone(),
            SessionOption::User => settings.user.clone(),
            SessionOption::Port => None,
            SessionOption::Timeout => settings.timeout.map(|t| t.as_secs().to_string()),
            SessionOption::Compression => settings
                .compression
                .map(|on| if on { "yes" } else { "no" }.to_string()),
            other => settings.extra.get(&other).cloned(),
        }
    }

    fn port(&self) -> Option<u16> {
        self.settings.lock().port
    }
}

/// Requests sent with `want_reply`, answered in order by the server.
type PendingReplies = Arc<Mutex<VecDeque<oneshot::Sender<bool>>>>;

/// A client channel.
pub struct RusshChannel {
    id: u32,
    handle: SharedHandle,
    activity: Arc<Activity>,
    request_timeout: Duration,
    core: Arc<ChannelCore>,
    write: tokio::sync::Mutex<Option<ChannelWriteHalf<Msg>>>,
    replies: PendingReplies,
    pump: Mutex<Option<JoinHandle<()>>>,
    opened: AtomicBool,
    eof_sent: AtomicBool,
    close_sent: AtomicBool,
    freed: AtomicBool,
    last_error: Mutex<String>,
}

impl RusshChannel {
    fn new(
        id: u32,
        handle: SharedHandle,
        activity: Arc<Activity>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            id,
            handle,
            activity,
            request_timeout,
            core: Arc::new(ChannelCore::new()),
            write: tokio::sync::Mutex::new(None),
            replies: Arc::new(Mutex::new(VecDeque::new())),
            pump: Mutex::new(None),
            opened: AtomicBool::new(false),
            eof_sent: AtomicBool::new(false),
            close_sent: AtomicBool::new(false),
            freed: AtomicBool::new(false),
            last_error: Mutex::new(String::new()),
        }
    }

    fn fail(&self, message: impl Into<String>) {
        *self.last_error.lock() = message.into();
    }

    async fn attach(&self, channel: russh::Channel<Msg>) {
        debug!("channel {} opened as {:?}", self.id(), channel.id());
        let (read, write) = channel.split();
        *self.write.lock().await = Some(write);
        let pump = tokio::spawn(pump(
            read,
            self.core.clone(),
            self.replies.clone(),
            self.activity.clone(),
        ));
        *self.pump.lock() = Some(pump);
        self.opened.store(true, Ordering::SeqCst);
    }

    async fn open_with(&self, target: OpenTarget<'_>) -> Status {
        if self.opened.load(Ordering::SeqCst) {
            return Status::Ok;
        }
        let result = {
            let guard = self.handle.lock().await;
            let Some(handle) = guard.as_ref() else {
                self.fail("not connected");
                return Status::Error;
            };
            match target {
                OpenTarget::Session => handle.channel_open_session().await,
                OpenTarget::DirectTcpip {
                    host,
                    port,
                    originator,
                    originator_port,
                } => {
                    handle
                        .channel_open_direct_tcpip(
                            host,
                            u32::from(port),
                            originator,
                            u32::from(originator_port),
                        )
                        .await
                }
            }
        };
        match result {
            Ok(channel) => {
                self.attach(channel).await;
                Status::Ok
            }
            Err(e) => {
                self.fail(format!("Failed to open {} channel: {e}", target.name()));
                Status::Error
            }
        }
    }

    /// Send a request with `want_reply` and wait for the server's answer.
    async fn request(&self, request: Request<'_>) -> Status {
        let what = request.name();
        if !self.is_open() {
            self.fail("channel is not open");
            return Status::Error;
        }
        let (tx, rx) = oneshot::channel();
        self.replies.lock().push_back(tx);

        let sent = {
            let guard = self.write.lock().await;
            match guard.as_ref() {
                Some(write) => match request {
                    Request::Env { name, value } => write.set_env(true, name, value).await,
                    Request::Exec(command) => write.exec(true, command).await,
                    Request::Pty(pty) => {
                        write
                            .request_pty(
                                true,
                                &pty.term,
                                pty.cols,
                                pty.rows,
                                pty.pix_width,
                                pty.pix_height,
                                &[],
                            )
                            .await
                    }
                    Request::Shell => write.request_shell(true).await,
                }
                .map_err(|e| e.to_string()),
                None => Err("channel is not open".to_string()),
            }
        };
        if let Err(e) = sent {
            self.replies.lock().pop_back();
            self.fail(format!("Failed to send {what} request: {e}"));
            return Status::Error;
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(true)) => Status::Ok,
            Ok(Ok(false)) => {
                self.fail(format!("{what} request rejected by server"));
                Status::Error
            }
            Ok(Err(_)) => {
                self.fail(format!("channel closed before the {what} request was answered"));
                Status::Error
            }
            Err(_) => {
                self.fail(format!("{what} request timed out after {:?}", self.request_timeout));
                Status::Error
            }
        }
    }
}

#[derive(Clone, Copy)]
enum OpenTarget<'a> {
    Session,
    DirectTcpip {
        host: &'a str,
        port: u16,
        originator: &'a str,
        originator_port: u16,
    },
}

impl OpenTarget<'_> {
    fn name(&self) -> &'static str {
        match self {
            OpenTarget::Session => "session",
            OpenTarget::DirectTcpip { .. } => "direct-tcpip",
        }
    }
}

enum Request<'a> {
    Env { name: &'a str, value: &'a str },
    Exec(&'a str),
    Pty(&'a PtyRequest),
    Shell,
}

impl Request<'_> {
    fn name(&self) -> &'static str {
        match self {
            Request::Env { .. } => "env",
            Request::Exec(_) => "exec",
            Request::Pty(_) => "pty",
            Request::Shell => "shell",
        }
    }
}

/// Move everything the server sends into the channel's queue.
async fn pump(
    mut read: ChannelReadHalf,
    core: Arc<ChannelCore>,
    replies: PendingReplies,
    activity: Arc<Activity>,
) {
    let mut closed = false;
    while let Some(msg) = read.wait().await {
        match msg {
            ChannelMsg::Data { data } => core.push(ChannelEvent::Data {
                data: data.to_vec(),
                stream: Stream::Stdout,
            }),
            // ext == 1 is stderr in SSH protocol
            ChannelMsg::ExtendedData { data, ext } => {
                if ext == 1 {
                    core.push(ChannelEvent::Data {
                        data: data.to_vec(),
                        stream: Stream::Stderr,
                    });
                }
            }
            ChannelMsg::Eof => core.push(ChannelEvent::Eof),
            ChannelMsg::Close => {
                closed = true;
                core.push(ChannelEvent::Close);
            }
            ChannelMsg::ExitStatus { exit_status } => {
                core.push(ChannelEvent::ExitStatus(exit_status as i32));
            }
            ChannelMsg::Success => {
                if let Some(tx) = replies.lock().pop_front() {
                    let _ = tx.send(true);
                }
            }
            ChannelMsg::Failure => {
                if let Some(tx) = replies.lock().pop_front() {
                    let _ = tx.send(false);
                }
            }
            ChannelMsg::WindowAdjusted { new_size } => {
                core.push(ChannelEvent::WriteUnblocked(new_size as usize));
            }
            _ => {}
        }
        activity.bump();
    }

    // The connection went away without a close message.
    if !closed {
        core.push(ChannelEvent::Close);
    }
    replies.lock().clear();
    activity.bump();
}

#[async_trait]
impl ChannelHandle for RusshChannel {
    fn id(&self) -> u32 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
            && !self.close_sent.load(Ordering::SeqCst)
            && !self.freed.load(Ordering::SeqCst)
            && !self.core.close_delivered()
    }

    fn is_eof(&self) -> bool {
        self.core.eof_delivered()
    }

    async fn open_session(&self) -> Status {
        self.open_with(OpenTarget::Session).await
    }

    async fn open_forward(
        &self,
        host: &str,
        port: u16,
        originator: &str,
        originator_port: u16,
    ) -> Status {
        self.open_with(OpenTarget::DirectTcpip {
            host,
            port,
            originator,
            originator_port,
        })
        .await
    }

    async fn request_env(&self, name: &str, value: &str) -> Status {
        self.request(Request::Env { name, value }).await
    }

    async fn request_exec(&self, command: &str) -> Status {
        self.request(Request::Exec(command)).await
    }

    async fn request_pty(&self, request: &PtyRequest) -> Status {
        self.request(Request::Pty(request)).await
    }

    async fn request_shell(&self) -> Status {
        self.request(Request::Shell).await
    }

    async fn write(&self, data: &[u8], stream: Stream) -> Result<usize, Status> {
        if !self.is_open() || self.eof_sent.load(Ordering::SeqCst) {
            self.fail("channel is not writable");
            return Err(Status::Error);
        }
        let guard = self.write.lock().await;
        let Some(write) = guard.as_ref() else {
            self.fail("channel is not open");
            return Err(Status::Error);
        };
        let result = match stream {
            Stream::Stdout => write.data(data).await,
            Stream::Stderr => write.extended_data(1, data).await,
        };
        match result {
            Ok(()) => Ok(data.len()),
            Err(e) => {
                self.fail(format!("Failed to write to channel: {e}"));
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
        let guard = self.write.lock().await;
        match guard.as_ref().map(|write| write.eof()) {
            Some(eof) => match eof.await {
                Ok(()) => Status::Ok,
                Err(e) => {
                    self.fail(format!("Failed to send EOF: {e}"));
                    Status::Error
                }
            },
            None => Status::Error,
        }
    }

    async fn send_exit_status(&self, _code: u32) -> Status {
        self.fail("exit status is sent by the server side of a channel");
        Status::Error
    }

    async fn close(&self) -> Status {
        if self.freed.load(Ordering::SeqCst) {
            self.fail("channel freed");
            return Status::Error;
        }
        if self.opened.load(Ordering::SeqCst) && !self.close_sent.swap(true, Ordering::SeqCst) {
            let guard = self.write.lock().await;
            if let Some(write) = guard.as_ref()
                && let Err(e) = write.close().await
            {
                warn!("Failed to close channel {}: {}", self.id(), e);
            }
        }

        // Wait for the server's close so a trailing exit status is delivered.
        let deadline = tokio::time::Instant::now() + config::resolve_close_timeout(None);
        let mut seen = self.activity.generation();
        loop {
            self.core.deliver(Stream::Stdout).await;
            if self.core.close_delivered() || !self.opened.load(Ordering::SeqCst) {
                break;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                debug!("channel {} closed without a reply from the server", self.id());
                break;
            }
            if let Some(generation) = self.activity.wait_past(seen, deadline - now).await {
                seen = generation;
            }
        }
        Status::Ok
    }

    fn free(&self) {
        if self.freed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.core.discard();
        if let Ok(mut write) = self.write.try_lock() {
            write.take();
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
        } else {
            PollStatus::Idle
        }
    }

    fn set_callbacks(&self, callbacks: Option<Arc<CallbackSet>>) -> Status {
        if self.freed.load(Ordering::SeqCst) {
            self.fail("channel freed");
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

    #[test]
    fn test_unconnected_transport() {
        let transport = RusshTransport::new();
        assert!(!transport.is_connected());
        assert!(!transport.is_authenticated());
        assert!(transport.new_channel().is_none());
    }

    #[test]
    fn test_options_round_trip_through_getters() {
        let transport = RusshTransport::new();
        assert_eq!(
            transport.set_option(SessionOption::Host, &OptionValue::from("example.com")),
            Status::Ok
        );
        assert_eq!(
            transport.set_option(SessionOption::Port, &OptionValue::from(2222u16)),
            Status::Ok
        );
        assert_eq!(
            transport.set_option(SessionOption::Compression, &OptionValue::from("no")),
            Status::Ok
        );
        assert_eq!(transport.port(), Some(2222));
        assert_eq!(
            transport.get_option(SessionOption::Host).as_deref(),
            Some("example.com")
        );
        assert_eq!(
            transport.get_option(SessionOption::Compression).as_deref(),
            Some("no")
        );
    }

    #[test]
    fn test_bad_option_values() {
        let transport = RusshTransport::new();
        assert_eq!(
            transport.set_option(SessionOption::Port, &OptionValue::Int(70000)),
            Status::Error
        );
        assert_eq!(
            transport.set_option(SessionOption::Compression, &OptionValue::from("sometimes")),
            Status::Error
        );
        assert_eq!(
            transport.set_option(SessionOption::Timeout, &OptionValue::Int(-5)),
            Status::Error
        );
    }

    #[tokio::test]
    async fn test_connect_refused_sets_last_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = RusshTransport::new();
        transport.set_option(SessionOption::Host, &OptionValue::from("127.0.0.1"));
        transport.set_option(SessionOption::Port, &OptionValue::from(port));
        transport.set_option(SessionOption::Timeout, &OptionValue::Int(5));
        assert_eq!(transport.connect().await, Status::Error);
        assert!(!transport.last_error().is_empty());
        let err = transport
            .wait_ready(Readiness::READ, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
