//! In-process engine.
//!
//! A [`LoopbackBind`] registers an `addr:port` in a process-wide registry; a
//! client [`LoopbackTransport`] whose host/port options name that address
//! connects to it without touching the network. Both halves run the full
//! non-blocking protocol: connect, authentication and every channel request
//! return `Again` until the other side has processed the message, and
//! channel writes are flow-controlled by a per-channel window that frees up
//! as the reader consumes data.
//!
//! Public-key authentication works from a key file; agent authentication is
//! not available.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use russh::keys::{self, HashAlg};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::callbacks::{AuthAttempt, CallbackSet, ChannelEvent, ChannelOpenKind, Message, MessageCallback};
use crate::channel::BorrowedChannel;
use crate::lock::ReentrantLock;
use crate::transport::options::port_from;
use crate::transport::queue::{Activity, ChannelCore, Delivered, MessageQueue, Reply};
use crate::transport::{
    AuthMethods, AuthStatus, BindHandle, BindOption, ChannelHandle, OptionValue, PollStatus,
    PtyRequest, Readiness, SessionOption, Status, Stream, Transport,
};

/// Bytes a writer may have outstanding before `write` returns `Again`.
pub const WINDOW_SIZE: usize = 256 * 1024;

const FIRST_EPHEMERAL_PORT: u16 = 49152;

static LISTENERS: Lazy<DashMap<(String, u16), mpsc::UnboundedSender<Arc<Link>>>> =
    Lazy::new(DashMap::new);

static NEXT_EPHEMERAL: AtomicU16 = AtomicU16::new(FIRST_EPHEMERAL_PORT);

fn not_connected(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, message.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Pending = 0,
    Accepted = 1,
    Refused = 2,
    Down = 3,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LinkState::Pending,
            1 => LinkState::Accepted,
            2 => LinkState::Refused,
            _ => LinkState::Down,
        }
    }
}

/// One side of a connection.
struct Endpoint {
    activity: Activity,
    channels: Mutex<HashMap<u32, Arc<LoopbackChannel>>>,
    messages: MessageQueue,
    next_channel: AtomicU32,
}

impl Endpoint {
    fn new() -> Self {
        Self {
            activity: Activity::new(),
            channels: Mutex::new(HashMap::new()),
            messages: MessageQueue::new(),
            next_channel: AtomicU32::new(0),
        }
    }

    fn channels(&self) -> Vec<Arc<LoopbackChannel>> {
        self.channels.lock().values().cloned().collect()
    }
}

/// A connection between a client and a server endpoint.
struct Link {
    target: (String, u16),
    state: AtomicU8,
    authenticated: AtomicBool,
    client: Arc<Endpoint>,
    server: Arc<Endpoint>,
}

impl Link {
    fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: LinkState) {
        self.state.store(state as u8, Ordering::SeqCst);
        self.client.activity.bump();
        self.server.activity.bump();
    }

    fn is_up(&self) -> bool {
        self.state() == LinkState::Accepted
    }

    fn endpoint(&self, side: Side) -> &Arc<Endpoint> {
        match side {
            Side::Client => &self.client,
            Side::Server => &self.server,
        }
    }

    fn peer_endpoint(&self, side: Side) -> &Arc<Endpoint> {
        match side {
            Side::Client => &self.server,
            Side::Server => &self.client,
        }
    }

    /// Take the link down and close every channel on both sides.
    fn shut_down(&self) {
        if self.state() == LinkState::Down {
            return;
        }
        self.set_state(LinkState::Down);
        for endpoint in [&self.client, &self.server] {
            endpoint.messages.discard();
            for channel in endpoint.channels() {
                channel.core.discard();
            }
        }
    }
}

enum ReplyState {
    /// Nothing was asked yet.
    Idle,
    Waiting,
    Answered(bool),
    /// The other side dropped the question.
    Lost,
}

fn take_reply(slot: &Mutex<Option<oneshot::Receiver<bool>>>) -> ReplyState {
    let mut slot = slot.lock();
    let Some(rx) = slot.as_mut() else {
        return ReplyState::Idle;
    };
    match rx.try_recv() {
        Ok(answer) => {
            *slot = None;
            ReplyState::Answered(answer)
        }
        Err(oneshot::error::TryRecvError::Empty) => ReplyState::Waiting,
        Err(oneshot::error::TryRecvError::Closed) => {
            *slot = None;
            ReplyState::Lost
        }
    }
}

/// Reply that answers on `tx` and wakes the asking side.
fn wake_reply(tx: oneshot::Sender<bool>, asker: Weak<Endpoint>) -> Reply {
    Box::new(move |answer| {
        let _ = tx.send(answer);
        if let Some(endpoint) = asker.upgrade() {
            endpoint.activity.bump();
        }
    })
}

#[derive(Debug, Default)]
struct Settings {
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    extra: HashMap<SessionOption, String>,
}

/// One side of an in-process SSH connection.
pub struct LoopbackTransport {
    side: Side,
    local: Arc<Endpoint>,
    link: RwLock<Option<Arc<Link>>>,
    settings: Mutex<Settings>,
    pending_auth: Mutex<Option<oneshot::Receiver<bool>>>,
    /// Activity generation seen by the last `wait_ready`.
    seen: AtomicU64,
    freed: AtomicBool,
    last_error: Mutex<String>,
}

impl LoopbackTransport {
    /// A client transport; set host and port before connecting.
    pub fn client() -> Self {
        Self {
            side: Side::Client,
            local: Arc::new(Endpoint::new()),
            link: RwLock::new(None),
            settings: Mutex::new(Settings::default()),
            pending_auth: Mutex::new(None),
            seen: AtomicU64::new(0),
            freed: AtomicBool::new(false),
            last_error: Mutex::new(String::new()),
        }
    }

    fn accepted(link: Arc<Link>) -> Self {
        Self {
            side: Side::Server,
            local: link.server.clone(),
            link: RwLock::new(Some(link)),
            settings: Mutex::new(Settings::default()),
            pending_auth: Mutex::new(None),
            seen: AtomicU64::new(0),
            freed: AtomicBool::new(false),
            last_error: Mutex::new(String::new()),
        }
    }

    fn link(&self) -> Option<Arc<Link>> {
        self.link.read().clone()
    }

    fn fail(&self, message: impl Into<String>) {
        *self.last_error.lock() = message.into();
    }

    fn authenticate(&self, user: &str, attempt: impl FnOnce() -> Option<AuthAttempt>) -> AuthStatus {
        match take_reply(&self.pending_auth) {
            ReplyState::Idle => {}
            ReplyState::Waiting => return AuthStatus::Again,
            ReplyState::Answered(true) => {
                if let Some(link) = self.link() {
                    link.authenticated.store(true, Ordering::SeqCst);
                }
                return AuthStatus::Success;
            }
            ReplyState::Answered(false) => {
                self.fail("authentication rejected by server");
                return AuthStatus::Denied;
            }
            ReplyState::Lost => {
                self.fail("connection lost during authentication");
                return AuthStatus::Error;
            }
        }

        let Some(link) = self.link().filter(|link| link.is_up()) else {
            self.fail("not connected");
            return AuthStatus::Error;
        };
        if self.side == Side::Server {
            self.fail("server sessions do not authenticate");
            return AuthStatus::Error;
        }
        let Some(attempt) = attempt() else {
            return AuthStatus::Error;
        };

        let (tx, rx) = oneshot::channel();
        *self.pending_auth.lock() = Some(rx);
        link.server.messages.push(
            Message::Auth {
                user: user.to_string(),
                attempt,
            },
            wake_reply(tx, Arc::downgrade(&self.local)),
        );
        link.server.activity.bump();
        AuthStatus::Again
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn is_connected(&self) -> bool {
        !self.freed.load(Ordering::SeqCst) && self.link().is_some_and(|link| link.is_up())
    }

    fn is_authenticated(&self) -> bool {
        self.is_connected()
            && self
                .link()
                .is_some_and(|link| link.authenticated.load(Ordering::SeqCst))
    }

    async fn connect(&self) -> Status {
        if self.freed.load(Ordering::SeqCst) {
            self.fail("transport freed");
            return Status::Error;
        }
        if let Some(link) = self.link() {
            return match link.state() {
                LinkState::Pending if !LISTENERS.contains_key(&link.target) => {
                    link.set_state(LinkState::Refused);
                    self.fail("connection refused: listener closed");
                    Status::Error
                }
                LinkState::Pending => Status::Again,
                LinkState::Accepted => Status::Ok,
                LinkState::Refused => {
                    self.fail("connection refused");
                    Status::Error
                }
                LinkState::Down => {
                    self.fail("connection closed");
                    Status::Error
                }
            };
        }

        let (host, port) = {
            let settings = self.settings.lock();
            (
                settings.host.clone().unwrap_or_else(|| "localhost".to_string()),
                settings.port.unwrap_or(crate::config::DEFAULT_PORT),
            )
        };
        let Some(listener) = LISTENERS.get(&(host.clone(), port)).map(|entry| entry.clone())
        else {
            self.fail(format!("connection refused: nothing listening on {host}:{port}"));
            return Status::Error;
        };

        let link = Arc::new(Link {
            target: (host.clone(), port),
            state: AtomicU8::new(LinkState::Pending as u8),
            authenticated: AtomicBool::new(false),
            client: self.local.clone(),
            server: Arc::new(Endpoint::new()),
        });
        if listener.send(link.clone()).is_err() {
            self.fail(format!("connection refused: {host}:{port} stopped listening"));
            return Status::Error;
        }
        debug!("loopback connect to {}:{} pending", host, port);
        *self.link.write() = Some(link);
        Status::Again
    }

    async fn auth_password(&self, user: &str, password: &str) -> AuthStatus {
        self.authenticate(user, || Some(AuthAttempt::Password(password.to_string())))
    }

    async fn auth_publickey_file(&self, user: &str, key_path: &Path) -> AuthStatus {
        self.authenticate(user, || match keys::load_secret_key(key_path, None) {
            Ok(key) => Some(AuthAttempt::PublicKey {
                algorithm: key.algorithm().as_str().to_string(),
                fingerprint: key.public_key().fingerprint(HashAlg::Sha256).to_string(),
            }),
            Err(e) => {
                self.fail(format!("failed to load private key from {key_path:?}: {e}"));
                None
            }
        })
    }

    async fn auth_agent(&self, _user: &str) -> AuthStatus {
        self.fail("agent authentication is not available on loopback transports");
        AuthStatus::Error
    }

    async fn disconnect(&self) {
        if let Some(link) = self.link() {
            link.shut_down();
        }
    }

    fn free(&self) {
        if self.freed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(link) = self.link() {
            link.shut_down();
        }
    }

    async fn wait_ready(&self, interest: Readiness, timeout: Duration) -> io::Result<Readiness> {
        if self.freed.load(Ordering::SeqCst) {
            return Err(not_connected("transport freed"));
        }
        match self.link() {
            Some(link) if link.state() == LinkState::Down => {
                return Err(not_connected("connection closed"));
            }
            None => return Err(not_connected("not connected")),
            Some(_) => {}
        }
        let seen = self.seen.load(Ordering::SeqCst);
        match self.local.activity.wait_past(seen, timeout).await {
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
        let mut delivered = self.local.messages.deliver().await;
        for channel in self.local.channels() {
            delivered += channel.deliver(Stream::Stdout).await.events;
            // Incoming channels belong to the server session.
            if self.side == Side::Server && channel.is_finished() {
                channel.free();
            }
        }
        if delivered > 0 { Status::Ok } else { Status::Again }
    }

    fn new_channel(&self) -> Option<Arc<dyn ChannelHandle>> {
        let link = self.link().filter(|link| link.is_up())?;
        let channel = LoopbackChannel::register(&link, self.side);
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
                None => {
                    drop(settings);
                    self.fail(format!("invalid port {value:?}"));
                    return Status::Error;
                }
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
            other => settings.extra.get(&other).cloned(),
        }
    }

    fn port(&self) -> Option<u16> {
        self.settings.lock().port
    }

    fn set_auth_methods(&self, methods: AuthMethods) -> Status {
        if self.side != Side::Server {
            return Status::Error;
        }
        self.local.messages.set_methods(methods);
        Status::Ok
    }

    fn set_message_callback(&self, callback: Option<MessageCallback>) -> Status {
        if self.side != Side::Server {
            return Status::Error;
        }
        self.local.messages.set_callback(callback);
        Status::Ok
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    opened: bool,
    eof_sent: bool,
    close_sent: bool,
    freed: bool,
}

/// One end of a loopback channel.
pub struct LoopbackChannel {
    id: u32,
    side: Side,
    link: Weak<Link>,
    peer: Mutex<Option<Weak<LoopbackChannel>>>,
    core: ChannelCore,
    state: Mutex<ChannelState>,
    pending_open: Mutex<Option<oneshot::Receiver<bool>>>,
    pending_request: Mutex<Option<oneshot::Receiver<bool>>>,
    /// Bytes queued on this end and not yet delivered.
    unread: AtomicUsize,
    write_blocked: AtomicBool,
    /// Activity generation seen by the last `writable`.
    seen: AtomicU64,
    last_error: Mutex<String>,
}

impl LoopbackChannel {
    fn register(link: &Arc<Link>, side: Side) -> Arc<Self> {
        let endpoint = link.endpoint(side);
        let id = endpoint.next_channel.fetch_add(1, Ordering::SeqCst);
        let channel = Arc::new(Self {
            id,
            side,
            link: Arc::downgrade(link),
            peer: Mutex::new(None),
            core: ChannelCore::new(),
            state: Mutex::new(ChannelState::default()),
            pending_open: Mutex::new(None),
            pending_request: Mutex::new(None),
            unread: AtomicUsize::new(0),
            write_blocked: AtomicBool::new(false),
            seen: AtomicU64::new(0),
            last_error: Mutex::new(String::new()),
        });
        endpoint.channels.lock().insert(id, channel.clone());
        channel
    }

    /// A channel with no link, as left behind by a dropped connection.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            id: 0,
            side: Side::Server,
            link: Weak::new(),
            peer: Mutex::new(None),
            core: ChannelCore::new(),
            state: Mutex::new(ChannelState::default()),
            pending_open: Mutex::new(None),
            pending_request: Mutex::new(None),
            unread: AtomicUsize::new(0),
            write_blocked: AtomicBool::new(false),
            seen: AtomicU64::new(0),
            last_error: Mutex::new(String::new()),
        }
    }

    fn fail(&self, message: impl Into<String>) {
        *self.last_error.lock() = message.into();
    }

    /// Both sides sent close.
    fn is_finished(&self) -> bool {
        self.core.close_delivered() && self.state.lock().close_sent
    }

    fn peer(&self) -> Option<Arc<LoopbackChannel>> {
        self.peer.lock().as_ref().and_then(Weak::upgrade)
    }

    fn link_up(&self) -> Option<Arc<Link>> {
        self.link.upgrade().filter(|link| link.is_up())
    }

    fn wake_peer(&self) {
        if let Some(link) = self.link.upgrade() {
            link.peer_endpoint(self.side).activity.bump();
        }
    }

    fn unregister(&self) {
        if let Some(link) = self.link.upgrade() {
            link.endpoint(self.side).channels.lock().remove(&self.id);
        }
    }

    fn send_close(&self) {
        {
            let mut state = self.state.lock();
            if state.close_sent || !state.opened {
                return;
            }
            state.close_sent = true;
        }
        if let Some(peer) = self.peer() {
            peer.core.push(ChannelEvent::Close);
            self.wake_peer();
        }
    }

    /// Deliver queued events, then settle flow control and the close handshake.
    async fn deliver(&self, stream: Stream) -> Delivered {
        let delivered = self.core.deliver(stream).await;

        if delivered.total_bytes > 0 {
            let unread = self
                .unread
                .fetch_sub(delivered.total_bytes, Ordering::SeqCst)
                .saturating_sub(delivered.total_bytes);
            if let Some(peer) = self.peer()
                && peer.write_blocked.swap(false, Ordering::SeqCst)
            {
                peer.core
                    .push(ChannelEvent::WriteUnblocked(WINDOW_SIZE.saturating_sub(unread)));
                self.wake_peer();
            }
        }

        // A channel is only gone once both sides sent close.
        if self.core.close_delivered() {
            self.send_close();
        }
        delivered
    }

    async fn open_with(&self, kind: ChannelOpenKind) -> Status {
        if self.state.lock().opened {
            return Status::Ok;
        }
        match take_reply(&self.pending_open) {
            ReplyState::Idle => {}
            ReplyState::Waiting => return Status::Again,
            ReplyState::Answered(true) => {
                self.state.lock().opened = true;
                return Status::Ok;
            }
            ReplyState::Answered(false) => {
                self.fail("channel open rejected by peer");
                return Status::Error;
            }
            ReplyState::Lost => {
                self.fail("connection lost while opening channel");
                return Status::Error;
            }
        }

        let Some(link) = self.link_up() else {
            self.fail("not connected");
            return Status::Error;
        };
        let peer_side = match self.side {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        };
        // The endpoint map holds the only strong reference to this end.
        let Some(me) = link.endpoint(self.side).channels.lock().get(&self.id).cloned() else {
            self.fail("channel freed");
            return Status::Error;
        };
        let peer = LoopbackChannel::register(&link, peer_side);
        *peer.peer.lock() = Some(Arc::downgrade(&me));
        *self.peer.lock() = Some(Arc::downgrade(&peer));

        let (tx, rx) = oneshot::channel();
        *self.pending_open.lock() = Some(rx);
        let opened = Arc::downgrade(&peer);
        let asker = Arc::downgrade(link.endpoint(self.side));
        let answer = wake_reply(tx, asker);
        let reply: Reply = Box::new(move |accepted| {
            if let Some(peer) = opened.upgrade() {
                if accepted {
                    peer.state.lock().opened = true;
                } else {
                    peer.unregister();
                }
            }
            answer(accepted);
        });

        let target = link.peer_endpoint(self.side);
        target.messages.push(
            Message::ChannelOpen {
                kind,
                channel: BorrowedChannel::new(peer.clone()),
            },
            reply,
        );
        target.activity.bump();
        Status::Again
    }

    fn request(&self, event: ChannelEvent) -> Status {
        match take_reply(&self.pending_request) {
            ReplyState::Idle => {}
            ReplyState::Waiting => return Status::Again,
            ReplyState::Answered(true) => return Status::Ok,
            ReplyState::Answered(false) => {
                self.fail(format!("{:?} request rejected by peer", event.kind()));
                return Status::Error;
            }
            ReplyState::Lost => {
                self.fail("channel closed before the request was answered");
                return Status::Error;
            }
        }
        if !self.is_open() {
            self.fail("channel is not open");
            return Status::Error;
        }
        let (Some(peer), Some(link)) = (self.peer(), self.link_up()) else {
            self.fail("peer channel is gone");
            return Status::Error;
        };

        let (tx, rx) = oneshot::channel();
        *self.pending_request.lock() = Some(rx);
        peer.core.push_request(
            event,
            wake_reply(tx, Arc::downgrade(link.endpoint(self.side))),
        );
        self.wake_peer();
        Status::Again
    }
}

#[async_trait]
impl ChannelHandle for LoopbackChannel {
    fn id(&self) -> u32 {
        self.id
    }

    fn is_open(&self) -> bool {
        let state = self.state.lock();
        state.opened
            && !state.close_sent
            && !state.freed
            && !self.core.close_delivered()
            && self.link_up().is_some()
    }

    fn is_eof(&self) -> bool {
        self.core.eof_delivered()
    }

    async fn open_session(&self) -> Status {
        self.open_with(ChannelOpenKind::Session).await
    }

    async fn open_forward(
        &self,
        host: &str,
        port: u16,
        originator: &str,
        originator_port: u16,
    ) -> Status {
        self.open_with(ChannelOpenKind::DirectTcpip {
            host: host.to_string(),
            port,
            originator: originator.to_string(),
            originator_port,
        })
        .await
    }

    async fn request_env(&self, name: &str, value: &str) -> Status {
        self.request(ChannelEvent::EnvRequest {
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    async fn request_exec(&self, command: &str) -> Status {
        self.request(ChannelEvent::ExecRequest(command.to_string()))
    }

    async fn request_pty(&self, request: &PtyRequest) -> Status {
        self.request(ChannelEvent::PtyRequest(request.clone()))
    }

    async fn request_shell(&self) -> Status {
        self.request(ChannelEvent::ShellRequest)
    }

    async fn write(&self, data: &[u8], stream: Stream) -> Result<usize, Status> {
        if !self.is_open() || self.state.lock().eof_sent {
            self.fail("channel is not writable");
            return Err(Status::Error);
        }
        let Some(peer) = self.peer() else {
            self.fail("peer channel is gone");
            return Err(Status::Error);
        };
        if data.is_empty() {
            return Ok(0);
        }

        let unread = peer.unread.load(Ordering::SeqCst);
        if unread >= WINDOW_SIZE {
            self.write_blocked.store(true, Ordering::SeqCst);
            // The reader may have drained between the load and the flag.
            if peer.unread.load(Ordering::SeqCst) >= WINDOW_SIZE {
                return Err(Status::Again);
            }
            self.write_blocked.store(false, Ordering::SeqCst);
        }
        let room = WINDOW_SIZE.saturating_sub(peer.unread.load(Ordering::SeqCst));
        if room == 0 {
            return Err(Status::Again);
        }
        let n = data.len().min(room);
        peer.unread.fetch_add(n, Ordering::SeqCst);
        peer.core.push(ChannelEvent::Data {
            data: data[..n].to_vec(),
            stream,
        });
        self.wake_peer();
        Ok(n)
    }

    async fn writable(&self, timeout: Duration) {
        if let Some(link) = self.link.upgrade() {
            let seen = self.seen.load(Ordering::SeqCst);
            let activity = &link.endpoint(self.side).activity;
            if let Some(generation) = activity.wait_past(seen, timeout).await {
                self.seen.store(generation, Ordering::SeqCst);
            }
        }
    }

    async fn send_eof(&self) -> Status {
        if !self.is_open() {
            self.fail("channel is not open");
            return Status::Error;
        }
        {
            let mut state = self.state.lock();
            if state.eof_sent {
                return Status::Ok;
            }
            state.eof_sent = true;
        }
        if let Some(peer) = self.peer() {
            peer.core.push(ChannelEvent::Eof);
            self.wake_peer();
        }
        Status::Ok
    }

    async fn send_exit_status(&self, code: u32) -> Status {
        if !self.is_open() {
            self.fail("channel is not open");
            return Status::Error;
        }
        if let Some(peer) = self.peer() {
            peer.core.push(ChannelEvent::ExitStatus(code as i32));
            self.wake_peer();
        }
        Status::Ok
    }

    async fn close(&self) -> Status {
        if self.state.lock().freed {
            self.fail("channel freed");
            return Status::Error;
        }
        self.send_close();
        self.deliver(Stream::Stdout).await;
        Status::Ok
    }

    fn free(&self) {
        let tell_peer = {
            let mut state = self.state.lock();
            if state.freed {
                return;
            }
            state.freed = true;
            let tell_peer = state.opened && !state.close_sent;
            state.close_sent = true;
            tell_peer
        };
        // Freeing an open channel still tells the peer.
        if tell_peer && let Some(peer) = self.peer() {
            peer.core.push(ChannelEvent::Close);
            self.wake_peer();
        }
        self.core.discard();
        self.unregister();
    }

    async fn poll(&self, stream: Stream) -> PollStatus {
        if self.state.lock().freed {
            return PollStatus::Error;
        }
        let delivered = self.deliver(stream).await;
        if self.core.eof_delivered() {
            PollStatus::Eof
        } else if delivered.events > 0 {
            PollStatus::Ready(delivered.stream_bytes)
        } else if self.link_up().is_none() {
            self.fail("connection closed");
            PollStatus::Error
        } else {
            PollStatus::Idle
        }
    }

    fn set_callbacks(&self, callbacks: Option<Arc<CallbackSet>>) -> Status {
        if self.state.lock().freed {
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

#[derive(Debug)]
struct BindSettings {
    address: String,
    port: u16,
}

/// A loopback listening endpoint.
pub struct LoopbackBind {
    settings: Mutex<BindSettings>,
    bound: Mutex<Option<(String, u16)>>,
    incoming: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Arc<Link>>>>,
    stashed: Mutex<Option<Arc<Link>>>,
    closed: CancellationToken,
    last_error: Mutex<String>,
}

impl LoopbackBind {
    pub fn new() -> Self {
        Self {
            settings: Mutex::new(BindSettings {
                address: "localhost".to_string(),
                port: 0,
            }),
            bound: Mutex::new(None),
            incoming: tokio::sync::Mutex::new(None),
            stashed: Mutex::new(None),
            closed: CancellationToken::new(),
            last_error: Mutex::new(String::new()),
        }
    }

    fn fail(&self, message: impl Into<String>) {
        *self.last_error.lock() = message.into();
    }

    fn allocate_port(address: &str) -> Option<u16> {
        for _ in 0..(u16::MAX - FIRST_EPHEMERAL_PORT) {
            let mut port = NEXT_EPHEMERAL.fetch_add(1, Ordering::SeqCst);
            if port < FIRST_EPHEMERAL_PORT {
                NEXT_EPHEMERAL.store(FIRST_EPHEMERAL_PORT, Ordering::SeqCst);
                port = FIRST_EPHEMERAL_PORT;
            }
            if !LISTENERS.contains_key(&(address.to_string(), port)) {
                return Some(port);
            }
        }
        None
    }
}

impl Default for LoopbackBind {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BindHandle for LoopbackBind {
    async fn listen(&self) -> Status {
        if self.closed.is_cancelled() {
            self.fail("bind handle closed");
            return Status::Error;
        }
        if self.bound.lock().is_some() {
            return Status::Ok;
        }

        let (address, requested) = {
            let settings = self.settings.lock();
            (settings.address.clone(), settings.port)
        };
        let port = match requested {
            0 => match Self::allocate_port(&address) {
                Some(port) => port,
                None => {
                    self.fail("no free loopback port");
                    return Status::Error;
                }
            },
            port => port,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        match LISTENERS.entry((address.clone(), port)) {
            Entry::Occupied(_) => {
                self.fail(format!("address {address}:{port} already in use"));
                return Status::Error;
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        *self.incoming.lock().await = Some(rx);
        *self.bound.lock() = Some((address.clone(), port));
        debug!("loopback listening on {}:{}", address, port);
        Status::Ok
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && self.bound.lock().is_some()
    }

    async fn wait_incoming(&self, timeout: Duration) -> io::Result<bool> {
        if self.closed.is_cancelled() {
            return Err(not_connected("bind handle closed"));
        }
        if self.stashed.lock().is_some() {
            return Ok(true);
        }

        let mut incoming = self.incoming.lock().await;
        let Some(rx) = incoming.as_mut() else {
            return Err(not_connected("not listening"));
        };
        tokio::select! {
            _ = self.closed.cancelled() => Err(not_connected("bind handle closed")),
            received = tokio::time::timeout(timeout, rx.recv()) => match received {
                Err(_) => Ok(false),
                Ok(Some(link)) => {
                    *self.stashed.lock() = Some(link);
                    Ok(true)
                }
                Ok(None) => Err(not_connected("listener registry dropped")),
            },
        }
    }

    async fn accept(&self) -> Option<Arc<dyn Transport>> {
        let link = self.stashed.lock().take()?;
        if link.state() != LinkState::Pending {
            self.fail("client went away before accept");
            return None;
        }
        link.set_state(LinkState::Accepted);
        Some(Arc::new(LoopbackTransport::accepted(link)))
    }

    fn set_option(&self, option: BindOption, value: &OptionValue) -> Status {
        if self.bound.lock().is_some()
            && matches!(option, BindOption::Address | BindOption::Port)
        {
            self.fail("cannot rebind a listening endpoint");
            return Status::Error;
        }
        let mut settings = self.settings.lock();
        match option {
            BindOption::Address => match value.as_str() {
                Some(address) => settings.address = address.to_string(),
                None => return Status::Error,
            },
            BindOption::Port => match port_from(value) {
                Some(port) => settings.port = port,
                None => return Status::Error,
            },
            // Keys, banner and verbosity are accepted but unused in-process.
            BindOption::HostKeyPath
            | BindOption::HostKey
            | BindOption::LogVerbosity
            | BindOption::Banner => {}
        }
        Status::Ok
    }

    fn bound_port(&self) -> Option<u16> {
        self.bound.lock().as_ref().map(|(_, port)| *port)
    }

    fn last_error(&self) -> String {
        self.last_error.lock().clone()
    }

    fn close(&self) {
        self.closed.cancel();
        if let Some(key) = self.bound.lock().take() {
            LISTENERS.remove(&key);
        }
        if let Some(link) = self.stashed.lock().take() {
            link.set_state(LinkState::Refused);
        }
        if let Ok(mut incoming) = self.incoming.try_lock()
            && let Some(mut rx) = incoming.take()
        {
            while let Ok(link) = rx.try_recv() {
                link.set_state(LinkState::Refused);
            }
        }
    }
}

impl Drop for LoopbackBind {
    fn drop(&mut self) {
        if let Some(key) = self.bound.lock().take() {
            LISTENERS.remove(&key);
        }
    }
}
