//! Local port forwarding over `direct-tcpip` channels (RFC 4254).
//!
//! # Architecture
//!
//! A [`Forwarder`] relays bytes between local sockets and channels opened to
//! a remote `host:port`. Two topologies are supported:
//!
//! 1. **Listening**: [`Forwarder::listen`] binds a local TCP port and spawns
//!    an accept loop. Each accepted connection becomes one forwarding client.
//!
//! 2. **Paired**: [`Forwarder::paired`] skips the listener and hands back the
//!    far end of an in-memory duplex stream, for embedding without exposing a
//!    port.
//!
//! Each client owns its socket, a channel and a bridging task. Data flows:
//!
//! - Local socket -> bridging task -> `Channel::write`
//! - Remote -> channel callbacks (delivered by the bridging task's poll loop)
//!   -> local socket
//!
//! Remote EOF closes the local socket and the channel from inside the
//! channel's callback. Local EOF closes the socket, then half-closes and
//! closes the channel.
//!
//! # Feature Gate
//!
//! This module is only compiled when the `port_forward` feature is enabled.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::callbacks::CallbackSet;
use crate::channel::Channel;
use crate::config::FORWARD_CHUNK_SIZE;
use crate::error::{Error, Result, is_transient_io};
use crate::session::Session;
use crate::transport::Stream;
use crate::types::ForwarderInfo;

/// In-memory buffer for a paired forwarder's socket.
const PAIRED_BUFFER_SIZE: usize = 64 * 1024;

/// Write half of a client's local socket. `None` once closed.
type SocketWriter = Arc<tokio::sync::Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>>;

type SocketReader = Box<dyn AsyncRead + Send + Unpin>;

struct ForwardClient {
    channel: Arc<Channel>,
    socket: SocketWriter,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct ForwardShared {
    session: Session,
    remote_host: String,
    remote_port: u16,
    clients: DashMap<u64, ForwardClient>,
    next_client: AtomicU64,
    cancel: CancellationToken,
}

/// Relays local sockets to a remote `host:port` through a session.
pub struct Forwarder {
    id: Uuid,
    shared: Arc<ForwardShared>,
    local_addr: Option<SocketAddr>,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Forwarder {
    /// Bind `interface:local_port` (default `127.0.0.1`) and forward every
    /// accepted connection to `remote_host:remote_port`.
    ///
    /// Port 0 binds an ephemeral port; see [`Forwarder::local_addr`].
    pub async fn listen(
        session: &Session,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
        interface: Option<&str>,
    ) -> Result<Forwarder> {
        let shared = Self::shared(session, remote_host, remote_port)?;

        let listener_addr = format!("{}:{}", interface.unwrap_or("127.0.0.1"), local_port);
        let listener = TcpListener::bind(&listener_addr).await.map_err(|e| {
            Error::InvalidArgument(format!("Failed to bind to {}: {}", listener_addr, e))
        })?;
        let local_addr = listener.local_addr()?;

        let task = tokio::spawn(accept_loop(shared.clone(), listener));
        debug!(
            "Port forwarding active on {} -> {}:{}",
            local_addr, remote_host, remote_port
        );

        Ok(Forwarder::new(shared, Some(local_addr), Some(task)))
    }

    /// Forward a single in-memory socket; returns the local end to use.
    pub async fn paired(
        session: &Session,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<(Forwarder, DuplexStream)> {
        let shared = Self::shared(session, remote_host, remote_port)?;
        let (ours, theirs) = tokio::io::duplex(PAIRED_BUFFER_SIZE);
        shared.add_client(ours, "127.0.0.1".to_string(), 0).await?;
        Ok((Forwarder::new(shared, None, None), theirs))
    }

    fn shared(session: &Session, remote_host: &str, remote_port: u16) -> Result<Arc<ForwardShared>> {
        if !session.is_authenticated() {
            return Err(Error::InvalidState(
                "session must be connected and authenticated".to_string(),
            ));
        }
        Ok(Arc::new(ForwardShared {
            session: session.clone(),
            remote_host: remote_host.to_string(),
            remote_port,
            clients: DashMap::new(),
            next_client: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }))
    }

    fn new(
        shared: Arc<ForwardShared>,
        local_addr: Option<SocketAddr>,
        listener: Option<JoinHandle<()>>,
    ) -> Forwarder {
        Forwarder {
            id: Uuid::new_v4(),
            shared,
            local_addr,
            listener: Mutex::new(listener),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Bound listening address; `None` for a paired forwarder.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_host(&self) -> &str {
        &self.shared.remote_host
    }

    pub fn remote_port(&self) -> u16 {
        self.shared.remote_port
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.len()
    }

    pub fn is_active(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting, then close every client in the order it connected.
    ///
    /// Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.cancel.cancel();
        let listener = self.listener.lock().take();
        if let Some(listener) = listener
            && let Err(e) = listener.await
        {
            warn!("Forwarder {} listener task failed: {}", self.id, e);
        }

        let mut ids: Vec<u64> = self.shared.clients.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        for id in ids {
            if let Some((_, client)) = self.shared.clients.remove(&id) {
                close_client(id, client).await;
            }
        }
        debug!("Forwarder {} closed", self.id);
        Ok(())
    }

    pub fn info(&self) -> ForwarderInfo {
        ForwarderInfo {
            forwarder_id: self.id.to_string(),
            session_id: self.shared.session.id().to_string(),
            local_address: self.local_addr.map(|addr| addr.to_string()),
            remote_address: format!("{}:{}", self.shared.remote_host, self.shared.remote_port),
            active: self.is_active(),
            clients: self.client_count(),
        }
    }
}

impl fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Forwarder")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("remote_host", &self.shared.remote_host)
            .field("remote_port", &self.shared.remote_port)
            .field("clients", &self.client_count())
            .field("active", &self.is_active())
            .finish()
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        // Stops the accept loop and every bridge; channels close on their own drop.
        self.shared.cancel.cancel();
    }
}

impl ForwardShared {
    /// Open a channel for `socket` and start bridging it.
    async fn add_client<S>(
        self: &Arc<Self>,
        socket: S,
        originator: String,
        originator_port: u16,
    ) -> Result<u64>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let channel = Arc::new(Channel::new(&self.session)?);
        let (reader, writer) = tokio::io::split(socket);
        let socket: SocketWriter = Arc::new(tokio::sync::Mutex::new(Some(Box::new(writer))));

        let data_sink = socket.clone();
        let eof_sink = socket.clone();
        let weak = Arc::downgrade(&channel);
        channel.set_callbacks(Some(
            CallbackSet::new()
                .on_data(move |data, _stream| {
                    let sink = data_sink.clone();
                    async move { write_local(&sink, &data).await }
                })
                .on_eof(move || {
                    let sink = eof_sink.clone();
                    let weak = weak.clone();
                    async move {
                        shutdown_local(&sink).await;
                        if let Some(channel) = weak.upgrade() {
                            let _ = channel.close(true).await;
                        }
                    }
                }),
        ))?;

        if let Err(e) = channel
            .open_forward(&self.remote_host, self.remote_port, &originator, originator_port)
            .await
        {
            let _ = channel.close(true).await;
            return Err(e);
        }

        let id = self.next_client.fetch_add(1, Ordering::SeqCst);
        let cancel = self.cancel.child_token();
        let task = tokio::spawn(supervise(
            id,
            channel.clone(),
            Box::new(reader),
            socket.clone(),
            cancel.clone(),
        ));
        self.clients.insert(
            id,
            ForwardClient {
                channel,
                socket,
                cancel,
                task,
            },
        );
        // A close that started while this client was being set up may have
        // missed it; whoever removes the entry tears it down.
        if self.cancel.is_cancelled() {
            if let Some((_, client)) = self.clients.remove(&id) {
                close_client(id, client).await;
            }
            return Err(Error::InvalidState("forwarder closed".to_string()));
        }
        debug!(
            "Forward client {} from {}:{} -> {}:{}",
            id, originator, originator_port, self.remote_host, self.remote_port
        );
        Ok(id)
    }
}

async fn accept_loop(shared: Arc<ForwardShared>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, client_addr)) => {
                    debug!("New connection from {} to forwarded port", client_addr);
                    // Opening the channel is a round trip; keep accepting meanwhile.
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = shared
                            .add_client(stream, client_addr.ip().to_string(), client_addr.port())
                            .await
                        {
                            warn!("Failed to forward connection from {}: {}", client_addr, e);
                        }
                    });
                }
                Err(e) if is_transient_io(&e) => continue,
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    break;
                }
            }
        }
    }
    debug!("Forwarder accept loop stopped");
}

async fn supervise(
    id: u64,
    channel: Arc<Channel>,
    reader: SocketReader,
    socket: SocketWriter,
    cancel: CancellationToken,
) {
    if let Err(e) = bridge(&channel, reader, &socket, &cancel).await {
        error!("Forward client {} failed: {}", id, e);
    }
}

async fn bridge(
    channel: &Channel,
    mut reader: SocketReader,
    socket: &SocketWriter,
    cancel: &CancellationToken,
) -> Result<()> {
    let upstream = async {
        let mut buf = vec![0u8; FORWARD_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if !channel.is_writable() {
                        warn!("Dropping {} bytes: forwarded channel is closed", n);
                        continue;
                    }
                    if let Err(e) = channel.write(&buf[..n], Stream::Stdout).await {
                        warn!("Dropping {} bytes: {}", n, e);
                    }
                }
                Err(e) if is_transient_io(&e) => continue,
                Err(e) => return Err(Error::from(e)),
            }
        }

        // Local EOF.
        shutdown_local(socket).await;
        if channel.is_writable() {
            channel.closewrite(true).await?;
        }
        channel.close(true).await
    };

    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        outcome = channel.poll_loop(false) => {
            debug!("Forwarded channel finished: {:?}", outcome?);
            Ok(())
        }
        result = upstream => result,
    }
}

async fn write_local(socket: &SocketWriter, data: &[u8]) {
    let mut guard = socket.lock().await;
    let Some(writer) = guard.as_mut() else {
        debug!("Dropping {} bytes: local socket is closed", data.len());
        return;
    };
    if let Err(e) = writer.write_all(data).await {
        debug!("Local write failed: {}", e);
        guard.take();
    }
}

/// Close the local socket. A socket that is already gone counts as closed.
async fn shutdown_local(socket: &SocketWriter) {
    let taken = socket.lock().await.take();
    if let Some(mut writer) = taken
        && let Err(e) = writer.shutdown().await
    {
        debug!("Local socket shutdown failed: {}", e);
    }
}

/// Stop the bridge first so nothing is holding the socket, then tear down.
async fn close_client(id: u64, client: ForwardClient) {
    client.cancel.cancel();
    if let Err(e) = client.task.await {
        warn!("Forward client {} task failed: {}", id, e);
    }
    shutdown_local(&client.socket).await;
    if let Err(e) = client.channel.close(true).await {
        warn!("Forward client {} channel close failed: {}", id, e);
    }
    debug!("Forward client {} closed", id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requires_authenticated_session() {
        let session = Session::loopback();
        let err = Forwarder::paired(&session, "db.internal", 5432)
            .await
            .unwrap_err();
        assert!(err.is_usage());

        let err = Forwarder::listen(&session, 0, "db.internal", 5432, None)
            .await
            .unwrap_err();
        assert!(err.is_usage());
    }

    #[tokio::test]
    async fn test_shutdown_tolerates_missing_socket() {
        let socket: SocketWriter = Arc::new(tokio::sync::Mutex::new(None));
        shutdown_local(&socket).await;
        write_local(&socket, b"dropped").await;
        assert!(socket.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_write_local_reaches_peer() {
        let (ours, mut theirs) = tokio::io::duplex(64);
        let (_reader, writer) = tokio::io::split(ours);
        let socket: SocketWriter = Arc::new(tokio::sync::Mutex::new(Some(Box::new(writer))));

        write_local(&socket, b"hello").await;
        shutdown_local(&socket).await;

        let mut received = Vec::new();
        theirs.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello");
    }
}
