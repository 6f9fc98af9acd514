//! Channels: one multiplexed stream on a session.
//!
//! [`Channel`] owns its engine handle. It registers with its [`Session`] on
//! creation and is closed by the session on disconnect if still open.
//! Dropping a `Channel` schedules the same teardown on the runtime.
//!
//! [`BorrowedChannel`] is what a server's message callback receives for an
//! incoming channel. The server session owns the underlying channel, so a
//! borrowed channel can write, half-close, report an exit status and install
//! callbacks, but it has no `close`:
//!
//! ```compile_fail
//! fn close_borrowed(channel: sshplex::BorrowedChannel) {
//!     let _ = channel.close(false);
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::callbacks::CallbackSet;
use crate::config;
use crate::error::{Error, Result};
use crate::logging::defer_warn;
use crate::session::Session;
use crate::transport::{ChannelHandle, PollStatus, PtyRequest, Retryable, Status, Stream};

/// How [`Channel::poll_loop`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The remote side sent EOF.
    Eof,
    /// The channel or its session closed.
    Closed,
    /// The engine reported an error; carries its last error string.
    Error(String),
}

/// State shared between a [`Channel`] and the session that tracks it.
pub(crate) struct ChannelInner {
    handle: RwLock<Option<Arc<dyn ChannelHandle>>>,
    session: Session,
    local_eof: AtomicBool,
    has_callbacks: AtomicBool,
}

/// An owning channel.
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Allocate a channel on a connected, authenticated session.
    ///
    /// The channel is not open yet: call [`Channel::open_session`] or
    /// [`Channel::open_forward`].
    pub fn new(session: &Session) -> Result<Channel> {
        let transport = session.transport()?;
        if !transport.is_connected() || !transport.is_authenticated() {
            return Err(Error::InvalidState(
                "session must be connected and authenticated".to_string(),
            ));
        }
        let handle = transport
            .new_channel()
            .ok_or(Error::Allocation("channel"))?;

        let inner = Arc::new(ChannelInner {
            handle: RwLock::new(Some(handle)),
            session: session.clone(),
            local_eof: AtomicBool::new(false),
            has_callbacks: AtomicBool::new(false),
        });
        session.track(&inner);
        Ok(Channel { inner })
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Engine channel id, while a handle is held.
    pub fn id(&self) -> Option<u32> {
        self.inner.handle_opt().map(|handle| handle.id())
    }

    /// True until the channel has been closed and its handle released.
    pub fn is_assigned(&self) -> bool {
        self.inner.handle_opt().is_some()
    }

    pub fn is_open(&self) -> bool {
        self.inner
            .handle_opt()
            .is_some_and(|handle| handle.is_open())
    }

    /// True once the remote EOF has been delivered.
    pub fn is_eof(&self) -> bool {
        self.inner
            .handle_opt()
            .is_some_and(|handle| handle.is_eof())
    }

    /// Open and not half-closed by this side.
    pub fn is_writable(&self) -> bool {
        self.is_open() && !self.inner.local_eof.load(Ordering::SeqCst)
    }

    /// Open an interactive session channel.
    pub async fn open_session(&self) -> Result<()> {
        let handle = self.inner.handle()?;
        let status = self.inner.session.retry(|| handle.open_session()).await?;
        expect_ok(status, "open_session", &handle)
    }

    /// Open a direct-tcpip channel to `host:port` as seen from the server.
    pub async fn open_forward(
        &self,
        host: &str,
        port: u16,
        originator: &str,
        originator_port: u16,
    ) -> Result<()> {
        let handle = self.inner.handle()?;
        let status = self
            .inner
            .session
            .retry(|| handle.open_forward(host, port, originator, originator_port))
            .await?;
        expect_ok(status, "open_forward", &handle)
    }

    /// Set an environment variable for the remote command.
    ///
    /// OpenSSH drops variables not listed in `AcceptEnv`; the error says so.
    pub async fn request_env(&self, name: &str, value: &str) -> Result<()> {
        let handle = self.inner.handle()?;
        let status = self
            .inner
            .session
            .retry(|| handle.request_env(name, value))
            .await?;
        if status == Status::Ok {
            return Ok(());
        }
        Err(Error::protocol(
            "request_env",
            format!(
                "{}; the server may need `AcceptEnv {}` in its sshd_config",
                handle.last_error(),
                name
            ),
        ))
    }

    pub async fn request_exec(&self, command: &str) -> Result<()> {
        let handle = self.inner.handle()?;
        let status = self
            .inner
            .session
            .retry(|| handle.request_exec(command))
            .await?;
        expect_ok(status, "request_exec", &handle)
    }

    pub async fn request_pty(&self, request: &PtyRequest) -> Result<()> {
        let handle = self.inner.handle()?;
        let status = self
            .inner
            .session
            .retry(|| handle.request_pty(request))
            .await?;
        expect_ok(status, "request_pty", &handle)
    }

    pub async fn request_shell(&self) -> Result<()> {
        let handle = self.inner.handle()?;
        let status = self.inner.session.retry(|| handle.request_shell()).await?;
        expect_ok(status, "request_shell", &handle)
    }

    /// Write all of `data`, waiting on the session while the window is full.
    ///
    /// Returns `data.len()` on success.
    pub async fn write(&self, data: &[u8], stream: Stream) -> Result<usize> {
        let handle = self.inner.handle()?;
        if !self.is_writable() {
            return Err(Error::InvalidState("channel is not writable".to_string()));
        }

        let mut written = 0;
        while written < data.len() {
            let rest = &data[written..];
            let result = self
                .inner
                .session
                .retry(|| handle.write(rest, stream))
                .await?;
            match result {
                Ok(0) | Err(_) => return Err(Error::protocol("write", handle.last_error())),
                Ok(n) => written += n,
            }
        }
        trace!("channel {}: wrote {} bytes", handle.id(), written);
        Ok(written)
    }

    /// Half-close: send EOF to the remote side.
    ///
    /// A second call is a no-op. With `allow_fail` a failure is logged
    /// instead of returned.
    pub async fn closewrite(&self, allow_fail: bool) -> Result<()> {
        if self.inner.local_eof.load(Ordering::SeqCst) {
            return Ok(());
        }
        let handle = self.inner.handle()?;
        if !self.is_writable() {
            return Err(Error::InvalidState("channel is not writable".to_string()));
        }

        let status = self.inner.session.retry(|| handle.send_eof()).await?;
        if status == Status::Ok {
            self.inner.local_eof.store(true, Ordering::SeqCst);
            return Ok(());
        }
        let error = Error::protocol("closewrite", handle.last_error());
        if allow_fail {
            defer_warn("closewrite", error);
            Ok(())
        } else {
            Err(error)
        }
    }

    /// Close the channel and release its handle. Idempotent.
    ///
    /// May be called from inside this channel's own callbacks.
    pub async fn close(&self, allow_fail: bool) -> Result<()> {
        self.inner.close(allow_fail).await
    }

    /// Deliver events until the remote EOF, a close, or an error.
    ///
    /// Each pass polls stdout, then stderr. With `throw_on_error` an engine
    /// error is returned as `Err`; otherwise as [`PollOutcome::Error`].
    pub async fn poll_loop(&self, throw_on_error: bool) -> Result<PollOutcome> {
        loop {
            let mut finished = None;
            for stream in [Stream::Stdout, Stream::Stderr] {
                let Some(handle) = self.inner.handle_opt() else {
                    return Ok(PollOutcome::Closed);
                };
                if !handle.is_open() {
                    return Ok(PollOutcome::Closed);
                }
                match handle.poll(stream).await {
                    PollStatus::Eof => {
                        finished = Some(PollOutcome::Eof);
                        break;
                    }
                    PollStatus::Error => {
                        finished = Some(PollOutcome::Error(handle.last_error()));
                        break;
                    }
                    PollStatus::Ready(_) | PollStatus::Idle => {}
                }
            }

            match finished {
                Some(PollOutcome::Error(message)) if throw_on_error => {
                    return Err(Error::protocol("poll", message));
                }
                Some(outcome) => return Ok(outcome),
                None => {}
            }

            if !self.inner.session.is_connected() {
                return Ok(PollOutcome::Closed);
            }
            if let Err(e) = self.inner.session.wait().await {
                if throw_on_error {
                    return Err(e);
                }
                return Ok(PollOutcome::Error(e.to_string()));
            }
        }
    }

    /// Install a callback set, detaching the previous one first.
    pub fn set_callbacks(&self, callbacks: Option<CallbackSet>) -> Result<()> {
        let handle = self.inner.handle()?;
        install_callbacks(&handle, &self.inner.has_callbacks, callbacks)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("open", &self.is_open())
            .field("local_eof", &self.inner.local_eof.load(Ordering::SeqCst))
            .finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.inner.handle_opt().is_none() {
            return;
        }
        let inner = self.inner.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let _ = inner.close(true).await;
                });
            }
            Err(_) => {
                // No runtime to close on: release the handle only, and only
                // if no delivery pass is using it.
                let Some(handle) = inner.handle_opt() else {
                    return;
                };
                let Some(_guard) = handle.dispatch_lock().try_lock() else {
                    return;
                };
                if let Some(handle) = inner.handle.write().take() {
                    handle.free();
                }
                inner.session.untrack(&inner);
            }
        }
    }
}

impl ChannelInner {
    fn handle_opt(&self) -> Option<Arc<dyn ChannelHandle>> {
        self.handle.read().clone()
    }

    fn handle(&self) -> Result<Arc<dyn ChannelHandle>> {
        self.handle_opt()
            .ok_or_else(|| Error::InvalidState("channel is closed".to_string()))
    }

    /// Close under the handle's dispatch lock.
    ///
    /// 1. Nothing to do without a handle.
    /// 2. Stop being tracked by the session.
    /// 3. On a disconnected session the handle went with the transport.
    /// 4. Otherwise send EOF (unless already sent) and close.
    /// 5. Release the handle.
    ///
    /// Callbacks run under the same lock, so a close started from a callback
    /// re-enters here while a close from another task waits for the delivery
    /// pass to finish.
    pub(crate) async fn close(self: &Arc<Self>, allow_fail: bool) -> Result<()> {
        let Some(handle) = self.handle_opt() else {
            return Ok(());
        };
        handle
            .dispatch_lock()
            .locked(async {
                // Someone else may have closed us while we waited.
                let Some(handle) = self.handle_opt() else {
                    return Ok(());
                };

                self.session.untrack(self);

                if !self.session.is_connected() {
                    let released = self.handle.write().take();
                    if let Some(handle) = released {
                        handle.free();
                    }
                    return Ok(());
                }

                let mut result = Ok(());
                if handle.is_open() && !self.local_eof.load(Ordering::SeqCst) {
                    match self.session.retry(|| handle.send_eof()).await {
                        Ok(Status::Ok) => self.local_eof.store(true, Ordering::SeqCst),
                        Ok(_) => result = Err(Error::protocol("close", handle.last_error())),
                        Err(e) => result = Err(e),
                    }
                }
                // A callback may have closed us re-entrantly during send_eof.
                if result.is_ok() && handle.is_open() {
                    match self.session.retry(|| handle.close()).await {
                        Ok(Status::Ok) => {}
                        Ok(_) => result = Err(Error::protocol("close", handle.last_error())),
                        Err(e) => result = Err(e),
                    }
                }

                let released = self.handle.write().take();
                if let Some(handle) = released {
                    debug!("channel {} closed", handle.id());
                    handle.set_callbacks(None);
                    handle.free();
                }

                match result {
                    Err(e) if allow_fail => {
                        defer_warn("channel close", e);
                        Ok(())
                    }
                    other => other,
                }
            })
            .await
    }

    pub(crate) fn is_open(&self) -> bool {
        self.handle_opt().is_some_and(|handle| handle.is_open())
    }
}

/// A non-owning view of a channel that belongs to a server session.
#[derive(Clone)]
pub struct BorrowedChannel {
    handle: Arc<dyn ChannelHandle>,
    local_eof: Arc<AtomicBool>,
    has_callbacks: Arc<AtomicBool>,
    wait_timeout: Duration,
}

impl BorrowedChannel {
    pub(crate) fn new(handle: Arc<dyn ChannelHandle>) -> Self {
        Self {
            handle,
            local_eof: Arc::new(AtomicBool::new(false)),
            has_callbacks: Arc::new(AtomicBool::new(false)),
            wait_timeout: config::resolve_wait_timeout(None),
        }
    }

    pub fn id(&self) -> u32 {
        self.handle.id()
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    pub fn is_eof(&self) -> bool {
        self.handle.is_eof()
    }

    pub fn is_writable(&self) -> bool {
        self.is_open() && !self.local_eof.load(Ordering::SeqCst)
    }

    /// Write all of `data`; returns `data.len()`.
    pub async fn write(&self, data: &[u8], stream: Stream) -> Result<usize> {
        if !self.is_writable() {
            return Err(Error::InvalidState("channel is not writable".to_string()));
        }
        let mut written = 0;
        while written < data.len() {
            let rest = &data[written..];
            match self.retry(|| self.handle.write(rest, stream)).await {
                Ok(0) | Err(_) => {
                    return Err(Error::protocol("write", self.handle.last_error()));
                }
                Ok(n) => written += n,
            }
        }
        Ok(written)
    }

    /// Send EOF. A second call is a no-op.
    pub async fn closewrite(&self, allow_fail: bool) -> Result<()> {
        if self.local_eof.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !self.is_writable() {
            return Err(Error::InvalidState("channel is not writable".to_string()));
        }
        if self.retry(|| self.handle.send_eof()).await == Status::Ok {
            self.local_eof.store(true, Ordering::SeqCst);
            return Ok(());
        }
        let error = Error::protocol("closewrite", self.handle.last_error());
        if allow_fail {
            defer_warn("closewrite", error);
            Ok(())
        } else {
            Err(error)
        }
    }

    /// Report the exit status of the command run on this channel.
    pub async fn send_exit_status(&self, code: u32) -> Result<()> {
        let status = self.retry(|| self.handle.send_exit_status(code)).await;
        expect_ok(status, "send_exit_status", &self.handle)
    }

    pub fn set_callbacks(&self, callbacks: Option<CallbackSet>) -> Result<()> {
        install_callbacks(&self.handle, &self.has_callbacks, callbacks)
    }

    /// Borrowed channels have no session to wait on; they wait for the
    /// write window instead.
    async fn retry<S, F, Fut>(&self, mut op: F) -> S
    where
        S: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = S>,
    {
        loop {
            let status = op().await;
            if !status.is_again() || !self.handle.is_open() {
                return status;
            }
            self.handle.writable(self.wait_timeout).await;
        }
    }
}

impl fmt::Debug for BorrowedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BorrowedChannel")
            .field("id", &self.id())
            .field("open", &self.is_open())
            .finish()
    }
}

fn expect_ok(status: Status, operation: &'static str, handle: &Arc<dyn ChannelHandle>) -> Result<()> {
    match status {
        Status::Ok => Ok(()),
        _ => Err(Error::protocol(operation, handle.last_error())),
    }
}

fn install_callbacks(
    handle: &Arc<dyn ChannelHandle>,
    installed: &AtomicBool,
    callbacks: Option<CallbackSet>,
) -> Result<()> {
    if installed.load(Ordering::SeqCst) && handle.set_callbacks(None) != Status::Ok {
        return Err(Error::protocol("set_callbacks", handle.last_error()));
    }
    installed.store(false, Ordering::SeqCst);

    let Some(callbacks) = callbacks else {
        return Ok(());
    };
    if handle.set_callbacks(Some(Arc::new(callbacks))) != Status::Ok {
        return Err(Error::protocol("set_callbacks", handle.last_error()));
    }
    installed.store(true, Ordering::SeqCst);
    Ok(())
}

// The owning channel needs a live session; its behavior is covered by the
// integration tests. These exercise the borrowed view directly on an engine.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::LoopbackChannel;

    mod borrowed {
        use super::*;

        #[tokio::test]
        async fn test_unopened_channel_not_writable() {
            let channel = BorrowedChannel::new(Arc::new(LoopbackChannel::detached()));
            assert!(!channel.is_writable());
            let err = channel.write(b"x", Stream::Stdout).await.unwrap_err();
            assert!(err.is_usage());
            let err = channel.closewrite(false).await.unwrap_err();
            assert!(err.is_usage());
        }

        #[tokio::test]
        async fn test_detach_without_callbacks_is_ok() {
            let channel = BorrowedChannel::new(Arc::new(LoopbackChannel::detached()));
            channel.set_callbacks(None).unwrap();
            channel.set_callbacks(Some(CallbackSet::new())).unwrap();
            channel.set_callbacks(None).unwrap();
        }
    }

    #[test]
    fn test_poll_outcome_equality() {
        assert_eq!(PollOutcome::Eof, PollOutcome::Eof);
        assert_ne!(PollOutcome::Eof, PollOutcome::Closed);
        assert_eq!(
            PollOutcome::Error("gone".into()),
            PollOutcome::Error("gone".into())
        );
    }
}
