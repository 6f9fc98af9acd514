//! Drive several sessions from one task.
//!
//! An [`EventLoop`] holds a set of sessions and, on each [`poll`](EventLoop::poll),
//! delivers whatever each one has buffered. When nothing was pending it
//! suspends until any session sees activity or the timeout passes.

use std::time::Duration;

use futures::FutureExt;
use futures::future::select_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::session::Session;

#[derive(Default)]
pub struct EventLoop {
    sessions: Mutex<Vec<Session>>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. Adding the same session twice is a no-op.
    pub fn add_session(&self, session: &Session) -> Result<()> {
        if session.is_closed() {
            return Err(Error::InvalidState(
                "cannot add a closed session to an event loop".to_string(),
            ));
        }
        let mut sessions = self.sessions.lock();
        if !sessions.iter().any(|s| s.id() == session.id()) {
            sessions.push(session.clone());
        }
        Ok(())
    }

    /// Remove a session. Removing one that was never added is tolerated.
    pub fn remove_session(&self, session: &Session) -> bool {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|s| s.id() != session.id());
        let removed = sessions.len() != before;
        if !removed {
            debug!("Session {} was not in the event loop", session.id());
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// One pass over every session; returns how many delivered events.
    ///
    /// Closed sessions are dropped from the loop. A session whose event
    /// processing fails is dropped and the failure logged.
    pub async fn poll(&self, timeout: Duration) -> Result<usize> {
        let sessions: Vec<Session> = self.sessions.lock().clone();
        let mut active = 0;
        for session in &sessions {
            if session.is_closed() {
                self.remove_session(session);
                continue;
            }
            match session.process_events().await {
                Ok(true) => active += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Session {}: {}; removing from event loop", session.id(), e);
                    self.remove_session(session);
                }
            }
        }

        if active == 0 {
            let waiting: Vec<_> = self
                .sessions
                .lock()
                .iter()
                .map(|session| {
                    let session = session.clone();
                    async move { session.wait().await }.boxed()
                })
                .collect();
            if waiting.is_empty() {
                tokio::time::sleep(timeout).await;
            } else {
                let _ = tokio::time::timeout(timeout, select_all(waiting)).await;
            }
        }
        Ok(active)
    }

    /// Poll until cancelled or no sessions remain.
    pub async fn run(&self, cancel: CancellationToken, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(Error::InvalidArgument(
                "poll timeout must be positive".to_string(),
            ));
        }
        while !cancel.is_cancelled() && !self.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.poll(timeout) => { result?; }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_is_idempotent() {
        let events = EventLoop::new();
        let session = Session::loopback();
        events.add_session(&session).unwrap();
        events.add_session(&session.clone()).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_remove_unknown_session_is_tolerated() {
        let events = EventLoop::new();
        let session = Session::loopback();
        assert!(!events.remove_session(&session));
        events.add_session(&session).unwrap();
        assert!(events.remove_session(&session));
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_closed_session_rejected() {
        let events = EventLoop::new();
        let session = Session::loopback();
        session.close().await.unwrap();
        assert!(events.add_session(&session).unwrap_err().is_usage());
    }

    #[tokio::test]
    async fn test_unconnected_session_dropped_on_poll() {
        let events = EventLoop::new();
        let session = Session::loopback();
        events.add_session(&session).unwrap();
        let delivered = events.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(delivered, 0);
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_run_rejects_zero_timeout() {
        let events = EventLoop::new();
        let err = events
            .run(CancellationToken::new(), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.is_usage());
    }
}
