//! Event queues shared by the engines.
//!
//! Engines receive protocol events on their own tasks and push them here.
//! Nothing reaches user callbacks until the owning side polls a channel,
//! closes it, or processes session events; that keeps callback execution on
//! the caller's stack, where channel operations may re-enter.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::callbacks::{AuthAttempt, CallbackSet, ChannelEvent, Message, MessageCallback};
use crate::lock::ReentrantLock;
use crate::transport::{AuthMethods, Stream};

/// Sends an accept/reject answer back to whoever asked.
pub(crate) type Reply = Box<dyn FnOnce(bool) + Send>;

/// Wake-up signal for `Transport::wait_ready`.
#[derive(Debug)]
pub(crate) struct Activity {
    tx: watch::Sender<u64>,
}

impl Activity {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx }
    }

    pub(crate) fn bump(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    pub(crate) fn generation(&self) -> u64 {
        *self.tx.borrow()
    }

    /// Wait until the generation differs from `seen`; returns the new one,
    /// or `None` on timeout.
    ///
    /// Waiters pass the generation they last observed, so a bump that lands
    /// between a failed attempt and the wait is not lost.
    pub(crate) async fn wait_past(&self, seen: u64, timeout: Duration) -> Option<u64> {
        let mut rx = self.tx.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|generation| *generation != seen)).await {
            Ok(Ok(generation)) => Some(*generation),
            _ => None,
        }
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

struct Queued {
    event: ChannelEvent,
    reply: Option<Reply>,
}

/// Counts from one delivery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Delivered {
    pub events: usize,
    /// Data bytes on the polled stream.
    pub stream_bytes: usize,
    /// Data bytes on both streams.
    pub total_bytes: usize,
}

/// Per-channel event queue and callback slot.
pub(crate) struct ChannelCore {
    queue: Mutex<VecDeque<Queued>>,
    callbacks: RwLock<Option<Arc<CallbackSet>>>,
    dispatch: ReentrantLock,
    eof_delivered: AtomicBool,
    close_delivered: AtomicBool,
}

impl ChannelCore {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            callbacks: RwLock::new(None),
            dispatch: ReentrantLock::new(),
            eof_delivered: AtomicBool::new(false),
            close_delivered: AtomicBool::new(false),
        }
    }

    pub(crate) fn push(&self, event: ChannelEvent) {
        self.queue.lock().push_back(Queued { event, reply: None });
    }

    pub(crate) fn push_request(&self, event: ChannelEvent, reply: Reply) {
        self.queue.lock().push_back(Queued {
            event,
            reply: Some(reply),
        });
    }

    pub(crate) fn dispatch_lock(&self) -> &ReentrantLock {
        &self.dispatch
    }

    pub(crate) fn set_callbacks(&self, callbacks: Option<Arc<CallbackSet>>) {
        *self.callbacks.write() = callbacks;
    }

    pub(crate) fn eof_delivered(&self) -> bool {
        self.eof_delivered.load(Ordering::SeqCst)
    }

    pub(crate) fn close_delivered(&self) -> bool {
        self.close_delivered.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn has_pending(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    /// Deliver queued events in order.
    ///
    /// One delivery pass runs at a time; a callback that re-enters (for
    /// example by closing the channel) continues the same pass.
    pub(crate) async fn deliver(&self, stream: Stream) -> Delivered {
        self.dispatch
            .locked(async {
                let mut delivered = Delivered::default();
                loop {
                    let Some(Queued { event, reply }) = self.queue.lock().pop_front() else {
                        break;
                    };
                    delivered.events += 1;

                    match &event {
                        ChannelEvent::Data { data, stream: on } => {
                            delivered.total_bytes += data.len();
                            if *on == stream {
                                delivered.stream_bytes += data.len();
                            }
                        }
                        ChannelEvent::Eof => self.eof_delivered.store(true, Ordering::SeqCst),
                        ChannelEvent::Close => self.close_delivered.store(true, Ordering::SeqCst),
                        _ => {}
                    }

                    let callbacks = self.callbacks.read().clone();
                    let answer = match callbacks {
                        Some(callbacks) => callbacks.dispatch(event).await,
                        None if event.is_request() => Some(false),
                        None => None,
                    };
                    if let Some(reply) = reply {
                        reply(answer.unwrap_or(false));
                    }
                }
                delivered
            })
            .await
    }

    /// Reject every queued request, drop the rest, and release the callbacks.
    ///
    /// Callbacks commonly capture a handle to their own channel; clearing
    /// them here breaks that cycle once the channel is gone.
    pub(crate) fn discard(&self) {
        self.set_callbacks(None);
        let drained: Vec<Queued> = self.queue.lock().drain(..).collect();
        for queued in drained {
            if let Some(reply) = queued.reply {
                reply(false);
            }
        }
    }
}

struct PendingMessage {
    message: Message,
    reply: Reply,
}

/// Session-level requests waiting for a server's message callback.
pub(crate) struct MessageQueue {
    queue: Mutex<VecDeque<PendingMessage>>,
    callback: RwLock<Option<MessageCallback>>,
    methods: RwLock<AuthMethods>,
}

impl MessageQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            callback: RwLock::new(None),
            methods: RwLock::new(AuthMethods::default()),
        }
    }

    pub(crate) fn push(&self, message: Message, reply: Reply) {
        self.queue.lock().push_back(PendingMessage { message, reply });
    }

    pub(crate) fn set_callback(&self, callback: Option<MessageCallback>) {
        *self.callback.write() = callback;
    }

    pub(crate) fn set_methods(&self, methods: AuthMethods) {
        *self.methods.write() = methods;
    }

    pub(crate) fn methods(&self) -> AuthMethods {
        *self.methods.read()
    }

    pub(crate) fn allows(&self, attempt: &AuthAttempt) -> bool {
        let required = match attempt {
            AuthAttempt::None => AuthMethods::NONE,
            AuthAttempt::Password(_) => AuthMethods::PASSWORD,
            AuthAttempt::PublicKey { .. } => AuthMethods::PUBLIC_KEY,
        };
        self.methods().contains(required)
    }

    /// Answer every queued message. Unhandled messages are rejected.
    pub(crate) async fn deliver(&self) -> usize {
        let mut delivered = 0;
        loop {
            let Some(PendingMessage { message, reply }) = self.queue.lock().pop_front() else {
                break;
            };
            delivered += 1;

            if let Message::Auth { attempt, .. } = &message
                && !self.allows(attempt)
            {
                reply(false);
                continue;
            }

            // Read without holding the lock across the await.
            let callback = self.callback.read().clone();
            let accepted = match callback {
                Some(callback) => callback(message).await,
                None => false,
            };
            reply(accepted);
        }
        delivered
    }

    pub(crate) fn discard(&self) {
        let drained: Vec<PendingMessage> = self.queue.lock().drain(..).collect();
        for pending in drained {
            (pending.reply)(false);
        }
    }
}
