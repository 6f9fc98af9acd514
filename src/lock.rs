//! A re-entrant async lock.
//!
//! Closing a channel can fire callbacks that close the same channel again on
//! the same logical call stack. A plain mutex would deadlock there, so each
//! channel's callback delivery and its close share one [`ReentrantLock`]
//! (see [`crate::transport::ChannelHandle::dispatch_lock`]): ownership is keyed by a task-local
//! "logical owner" id established on first acquisition, and every future
//! awaited inside that scope (callbacks included) re-enters freely. Work
//! spawned onto other tasks gets its own identity and waits like any other
//! contender.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

tokio::task_local! {
    static OWNER: u64;
}

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

fn current_owner() -> Option<u64> {
    OWNER.try_with(|owner| *owner).ok()
}

fn next_owner() -> u64 {
    NEXT_OWNER.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Default)]
struct State {
    owner: Option<u64>,
    depth: usize,
}

/// An async lock that its current logical owner may take again.
#[derive(Debug, Default)]
pub struct ReentrantLock {
    state: Mutex<State>,
    released: Notify,
}

/// Releases one level of ownership on drop.
#[derive(Debug)]
pub struct ReentrantGuard<'a> {
    lock: &'a ReentrantLock,
}

impl Drop for ReentrantGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.lock.released.notify_waiters();
        }
    }
}

impl ReentrantLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_acquire_as(&self, owner: u64) -> Option<ReentrantGuard<'_>> {
        let mut state = self.state.lock();
        match state.owner {
            None => {
                state.owner = Some(owner);
                state.depth = 1;
            }
            Some(current) if current == owner => state.depth += 1,
            Some(_) => return None,
        }
        Some(ReentrantGuard { lock: self })
    }

    async fn acquire_as(&self, owner: u64) -> ReentrantGuard<'_> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed.
            notified.as_mut().enable();

            if let Some(guard) = self.try_acquire_as(owner) {
                return guard;
            }
            notified.await;
        }
    }

    /// Run `fut` while holding the lock.
    ///
    /// Re-entrant on the current logical owner: a nested `locked` call awaited
    /// inside `fut` acquires immediately.
    pub async fn locked<F: Future>(&self, fut: F) -> F::Output {
        match current_owner() {
            Some(owner) => {
                let _guard = self.acquire_as(owner).await;
                fut.await
            }
            None => {
                let owner = next_owner();
                OWNER
                    .scope(owner, async {
                        let _guard = self.acquire_as(owner).await;
                        fut.await
                    })
                    .await
            }
        }
    }

    /// Acquire without waiting. Fails if another owner holds the lock.
    ///
    /// Outside an owner scope a fresh identity is used, so this only
    /// succeeds when the lock is free.
    pub fn try_lock(&self) -> Option<ReentrantGuard<'_>> {
        let owner = current_owner().unwrap_or_else(next_owner);
        self.try_acquire_as(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn is_held(lock: &ReentrantLock) -> bool {
        lock.state.lock().owner.is_some()
    }

    mod reentrancy {
        use super::*;

        #[tokio::test]
        async fn test_nested_lock_on_same_stack() {
            let lock = ReentrantLock::new();
            let value = lock
                .locked(async {
                    lock.locked(async { lock.locked(async { 42 }).await })
                        .await
                })
                .await;
            assert_eq!(value, 42);
            assert!(!is_held(&lock));
        }

        #[tokio::test]
        async fn test_try_lock_reenters_inside_scope() {
            let lock = ReentrantLock::new();
            lock.locked(async {
                assert!(lock.try_lock().is_some());
            })
            .await;
        }

        #[tokio::test]
        async fn test_boxed_callback_reenters() {
            let lock = Arc::new(ReentrantLock::new());
            let inner = lock.clone();
            let callback: futures::future::BoxFuture<'static, bool> = Box::pin(async move {
                inner.locked(async { true }).await
            });
            assert!(lock.locked(callback).await);
        }
    }

    mod exclusion {
        use super::*;

        #[tokio::test]
        async fn test_other_task_waits_for_release() {
            let lock = Arc::new(ReentrantLock::new());
            let released = Arc::new(AtomicBool::new(false));

            let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
            let holder = {
                let lock = lock.clone();
                let released = released.clone();
                tokio::spawn(async move {
                    lock.locked(async {
                        let _ = entered_tx.send(());
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        released.store(true, Ordering::SeqCst);
                    })
                    .await;
                })
            };

            entered_rx.await.unwrap();
            assert!(lock.try_lock().is_none());
            let observed = lock
                .locked(async { released.load(Ordering::SeqCst) })
                .await;
            assert!(observed);
            holder.await.unwrap();
        }

        #[tokio::test]
        async fn test_spawned_task_does_not_inherit_ownership() {
            let lock = Arc::new(ReentrantLock::new());
            let spawned = lock.clone();
            lock.locked(async {
                let free = tokio::spawn(async move { spawned.try_lock().is_some() })
                    .await
                    .unwrap();
                assert!(!free);
            })
            .await;
        }

        #[tokio::test]
        async fn test_cancelled_holder_releases() {
            let lock = Arc::new(ReentrantLock::new());
            let holder = {
                let lock = lock.clone();
                tokio::spawn(async move {
                    lock.locked(std::future::pending::<()>()).await;
                })
            };
            tokio::time::sleep(Duration::from_millis(10)).await;
            holder.abort();
            let _ = holder.await;
            assert!(lock.try_lock().is_some());
        }
    }
}
