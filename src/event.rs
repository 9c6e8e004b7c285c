//! A one-shot, single-producer/many-waiter notification (spec.md §9 Design
//! Notes: "`streaming_event`/`ready_event` are one-shot notifications").
//!
//! `tokio::sync::Notify` alone only wakes tasks that were already waiting at
//! the moment `notify_waiters` is called — a task that calls `wait()` after
//! the event fired would hang forever. `OneShotEvent` adds the missing
//! "already fired" flag so late waiters return immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct OneShotEvent {
    fired: AtomicBool,
    notify: Notify,
}

impl OneShotEvent {
    pub fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Fire the event. Idempotent — firing twice is a no-op past the first
    /// call.
    pub fn set(&self) {
        self.fired.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Wait for the event to fire, returning immediately if it already has.
    pub async fn wait(&self) {
        if self.is_set() {
            return;
        }
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register interest before re-checking the flag, closing the race
        // between the first check above and `set()` running concurrently.
        notified.as_mut().enable();
        if self.is_set() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_immediately_if_already_fired() {
        let event = OneShotEvent::new();
        event.set();
        event.wait().await;
    }

    #[tokio::test]
    async fn wait_unblocks_when_set_concurrently() {
        let event = std::sync::Arc::new(OneShotEvent::new());
        let event2 = event.clone();
        let handle = tokio::spawn(async move {
            event2.wait().await;
        });
        tokio::task::yield_now().await;
        event.set();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn set_is_idempotent() {
        let event = OneShotEvent::new();
        event.set();
        event.set();
        assert!(event.is_set());
    }

    /// Polls `wait()` by hand with `tokio_test`'s mock task, rather than
    /// driving it on a real runtime, to pin down exactly when the future
    /// transitions from pending to woken around the `Notify` registration.
    #[test]
    fn wait_future_is_pending_until_set_then_wakes() {
        let event = OneShotEvent::new();
        let mut fut = tokio_test::task::spawn(event.wait());

        tokio_test::assert_pending!(fut.poll());
        assert!(!fut.is_woken());

        event.set();
        assert!(fut.is_woken());
        tokio_test::assert_ready!(fut.poll());
    }
}
