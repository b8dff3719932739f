//! Cancellable-wait primitive used by every background loop.
//!
//! A `CancelHandle`/`CancelToken` pair wraps a `watch` channel: cancelling
//! wakes all sleeping holders of the token immediately, and a woken task can
//! ask "was I cancelled?" before doing anything else.  Tokens are cheap to
//! clone, so one handle can tear down a whole set of cooperating tasks.

use std::time::Duration;

use tokio::sync::watch;

/// Sending half: owned by whoever is allowed to cancel the task set.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Receiving half: carried by the running tasks.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Create a fresh handle/token pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    /// Signal cancellation.  Idempotent; wakes every sleeping token holder.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns `true` if the wait ended because of cancellation (including a
    /// dropped handle, which counts as cancelled so no task waits forever on
    /// a dead controller).
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if *self.rx.borrow() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => *self.rx.borrow(),
            changed = self.rx.changed() => match changed {
                Ok(()) => *self.rx.borrow(),
                Err(_) => true, // handle dropped
            },
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test]
    async fn uncancelled_sleep_completes() {
        let (_handle, mut token) = cancel_pair();
        let cancelled = token.sleep(Duration::from_millis(10)).await;
        assert!(!cancelled);
    }

    #[tokio::test]
    async fn cancel_wakes_sleeping_task_early() {
        let (handle, mut token) = cancel_pair();
        let start = Instant::now();

        let waiter = tokio::spawn(async move { token.sleep(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        let cancelled = waiter.await.unwrap();
        assert!(cancelled);
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "cancel should wake the sleeper well before the full wait"
        );
    }

    #[tokio::test]
    async fn pre_cancelled_token_returns_immediately() {
        let (handle, mut token) = cancel_pair();
        handle.cancel();
        let start = Instant::now();
        assert!(token.sleep(Duration::from_secs(60)).await);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn dropped_handle_counts_as_cancelled() {
        let (handle, mut token) = cancel_pair();
        drop(handle);
        assert!(token.sleep(Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn cloned_tokens_all_wake() {
        let (handle, token) = cancel_pair();
        let mut a = token.clone();
        let mut b = token;

        let ja = tokio::spawn(async move { a.sleep(Duration::from_secs(60)).await });
        let jb = tokio::spawn(async move { b.sleep(Duration::from_secs(60)).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();

        assert!(ja.await.unwrap());
        assert!(jb.await.unwrap());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (handle, token) = cancel_pair();
        handle.cancel();
        handle.cancel();
        assert!(token.is_cancelled());
    }
}
