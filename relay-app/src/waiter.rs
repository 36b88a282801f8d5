//! Per-session reply notification registry.
//!
//! A request handler registers a waiter before publishing, then races the
//! notification against a timeout. Registration hands back an RAII guard so
//! a timed-out or cancelled waiter unregisters itself; a notification with
//! no listener is simply dropped.

use crate::invoker::Reply;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

pub type ReplyResult = std::result::Result<Reply, String>;

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("no reply arrived within {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Upstream(String),

    #[error("reply channel closed before a notification arrived")]
    Closed,
}

#[derive(Default)]
pub struct ResponseWaiters {
    waiters: Mutex<HashMap<String, Vec<(u64, oneshot::Sender<ReplyResult>)>>>,
    next_slot: AtomicU64,
}

/// Removes the registered waiter on drop.
pub struct WaiterGuard<'a> {
    waiters: &'a ResponseWaiters,
    session_id: String,
    slot: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.waiters.remove(&self.session_id, self.slot);
    }
}

impl ResponseWaiters {
    /// Registers a listener for the session's next notification. Must be
    /// called before the request is published so a fast reply cannot slip
    /// past an unsubscribed waiter.
    pub fn register(&self, session_id: &str) -> (oneshot::Receiver<ReplyResult>, WaiterGuard<'_>) {
        let (tx, rx) = oneshot::channel();
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        self.waiters
            .lock()
            .expect("waiter registry poisoned")
            .entry(session_id.to_string())
            .or_default()
            .push((slot, tx));
        (
            rx,
            WaiterGuard {
                waiters: self,
                session_id: session_id.to_string(),
                slot,
            },
        )
    }

    /// Broadcasts a result to every waiter currently registered for the
    /// session. Returns how many listeners were notified; zero means the
    /// caller is gone (timed out) and the result is dropped.
    pub fn notify(&self, session_id: &str, result: ReplyResult) -> usize {
        let senders = self
            .waiters
            .lock()
            .expect("waiter registry poisoned")
            .remove(session_id)
            .unwrap_or_default();
        let mut notified = 0;
        for (_, tx) in senders {
            if tx.send(result.clone()).is_ok() {
                notified += 1;
            }
        }
        notified
    }

    fn remove(&self, session_id: &str, slot: u64) {
        let mut waiters = self.waiters.lock().expect("waiter registry poisoned");
        if let Some(senders) = waiters.get_mut(session_id) {
            senders.retain(|(s, _)| *s != slot);
            if senders.is_empty() {
                waiters.remove(session_id);
            }
        }
    }

    #[cfg(test)]
    fn listener_count(&self, session_id: &str) -> usize {
        self.waiters
            .lock()
            .expect("waiter registry poisoned")
            .get(session_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// Races the notification against the timeout; whichever completes first
/// wins and the loser is discarded.
pub async fn wait(
    rx: oneshot::Receiver<ReplyResult>,
    timeout: Duration,
) -> std::result::Result<Reply, WaitError> {
    match tokio::time::timeout(timeout, rx).await {
        Err(_) => Err(WaitError::Timeout(timeout)),
        Ok(Err(_)) => Err(WaitError::Closed),
        Ok(Ok(Ok(reply))) => Ok(reply),
        Ok(Ok(Err(message))) => Err(WaitError::Upstream(message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_llm::ChatMessage;

    fn reply(content: &str) -> Reply {
        Reply {
            message: ChatMessage::assistant(content),
            limit_reached: false,
        }
    }

    #[tokio::test]
    async fn notification_resolves_the_waiter() {
        let waiters = ResponseWaiters::default();
        let (rx, _guard) = waiters.register("s1");

        assert_eq!(waiters.notify("s1", Ok(reply("hi"))), 1);
        let resolved = wait(rx, Duration::from_secs(1)).await.expect("reply");
        assert_eq!(resolved.message.content, "hi");
    }

    #[tokio::test]
    async fn notification_before_the_wait_still_resolves() {
        // The waiter subscribes before the publish, so a reply that lands
        // before the race starts must not be lost.
        let waiters = ResponseWaiters::default();
        let (rx, _guard) = waiters.register("s1");
        waiters.notify("s1", Ok(reply("early")));

        let resolved = wait(rx, Duration::from_millis(50)).await.expect("reply");
        assert_eq!(resolved.message.content, "early");
    }

    #[tokio::test]
    async fn wait_times_out_without_a_notification() {
        let waiters = ResponseWaiters::default();
        let (rx, _guard) = waiters.register("s1");

        let err = wait(rx, Duration::from_millis(50)).await.expect_err("timeout");
        assert!(matches!(err, WaitError::Timeout(_)));
    }

    #[tokio::test]
    async fn upstream_failures_are_distinct_from_timeouts() {
        let waiters = ResponseWaiters::default();
        let (rx, _guard) = waiters.register("s1");
        waiters.notify("s1", Err("completion blew up".to_string()));

        let err = wait(rx, Duration::from_secs(1)).await.expect_err("upstream");
        assert!(matches!(err, WaitError::Upstream(ref m) if m == "completion blew up"));
    }

    #[tokio::test]
    async fn dropping_the_guard_unsubscribes() {
        let waiters = ResponseWaiters::default();
        let (rx, guard) = waiters.register("s1");
        assert_eq!(waiters.listener_count("s1"), 1);

        drop(guard);
        drop(rx);
        assert_eq!(waiters.listener_count("s1"), 0);
        // A late notification for a departed waiter is ignored.
        assert_eq!(waiters.notify("s1", Ok(reply("late"))), 0);
    }

    #[tokio::test]
    async fn notify_reaches_every_registered_waiter() {
        let waiters = ResponseWaiters::default();
        let (rx_a, _guard_a) = waiters.register("s1");
        let (rx_b, _guard_b) = waiters.register("s1");

        assert_eq!(waiters.notify("s1", Ok(reply("shared"))), 2);
        assert_eq!(
            wait(rx_a, Duration::from_secs(1)).await.expect("a").message.content,
            "shared"
        );
        assert_eq!(
            wait(rx_b, Duration::from_secs(1)).await.expect("b").message.content,
            "shared"
        );
    }
}
