//! Per-session mutual exclusion over request processing.
//!
//! The downstream completion service has no transactional semantics over
//! "read history, call model, write history", so two concurrent calls for
//! one session could interleave turns. The guard turns that race into a
//! queue: whoever holds the permit processes, everyone else is requeued.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const ACQUIRE_RETRY_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Default)]
pub struct InFlightGuard {
    active: Arc<DashMap<String, ()>>,
}

/// Releases the session's marker on drop, so release runs on every exit
/// path: success, error, and unwind alike.
pub struct InFlightPermit {
    active: Arc<DashMap<String, ()>>,
    session_id: String,
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        self.active.remove(&self.session_id);
    }
}

impl InFlightGuard {
    /// Atomic check-and-set. `None` means the session is already in flight.
    pub fn try_acquire(&self, session_id: &str) -> Option<InFlightPermit> {
        match self.active.entry(session_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                Some(InFlightPermit {
                    active: Arc::clone(&self.active),
                    session_id: session_id.to_string(),
                })
            }
        }
    }

    /// Polls for the permit until `timeout` elapses. Used by the direct
    /// (un-queued) path, which has no broker to requeue through.
    pub async fn acquire(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> Option<InFlightPermit> {
        let started = Instant::now();
        loop {
            if let Some(permit) = self.try_acquire(session_id) {
                return Some(permit);
            }
            if started.elapsed() >= timeout {
                return None;
            }
            tokio::time::sleep(ACQUIRE_RETRY_INTERVAL).await;
        }
    }

    pub fn is_held(&self, session_id: &str) -> bool {
        self.active.contains_key(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let guard = Arc::new(InFlightGuard::default());
        let permit = guard.try_acquire("s1").expect("first acquire");
        assert!(guard.is_held("s1"));
        assert!(guard.try_acquire("s1").is_none());

        // Different sessions are independent.
        assert!(guard.try_acquire("s2").is_some());

        drop(permit);
        assert!(!guard.is_held("s1"));
        assert!(guard.try_acquire("s1").is_some());
    }

    #[test]
    fn permit_releases_even_on_unwind() {
        let guard = Arc::new(InFlightGuard::default());
        let inner = Arc::clone(&guard);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _permit = inner.try_acquire("s1").expect("acquire");
            panic!("processing exploded");
        }));
        assert!(result.is_err());
        assert!(!guard.is_held("s1"));
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let guard = Arc::new(InFlightGuard::default());
        let permit = guard.try_acquire("s1").expect("acquire");

        let contender = Arc::clone(&guard);
        let waiter = tokio::spawn(async move {
            contender
                .acquire("s1", Duration::from_secs(1))
                .await
                .is_some()
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        drop(permit);
        assert!(waiter.await.expect("join"));
    }

    #[tokio::test]
    async fn acquire_gives_up_after_timeout() {
        let guard = Arc::new(InFlightGuard::default());
        let _permit = guard.try_acquire("s1").expect("acquire");
        let acquired = guard.acquire("s1", Duration::from_millis(80)).await;
        assert!(acquired.is_none());
        assert!(guard.is_held("s1"));
    }
}
