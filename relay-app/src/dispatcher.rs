//! Queue consumer: pulls requests, serializes per session, notifies waiters.

use crate::inflight::InFlightGuard;
use crate::invoker::CompletionInvoker;
use crate::waiter::ResponseWaiters;
use relay_broker::{BrokerManager, Delivery, QueuedRequest, now_unix_ms};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CONTENTION_REDELIVERY_PAUSE: Duration = Duration::from_millis(100);

/// What became of one delivered request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed and acknowledged; the waiter was notified.
    Completed,
    /// The session already had a request in flight; returned to the queue
    /// unchanged for redelivery once the holder finishes.
    Contended,
    /// Processing failed. `retry` says whether the attempt budget allows
    /// another delivery; otherwise the entry is dropped for good.
    Failed { retry: bool },
    /// Outlived the queue's message TTL; dropped without processing.
    Expired,
}

pub struct Dispatcher {
    broker: Arc<BrokerManager>,
    guard: Arc<InFlightGuard>,
    invoker: Arc<CompletionInvoker>,
    waiters: Arc<ResponseWaiters>,
    message_ttl: Duration,
    max_attempts: u32,
}

impl Dispatcher {
    pub fn new(
        broker: Arc<BrokerManager>,
        guard: Arc<InFlightGuard>,
        invoker: Arc<CompletionInvoker>,
        waiters: Arc<ResponseWaiters>,
        max_attempts: u32,
    ) -> Arc<Self> {
        let message_ttl = broker.policy().message_ttl;
        Arc::new(Self {
            broker,
            guard,
            invoker,
            waiters,
            message_ttl,
            max_attempts: max_attempts.max(1),
        })
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
            tracing::info!("dispatcher stopped");
        })
    }

    /// Consumer loop. One logical consumer per process; the broker delivers
    /// at most one unacknowledged entry at a time. After a (re)connect the
    /// first pass reads this consumer's pending entries so nothing delivered
    /// before a drop is lost.
    #[tracing::instrument(level = "info", skip_all)]
    async fn run(&self, shutdown: CancellationToken) {
        let reconnect_delay = self.broker.policy().reconnect_delay;
        let mut read_pending = true;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                consumed = self.broker.consume_one(read_pending) => match consumed {
                    Ok(Some(delivery)) => match self.settle(&delivery).await {
                        // The stream redelivers a requeued entry immediately;
                        // a short pause keeps the contention retry from
                        // spinning while the holder's completion call runs.
                        Ok(Disposition::Contended) => {
                            tokio::select! {
                                _ = shutdown.cancelled() => return,
                                _ = tokio::time::sleep(CONTENTION_REDELIVERY_PAUSE) => {}
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(
                                entry_id = %delivery.entry_id,
                                error = %e,
                                "failed to settle delivery; reconnecting"
                            );
                            read_pending = true;
                        }
                    }
                    Ok(None) => {
                        read_pending = false;
                    }
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            retry_delay_ms = reconnect_delay.as_millis() as u64,
                            "queue consume failed; retrying after delay"
                        );
                        read_pending = true;
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            _ = tokio::time::sleep(reconnect_delay) => {}
                        }
                    }
                }
            }
        }
    }

    /// Processes a delivery and acknowledges it according to the outcome.
    async fn settle(&self, delivery: &Delivery) -> relay_broker::Result<Disposition> {
        let disposition = self.handle_request(&delivery.request).await;
        match disposition {
            Disposition::Completed | Disposition::Expired | Disposition::Failed { retry: false } => {
                self.broker.ack(&delivery.entry_id).await?;
            }
            Disposition::Contended => {
                self.broker
                    .requeue(delivery, delivery.request.attempt)
                    .await?;
            }
            Disposition::Failed { retry: true } => {
                self.broker
                    .requeue(delivery, delivery.request.attempt + 1)
                    .await?;
            }
        }
        Ok(disposition)
    }

    /// Broker-free core of the state machine, so the dispositions are
    /// testable without a live queue.
    pub(crate) async fn handle_request(&self, request: &QueuedRequest) -> Disposition {
        if request.is_expired(self.message_ttl, now_unix_ms()) {
            tracing::warn!(
                session_id = %request.session_id,
                enqueued_at_ms = request.enqueued_at_ms,
                "dropping expired request"
            );
            return Disposition::Expired;
        }

        let Some(_permit) = self.guard.try_acquire(&request.session_id) else {
            tracing::debug!(
                session_id = %request.session_id,
                "session already in flight; requeueing"
            );
            return Disposition::Contended;
        };

        match self
            .invoker
            .invoke(&request.session_id, &request.user_input)
            .await
        {
            Ok(reply) => {
                let notified = self.waiters.notify(&request.session_id, Ok(reply));
                if notified == 0 {
                    tracing::debug!(
                        session_id = %request.session_id,
                        "caller is gone; reply dropped"
                    );
                }
                Disposition::Completed
            }
            Err(e) => {
                let retry = request.attempt < self.max_attempts;
                tracing::warn!(
                    session_id = %request.session_id,
                    attempt = request.attempt,
                    max_attempts = self.max_attempts,
                    retry,
                    error = %e,
                    "completion failed"
                );
                if !retry {
                    self.waiters.notify(&request.session_id, Err(e.to_string()));
                }
                Disposition::Failed { retry }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStore;
    use crate::test_support::ScriptedBackend;
    use crate::waiter;
    use relay_broker::QueuePolicy;
    use relay_llm::Role;

    fn policy() -> QueuePolicy {
        QueuePolicy {
            stream: "relay:requests".to_string(),
            group: "relay".to_string(),
            consumer: "relay-test".to_string(),
            max_length: 16,
            message_ttl: Duration::from_secs(60),
            reconnect_delay: Duration::from_millis(10),
            block: Duration::from_millis(10),
        }
    }

    struct Fixture {
        dispatcher: Arc<Dispatcher>,
        store: Arc<SessionStore>,
        guard: Arc<InFlightGuard>,
        waiters: Arc<ResponseWaiters>,
        backend: Arc<ScriptedBackend>,
    }

    fn fixture(backend: ScriptedBackend, max_attempts: u32) -> Fixture {
        let backend = Arc::new(backend);
        let store = Arc::new(SessionStore::new(10));
        let guard = Arc::new(InFlightGuard::default());
        let waiters = Arc::new(ResponseWaiters::default());
        let invoker = Arc::new(CompletionInvoker::new(
            backend.clone(),
            store.clone(),
            None,
        ));
        let broker = BrokerManager::new(None, policy()).expect("manager");
        let dispatcher = Dispatcher::new(
            broker,
            guard.clone(),
            invoker,
            waiters.clone(),
            max_attempts,
        );
        Fixture {
            dispatcher,
            store,
            guard,
            waiters,
            backend,
        }
    }

    #[tokio::test]
    async fn success_completes_and_notifies_the_waiter() {
        let f = fixture(ScriptedBackend::replying(["hi"]), 1);
        let (rx, _guard) = f.waiters.register("s1");

        let disposition = f
            .dispatcher
            .handle_request(&QueuedRequest::new("s1", "hello"))
            .await;
        assert_eq!(disposition, Disposition::Completed);

        let reply = waiter::wait(rx, Duration::from_secs(1)).await.expect("reply");
        assert_eq!(reply.message.content, "hi");
        assert!(!reply.limit_reached);

        let history = f.store.snapshot("s1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert!(!f.guard.is_held("s1"), "permit released after processing");
    }

    #[tokio::test]
    async fn contended_session_is_requeued_untouched() {
        let f = fixture(ScriptedBackend::replying(["hi"]), 1);
        let held = f.guard.try_acquire("s1").expect("hold the session");

        let disposition = f
            .dispatcher
            .handle_request(&QueuedRequest::new("s1", "hello"))
            .await;
        assert_eq!(disposition, Disposition::Contended);
        assert!(
            f.store.snapshot("s1").is_empty(),
            "contended request must not touch history"
        );
        assert_eq!(f.backend.request_count(), 0);

        drop(held);
        let disposition = f
            .dispatcher
            .handle_request(&QueuedRequest::new("s1", "hello"))
            .await;
        assert_eq!(disposition, Disposition::Completed);
    }

    #[tokio::test]
    async fn failure_with_exhausted_budget_drops_and_surfaces_the_error() {
        let f = fixture(ScriptedBackend::failing("boom"), 1);
        let (rx, _guard) = f.waiters.register("s1");

        let disposition = f
            .dispatcher
            .handle_request(&QueuedRequest::new("s1", "hello"))
            .await;
        assert_eq!(disposition, Disposition::Failed { retry: false });

        let err = waiter::wait(rx, Duration::from_secs(1))
            .await
            .expect_err("surfaced");
        assert!(matches!(err, crate::waiter::WaitError::Upstream(ref m) if m.contains("boom")));
        assert!(!f.guard.is_held("s1"), "permit released after failure");
    }

    #[tokio::test]
    async fn failure_within_budget_requeues_without_notifying() {
        let f = fixture(ScriptedBackend::failing("boom"), 2);
        let (rx, _guard) = f.waiters.register("s1");

        let disposition = f
            .dispatcher
            .handle_request(&QueuedRequest::new("s1", "hello"))
            .await;
        assert_eq!(disposition, Disposition::Failed { retry: true });

        // The caller keeps waiting; the retry may still beat the timeout.
        let err = waiter::wait(rx, Duration::from_millis(50))
            .await
            .expect_err("still waiting");
        assert!(matches!(err, crate::waiter::WaitError::Timeout(_)));
    }

    #[tokio::test]
    async fn expired_requests_are_dropped_unprocessed() {
        let f = fixture(ScriptedBackend::replying(["hi"]), 1);
        let request = QueuedRequest {
            session_id: "s1".to_string(),
            user_input: "hello".to_string(),
            enqueued_at_ms: 1,
            attempt: 1,
        };

        let disposition = f.dispatcher.handle_request(&request).await;
        assert_eq!(disposition, Disposition::Expired);
        assert!(f.store.snapshot("s1").is_empty());
        assert_eq!(f.backend.request_count(), 0);
    }
}
