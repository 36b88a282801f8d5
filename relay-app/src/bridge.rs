//! Request-side orchestration: publish, race the reply, fall back.

use crate::inflight::InFlightGuard;
use crate::invoker::{CompletionInvoker, Reply};
use crate::waiter::{self, ResponseWaiters, WaitError};
use relay_broker::{BrokerError, BrokerManager, QueuedRequest};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// The downstream completion itself failed.
    #[error("{0}")]
    Upstream(String),

    /// No reply arrived in time. The work may still finish invisibly; its
    /// notification will find no listener.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The queue refused the publish (capacity cap).
    #[error("{0}")]
    Busy(String),
}

pub struct QueryBridge {
    broker: Arc<BrokerManager>,
    waiters: Arc<ResponseWaiters>,
    invoker: Arc<CompletionInvoker>,
    guard: Arc<InFlightGuard>,
    response_timeout: Duration,
}

impl QueryBridge {
    pub fn new(
        broker: Arc<BrokerManager>,
        waiters: Arc<ResponseWaiters>,
        invoker: Arc<CompletionInvoker>,
        guard: Arc<InFlightGuard>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            waiters,
            invoker,
            guard,
            response_timeout,
        }
    }

    /// Routes one request through the queue and waits for its reply.
    ///
    /// The waiter registers before the publish so a reply cannot arrive
    /// ahead of its listener. When the broker is missing or unreachable the
    /// request is invoked directly; the queue is an ordering and reliability
    /// enhancement, not a prerequisite for answering a single request.
    #[tracing::instrument(level = "info", skip_all, fields(session_id = %session_id))]
    pub async fn submit(&self, session_id: &str, user_input: &str) -> Result<Reply, BridgeError> {
        let (rx, listener) = self.waiters.register(session_id);
        let request = QueuedRequest::new(session_id, user_input);

        match self.broker.publish(&request).await {
            Ok(()) => match waiter::wait(rx, self.response_timeout).await {
                Ok(reply) => Ok(reply),
                Err(WaitError::Timeout(elapsed)) => Err(BridgeError::Timeout(elapsed)),
                Err(WaitError::Upstream(message)) => Err(BridgeError::Upstream(message)),
                Err(WaitError::Closed) => {
                    Err(BridgeError::Upstream("reply channel closed".to_string()))
                }
            },
            Err(e @ BrokerError::QueueFull { .. }) => {
                drop(listener);
                tracing::warn!(error = %e, "queue refused publish");
                Err(BridgeError::Busy(e.to_string()))
            }
            Err(BrokerError::NotConfigured) => {
                drop(listener);
                self.invoke_direct(session_id, user_input).await
            }
            Err(e) => {
                drop(listener);
                tracing::warn!(error = %e, "publish failed; falling back to direct invocation");
                self.invoke_direct(session_id, user_input).await
            }
        }
    }

    /// The un-queued path still serializes through the in-flight guard so
    /// the one-request-per-session invariant holds without the broker.
    async fn invoke_direct(&self, session_id: &str, user_input: &str) -> Result<Reply, BridgeError> {
        let Some(_permit) = self.guard.acquire(session_id, self.response_timeout).await else {
            return Err(BridgeError::Timeout(self.response_timeout));
        };
        self.invoker
            .invoke(session_id, user_input)
            .await
            .map_err(|e| BridgeError::Upstream(e.to_string()))
    }
}
