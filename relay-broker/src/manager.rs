use crate::error::{BrokerError, Result};
use crate::queue::{Delivery, QueuedRequest, parse_read_reply};
use redis::Value;
use redis::aio::MultiplexedConnection;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

const RESPONSE_TIMEOUT_GRACE: Duration = Duration::from_secs(2);

const PUBLISH_SCRIPT: &str = r#"
local cap = tonumber(ARGV[1])
if cap > 0 and redis.call("XLEN", KEYS[1]) >= cap then
  return false
end
return redis.call("XADD", KEYS[1], "*", unpack(ARGV, 2))
"#;

const ACK_SCRIPT: &str = r#"
redis.call("XACK", KEYS[1], ARGV[1], ARGV[2])
return redis.call("XDEL", KEYS[1], ARGV[2])
"#;

const REQUEUE_SCRIPT: &str = r#"
redis.call("XACK", KEYS[1], ARGV[1], ARGV[2])
redis.call("XDEL", KEYS[1], ARGV[2])
return redis.call("XADD", KEYS[1], "*", unpack(ARGV, 3))
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    /// An established connection started failing commands; the handle has
    /// been cleared and the next caller reconnects.
    Degraded = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Degraded,
            _ => Self::Disconnected,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuePolicy {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    /// Stream length cap. Publishes are refused once reached. 0 = unbounded.
    pub max_length: u64,
    /// Entries older than this are dropped at delivery.
    pub message_ttl: Duration,
    /// Fixed delay between reconnection attempts. No ceiling, no exponential
    /// growth; attempts repeat until the broker comes back.
    pub reconnect_delay: Duration,
    /// How long a consume call blocks waiting for a delivery.
    pub block: Duration,
}

/// Owner of the process-wide broker connection.
///
/// Publish and acknowledgement commands share one multiplexed handle; the
/// consumer gets a second handle of its own because a blocking `XREADGROUP`
/// would stall every command queued behind it. A command failure clears the
/// affected handle so the next caller reconnects, re-declaring the consumer
/// group (a fresh connection has no consumers). Without a configured URL all
/// operations fail fast with [`BrokerError::NotConfigured`] so callers can
/// fall back to direct invocation.
#[derive(Debug)]
pub struct BrokerManager {
    client: Option<redis::Client>,
    policy: QueuePolicy,
    shared: Mutex<Option<MultiplexedConnection>>,
    consumer: Mutex<Option<MultiplexedConnection>>,
    state: AtomicU8,
}

impl BrokerManager {
    pub fn new(url: Option<&str>, policy: QueuePolicy) -> Result<Arc<Self>> {
        let client = match url.map(str::trim).filter(|u| !u.is_empty()) {
            Some(url) => Some(redis::Client::open(url).map_err(|e| {
                BrokerError::Unavailable(format!("invalid broker url {url}: {e}"))
            })?),
            None => None,
        };
        Ok(Arc::new(Self {
            client,
            policy,
            shared: Mutex::new(None),
            consumer: Mutex::new(None),
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
        }))
    }

    pub fn is_configured(&self) -> bool {
        self.client.is_some()
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// Returns a usable connection handle, opening one if necessary.
    /// A fresh connection declares the stream and consumer group before it
    /// is handed out.
    pub async fn ensure_connection(&self) -> Result<MultiplexedConnection> {
        self.ensure_slot(&self.shared).await
    }

    async fn ensure_slot(
        &self,
        slot: &Mutex<Option<MultiplexedConnection>>,
    ) -> Result<MultiplexedConnection> {
        let mut guard = slot.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let Some(client) = self.client.as_ref() else {
            return Err(BrokerError::NotConfigured);
        };

        self.set_state(ConnectionState::Connecting);
        let config = redis::AsyncConnectionConfig::new()
            .set_response_timeout(Some(self.policy.block + RESPONSE_TIMEOUT_GRACE));
        let mut conn = match client
            .get_multiplexed_async_connection_with_config(&config)
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(BrokerError::Unavailable(e.to_string()));
            }
        };

        if let Err(e) = self.ensure_group(&mut conn).await {
            self.set_state(ConnectionState::Disconnected);
            return Err(e);
        }

        self.set_state(ConnectionState::Connected);
        tracing::info!(
            stream = %self.policy.stream,
            group = %self.policy.group,
            consumer = %self.policy.consumer,
            "broker connection established"
        );
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn ensure_group(&self, conn: &mut MultiplexedConnection) -> Result<()> {
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.policy.stream)
            .arg(&self.policy.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(conn)
            .await;
        match created {
            Ok(_) => {
                tracing::debug!(
                    stream = %self.policy.stream,
                    group = %self.policy.group,
                    "consumer group created"
                );
                Ok(())
            }
            Err(e) if is_busy_group_error(&e) => Ok(()),
            Err(e) => Err(BrokerError::Unavailable(format!(
                "xgroup create failed: {e}"
            ))),
        }
    }

    /// Runs one command against a connection slot, reconnecting and retrying
    /// once if the handle has gone stale. The slot's mutex is released while
    /// the command is in flight; only handle setup and teardown hold it.
    async fn run_command<T, F>(
        &self,
        slot: &Mutex<Option<MultiplexedConnection>>,
        operation: &'static str,
        build: F,
    ) -> Result<T>
    where
        T: redis::FromRedisValue + Send,
        F: Fn() -> redis::Cmd,
    {
        let mut last_err = None;
        for attempt in 0..2 {
            let mut conn = self.ensure_slot(slot).await?;
            let result: redis::RedisResult<T> = build().query_async(&mut conn).await;
            match result {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::debug!(operation, "broker command succeeded after reconnect");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    tracing::warn!(
                        operation,
                        attempt = attempt + 1,
                        error = %e,
                        "broker command failed; clearing connection"
                    );
                    *slot.lock().await = None;
                    self.set_state(ConnectionState::Degraded);
                    last_err = Some(BrokerError::Unavailable(e.to_string()));
                }
            }
        }
        Err(last_err.unwrap_or(BrokerError::Unavailable(
            "broker command failed unexpectedly".to_string(),
        )))
    }

    /// Publishes a request onto the durable queue, refusing once the
    /// capacity cap is reached.
    #[tracing::instrument(level = "debug", skip_all, fields(session_id = %request.session_id))]
    pub async fn publish(&self, request: &QueuedRequest) -> Result<()> {
        let policy = self.policy.clone();
        let fields = request.to_fields();
        let entry_id: Option<String> = self
            .run_command(&self.shared, "publish", || {
                let mut cmd = redis::cmd("EVAL");
                cmd.arg(PUBLISH_SCRIPT)
                    .arg(1)
                    .arg(&policy.stream)
                    .arg(policy.max_length);
                for (key, value) in &fields {
                    cmd.arg(*key).arg(value);
                }
                cmd
            })
            .await?;

        match entry_id {
            Some(id) => {
                tracing::debug!(entry_id = %id, "request published");
                Ok(())
            }
            None => {
                let len: u64 = self
                    .run_command(&self.shared, "queue_len", || {
                        let mut cmd = redis::cmd("XLEN");
                        cmd.arg(&policy.stream);
                        cmd
                    })
                    .await
                    .unwrap_or(self.policy.max_length);
                Err(BrokerError::QueueFull {
                    queue: self.policy.stream.clone(),
                    len,
                    capacity: self.policy.max_length,
                })
            }
        }
    }

    /// Delivers at most one entry. `read_pending` selects entries this
    /// consumer received but never acknowledged (the redelivery pass after a
    /// restart or reconnect); otherwise the call blocks briefly on new
    /// entries. `Ok(None)` means nothing was ready.
    pub async fn consume_one(&self, read_pending: bool) -> Result<Option<Delivery>> {
        let policy = self.policy.clone();
        let stream_id = if read_pending { "0" } else { ">" };
        let result = self
            .run_command::<Value, _>(&self.consumer, "consume", || {
                let mut cmd = redis::cmd("XREADGROUP");
                cmd.arg("GROUP")
                    .arg(&policy.group)
                    .arg(&policy.consumer)
                    .arg("COUNT")
                    .arg(1);
                if stream_id == ">" {
                    cmd.arg("BLOCK").arg(policy.block.as_millis() as u64);
                }
                cmd.arg("STREAMS").arg(&policy.stream).arg(stream_id);
                cmd
            })
            .await;

        match result {
            Ok(reply) => match parse_read_reply(reply) {
                Ok(delivery) => Ok(delivery),
                // A foreign publisher can leave an entry we cannot decode;
                // acknowledge it so the pending read does not wedge on it.
                Err(BrokerError::Malformed { id, reason }) => {
                    tracing::warn!(entry_id = %id, %reason, "discarding malformed queue entry");
                    self.ack(&id).await?;
                    Ok(None)
                }
                Err(e) => Err(e),
            },
            // The group evaporates when the broker loses the stream; recreate
            // it and let the caller retry.
            Err(BrokerError::Unavailable(message)) if message.contains("NOGROUP") => {
                let mut conn = self.ensure_slot(&self.consumer).await?;
                self.ensure_group(&mut conn).await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Positively acknowledges an entry, permanently removing it.
    pub async fn ack(&self, entry_id: &str) -> Result<()> {
        let policy = self.policy.clone();
        let entry_id = entry_id.to_string();
        let _removed: i64 = self
            .run_command(&self.shared, "ack", || {
                let mut cmd = redis::cmd("EVAL");
                cmd.arg(ACK_SCRIPT)
                    .arg(1)
                    .arg(&policy.stream)
                    .arg(&policy.group)
                    .arg(&entry_id);
                cmd
            })
            .await?;
        Ok(())
    }

    /// Returns an entry to the queue tail for redelivery, atomically with its
    /// acknowledgement. `attempt` is the attempt count the requeued entry
    /// carries.
    pub async fn requeue(&self, delivery: &Delivery, attempt: u32) -> Result<()> {
        let policy = self.policy.clone();
        let mut request = delivery.request.clone();
        request.attempt = attempt;
        let fields = request.to_fields();
        let entry_id = delivery.entry_id.clone();
        let _new_id: String = self
            .run_command(&self.shared, "requeue", || {
                let mut cmd = redis::cmd("EVAL");
                cmd.arg(REQUEUE_SCRIPT)
                    .arg(1)
                    .arg(&policy.stream)
                    .arg(&policy.group)
                    .arg(&entry_id);
                for (key, value) in &fields {
                    cmd.arg(*key).arg(value);
                }
                cmd
            })
            .await?;
        tracing::debug!(
            entry_id = %delivery.entry_id,
            session_id = %delivery.request.session_id,
            attempt,
            "entry requeued"
        );
        Ok(())
    }
}

fn is_busy_group_error(error: &redis::RedisError) -> bool {
    error.to_string().to_ascii_uppercase().contains("BUSYGROUP")
}
