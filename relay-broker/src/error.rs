use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// No broker address was configured. Callers fall back to direct
    /// invocation; this is never fatal.
    #[error("broker is not configured")]
    NotConfigured,

    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The queue hit its capacity cap. Publishes are refused, not dropped.
    #[error("queue {queue} is full ({len}/{capacity})")]
    QueueFull {
        queue: String,
        len: u64,
        capacity: u64,
    },

    #[error("malformed queue entry {id}: {reason}")]
    Malformed { id: String, reason: String },
}

impl From<redis::RedisError> for BrokerError {
    fn from(e: redis::RedisError) -> Self {
        Self::Unavailable(e.to_string())
    }
}
