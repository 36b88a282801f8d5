//! Durable queue client for the request bridge.
//!
//! One Redis stream plus one consumer group stand in for the queue: `XADD`
//! publishes, `XREADGROUP COUNT 1` delivers at most one unacknowledged entry
//! to this process, `XACK`/`XDEL` acknowledge, and requeue is an atomic
//! ack-plus-republish to the stream tail. The connection is a process-wide
//! singleton owned by [`BrokerManager`]; everything else borrows it and must
//! tolerate it dropping at any time.

mod error;
mod manager;
mod queue;

pub use error::{BrokerError, Result};
pub use manager::{BrokerManager, ConnectionState, QueuePolicy};
pub use queue::{Delivery, QueuedRequest, now_unix_ms};
