use crate::error::BrokerError;
use redis::Value;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// One queued request as it travels through the stream.
///
/// `attempt` counts processing attempts: contention requeues keep it, failure
/// requeues bump it, and the dispatcher drops the entry once the configured
/// attempt budget is spent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedRequest {
    pub session_id: String,
    pub user_input: String,
    pub enqueued_at_ms: u64,
    pub attempt: u32,
}

impl QueuedRequest {
    pub fn new(session_id: impl Into<String>, user_input: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_input: user_input.into(),
            enqueued_at_ms: now_unix_ms(),
            attempt: 1,
        }
    }

    /// Whether the entry outlived the queue's message time-to-live.
    /// Expired entries are dropped at delivery, never processed.
    pub fn is_expired(&self, ttl: Duration, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.enqueued_at_ms) > ttl.as_millis() as u64
    }

    pub(crate) fn to_fields(&self) -> [(&'static str, String); 4] {
        [
            ("session_id", self.session_id.clone()),
            ("user_input", self.user_input.clone()),
            ("enqueued_at_ms", self.enqueued_at_ms.to_string()),
            ("attempt", self.attempt.to_string()),
        ]
    }

    pub(crate) fn from_fields(
        id: &str,
        fields: &HashMap<String, String>,
    ) -> Result<Self, BrokerError> {
        let session_id = required_field(id, fields, "session_id")?;
        let user_input = required_field(id, fields, "user_input")?;
        let enqueued_at_ms = fields
            .get("enqueued_at_ms")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let attempt = fields
            .get("attempt")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        Ok(Self {
            session_id,
            user_input,
            enqueued_at_ms,
            attempt,
        })
    }
}

/// An undelivered-unacknowledged stream entry handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub entry_id: String,
    pub request: QueuedRequest,
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn required_field(
    id: &str,
    fields: &HashMap<String, String>,
    key: &str,
) -> Result<String, BrokerError> {
    fields
        .get(key)
        .map(|v| v.to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BrokerError::Malformed {
            id: id.to_string(),
            reason: format!("missing field {key}"),
        })
}

/// Walks an `XREADGROUP` reply down to at most one `(entry_id, fields)` pair.
/// The consumer reads `COUNT 1` from a single stream, so deeper nesting than
/// one stream with one entry is ignored.
pub(crate) fn parse_read_reply(reply: Value) -> Result<Option<Delivery>, BrokerError> {
    let entries = match reply {
        Value::Nil => return Ok(None),
        Value::Array(streams) => streams
            .into_iter()
            .find_map(|stream| match stream {
                Value::Array(parts) if parts.len() >= 2 => parts.into_iter().nth(1),
                _ => None,
            })
            .unwrap_or(Value::Nil),
        Value::Map(streams) => streams
            .into_iter()
            .next()
            .map(|(_, entries)| entries)
            .unwrap_or(Value::Nil),
        other => {
            return Err(BrokerError::Unavailable(format!(
                "unexpected xreadgroup reply shape: {other:?}"
            )));
        }
    };

    let Value::Array(entries) = entries else {
        return Ok(None);
    };
    for entry in entries {
        let Value::Array(parts) = entry else {
            continue;
        };
        let Some(entry_id) = parts.first().and_then(value_to_string) else {
            continue;
        };
        let fields = parts.get(1).map(parse_fields).unwrap_or_default();
        let request = QueuedRequest::from_fields(&entry_id, &fields)?;
        return Ok(Some(Delivery { entry_id, request }));
    }
    Ok(None)
}

fn parse_fields(value: &Value) -> HashMap<String, String> {
    match value {
        Value::Map(pairs) => pairs
            .iter()
            .filter_map(|(k, v)| Some((value_to_string(k)?, value_to_string(v)?)))
            .collect(),
        Value::Array(parts) => parts
            .chunks(2)
            .filter_map(|pair| {
                Some((
                    value_to_string(pair.first()?)?,
                    value_to_string(pair.get(1)?)?,
                ))
            })
            .collect(),
        _ => HashMap::new(),
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        Value::SimpleString(v) => Some(v.clone()),
        Value::Int(v) => Some(v.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    #[test]
    fn round_trips_through_stream_fields() {
        let request = QueuedRequest {
            session_id: "s1".to_string(),
            user_input: "hello".to_string(),
            enqueued_at_ms: 1_700_000_000_000,
            attempt: 2,
        };
        let fields: HashMap<String, String> = request
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let parsed = QueuedRequest::from_fields("1-0", &fields).expect("parse fields");
        assert_eq!(parsed, request);
    }

    #[test]
    fn missing_session_id_is_malformed() {
        let mut fields = HashMap::new();
        fields.insert("user_input".to_string(), "hello".to_string());
        let err = QueuedRequest::from_fields("1-0", &fields).expect_err("must fail");
        assert!(matches!(err, BrokerError::Malformed { .. }));
    }

    #[test]
    fn expiry_uses_enqueue_timestamp() {
        let request = QueuedRequest {
            session_id: "s1".to_string(),
            user_input: "hello".to_string(),
            enqueued_at_ms: 1_000,
            attempt: 1,
        };
        assert!(!request.is_expired(Duration::from_secs(60), 60_000));
        assert!(request.is_expired(Duration::from_secs(60), 62_000));
    }

    #[test]
    fn parses_array_shaped_xreadgroup_reply() {
        let reply = Value::Array(vec![Value::Array(vec![
            bulk("relay:requests"),
            Value::Array(vec![Value::Array(vec![
                bulk("3-1"),
                Value::Array(vec![
                    bulk("session_id"),
                    bulk("s1"),
                    bulk("user_input"),
                    bulk("hello"),
                    bulk("enqueued_at_ms"),
                    bulk("42"),
                    bulk("attempt"),
                    bulk("1"),
                ]),
            ])]),
        ])]);
        let delivery = parse_read_reply(reply).expect("parse reply").expect("one entry");
        assert_eq!(delivery.entry_id, "3-1");
        assert_eq!(delivery.request.session_id, "s1");
        assert_eq!(delivery.request.user_input, "hello");
        assert_eq!(delivery.request.enqueued_at_ms, 42);
    }

    #[test]
    fn nil_reply_means_no_delivery() {
        assert!(parse_read_reply(Value::Nil).expect("parse nil").is_none());
        let empty = Value::Array(vec![Value::Array(vec![
            bulk("relay:requests"),
            Value::Array(vec![]),
        ])]);
        assert!(parse_read_reply(empty).expect("parse empty").is_none());
    }
}
