//! Session store: session id -> bounded conversation history.
//!
//! The single source of truth for what a session has said so far. Histories
//! are capped by a sliding window; once full, the oldest turns fall off.
//! Every mutation notifies admin observers through a broadcast channel.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_llm::ChatMessage;
use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionsChanged,
    SessionCleared { session_id: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub messages: usize,
}

#[derive(Debug, Clone)]
struct SessionEntry {
    history: Vec<ChatMessage>,
    created_at: DateTime<Utc>,
    last_active: DateTime<Utc>,
}

impl SessionEntry {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            history: Vec::new(),
            created_at: now,
            last_active: now,
        }
    }
}

pub struct SessionStore {
    sessions: DashMap<String, SessionEntry>,
    max_turns: usize,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionStore {
    pub fn new(max_turns: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sessions: DashMap::new(),
            max_turns,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Appends a user turn, creating the session on first reference.
    /// Returns the post-trim history and whether the window trimmed.
    pub fn append_user_turn(&self, session_id: &str, text: &str) -> (Vec<ChatMessage>, bool) {
        self.append(session_id, ChatMessage::user(text))
    }

    /// Appends an assistant turn. Returns the post-trim history and whether
    /// the window trimmed.
    pub fn append_assistant_turn(
        &self,
        session_id: &str,
        message: ChatMessage,
    ) -> (Vec<ChatMessage>, bool) {
        self.append(session_id, message)
    }

    fn append(&self, session_id: &str, message: ChatMessage) -> (Vec<ChatMessage>, bool) {
        let (history, trimmed) = {
            let mut entry = self
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(SessionEntry::new);
            entry.history.push(message);
            let trimmed = entry.history.len() > self.max_turns;
            if trimmed {
                let excess = entry.history.len() - self.max_turns;
                entry.history.drain(..excess);
            }
            entry.last_active = Utc::now();
            (entry.history.clone(), trimmed)
        };
        let _ = self.events.send(SessionEvent::SessionsChanged);
        (history, trimmed)
    }

    /// Current history without mutation; empty for unknown sessions.
    pub fn snapshot(&self, session_id: &str) -> Vec<ChatMessage> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.history.clone())
            .unwrap_or_default()
    }

    /// Removes a session entirely. Clearing an absent session is a no-op:
    /// no error, no observer notification.
    pub fn clear(&self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        if removed {
            let _ = self.events.send(SessionEvent::SessionCleared {
                session_id: session_id.to_string(),
            });
            let _ = self.events.send(SessionEvent::SessionsChanged);
        }
        removed
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| SessionSummary {
                session_id: entry.key().clone(),
                created_at: entry.value().created_at,
                last_active: entry.value().last_active,
                messages: entry.value().history.len(),
            })
            .collect();
        out.sort_by_key(|s| s.last_active);
        out.reverse();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_llm::Role;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn history_grows_in_order_until_the_cap() {
        let store = SessionStore::new(10);
        let (history, trimmed) = store.append_user_turn("s1", "hello");
        assert_eq!(history.len(), 1);
        assert!(!trimmed);

        let (history, trimmed) = store.append_assistant_turn("s1", ChatMessage::assistant("hi"));
        assert!(!trimmed);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].content, "hello");
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].content, "hi");
    }

    #[test]
    fn overflow_evicts_oldest_first() {
        let store = SessionStore::new(10);
        for i in 0..10 {
            let (_, trimmed) = store.append_user_turn("s1", &format!("turn-{i}"));
            assert!(!trimmed);
        }

        let (history, trimmed) = store.append_user_turn("s1", "turn-10");
        assert!(trimmed);
        assert_eq!(history.len(), 10);
        assert_eq!(history[0].content, "turn-1");
        assert_eq!(history[9].content, "turn-10");

        let snapshot = store.snapshot("s1");
        assert_eq!(snapshot.len(), 10);
        assert_eq!(snapshot[0].content, "turn-1");
    }

    #[test]
    fn snapshot_of_unknown_session_is_empty() {
        let store = SessionStore::new(10);
        assert!(store.snapshot("missing").is_empty());
        assert!(store.list().is_empty());
    }

    #[test]
    fn clear_removes_the_session_and_notifies() {
        let store = SessionStore::new(10);
        store.append_user_turn("s1", "hello");
        let mut events = store.subscribe();

        assert!(store.clear("s1"));
        assert!(store.snapshot("s1").is_empty());
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::SessionCleared { ref session_id }) if session_id == "s1"
        ));
        assert!(matches!(events.try_recv(), Ok(SessionEvent::SessionsChanged)));
    }

    #[test]
    fn clearing_an_absent_session_is_a_silent_no_op() {
        let store = SessionStore::new(10);
        let mut events = store.subscribe();

        assert!(!store.clear("never-seen"));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn mutations_notify_observers() {
        let store = SessionStore::new(10);
        let mut events = store.subscribe();
        store.append_user_turn("s1", "hello");
        assert!(matches!(events.try_recv(), Ok(SessionEvent::SessionsChanged)));
    }
}
