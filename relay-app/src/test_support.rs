//! Shared test doubles.

use async_trait::async_trait;
use relay_llm::{ChatMessage, CompletionBackend, LlmError, Result};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Completion backend that replays a fixed script of replies or failures and
/// records the message sequences it was sent.
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Result<String>>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedBackend {
    pub fn replying<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            script: Mutex::new(VecDeque::from([Err(LlmError::Http(message.to_string()))])),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn last_request(&self) -> Option<Vec<ChatMessage>> {
        self.requests.lock().expect("requests").last().cloned()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("requests").len()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<ChatMessage> {
        self.requests
            .lock()
            .expect("requests")
            .push(messages.to_vec());
        match self.script.lock().expect("script").pop_front() {
            Some(Ok(content)) => Ok(ChatMessage::assistant(content)),
            Some(Err(e)) => Err(e),
            None => Err(LlmError::Http("scripted backend exhausted".to_string())),
        }
    }
}
