//! Completion invoker: one conversation turn against the downstream service.

use crate::session::SessionStore;
use relay_llm::{ChatMessage, CompletionBackend, Result};
use std::sync::Arc;

/// The assistant turn produced for a request, plus whether this call trimmed
/// the session's history window.
#[derive(Debug, Clone)]
pub struct Reply {
    pub message: ChatMessage,
    pub limit_reached: bool,
}

pub struct CompletionInvoker {
    backend: Arc<dyn CompletionBackend>,
    store: Arc<SessionStore>,
    system_prompt: Option<String>,
}

impl CompletionInvoker {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        store: Arc<SessionStore>,
        system_prompt: Option<String>,
    ) -> Self {
        Self {
            backend,
            store,
            system_prompt,
        }
    }

    /// Appends the user turn, submits the full ordered history, appends the
    /// reply, and returns it. History before the sliding window is gone for
    /// good; the window bounds request size, it does not summarize.
    #[tracing::instrument(level = "info", skip_all, fields(session_id = %session_id))]
    pub async fn invoke(&self, session_id: &str, user_input: &str) -> Result<Reply> {
        let (history, trimmed_on_user) = self.store.append_user_turn(session_id, user_input);

        let mut outbound = Vec::with_capacity(history.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            outbound.push(ChatMessage::system(prompt));
        }
        outbound.extend(history);

        let completion = self.backend.complete(&outbound).await?;
        let message = ChatMessage::assistant(completion.content);
        let (_, trimmed_on_assistant) = self
            .store
            .append_assistant_turn(session_id, message.clone());

        Ok(Reply {
            message,
            limit_reached: trimmed_on_user || trimmed_on_assistant,
        })
    }
}
