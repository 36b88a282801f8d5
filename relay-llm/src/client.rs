use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, Role};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Seam between the conversation logic and the completion transport.
/// Production uses [`CompletionClient`]; tests script their own backend.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Submit the ordered message sequence and return the single reply message.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<ChatMessage>;
}

#[derive(Clone)]
pub struct CompletionClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl CompletionClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(api_key: &str, base_url: &str, model: &str, timeout: std::time::Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            http,
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl CompletionBackend for CompletionClient {
    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model, message_count = messages.len()))]
    async fn complete(&self, messages: &[ChatMessage]) -> Result<ChatMessage> {
        if messages.is_empty() {
            return Err(LlmError::InvalidInput(
                "at least one message is required".to_string(),
            ));
        }

        let req = ChatCompletionRequest {
            model: &self.model,
            messages,
            stream: false,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "chat completion status={status} body={body}"
            )));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body)?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::ResponseFormat("response carried no choices".to_string()))?;

        Ok(ChatMessage {
            role: parse_role(choice.message.role.as_deref()),
            content: choice.message.content.unwrap_or_default(),
        })
    }
}

fn parse_role(role: Option<&str>) -> Role {
    match role {
        Some("system") => Role::System,
        Some("user") => Role::User,
        _ => Role::Assistant,
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionMessage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionMessage {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_choice_is_taken_and_role_defaults_to_assistant() {
        let body = r#"{
            "choices": [
                {"message": {"role": "assistant", "content": "hi"}},
                {"message": {"role": "assistant", "content": "ignored"}}
            ]
        }"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(body).expect("parse response");
        let choice = parsed.choices.into_iter().next().expect("first choice");
        assert_eq!(choice.message.content.as_deref(), Some("hi"));
        assert_eq!(parse_role(choice.message.role.as_deref()), Role::Assistant);
        assert_eq!(parse_role(None), Role::Assistant);
        assert_eq!(parse_role(Some("unknown")), Role::Assistant);
    }

    #[test]
    fn empty_choices_is_a_format_error() {
        let parsed: ChatCompletionResponse =
            serde_json::from_str(r#"{"choices": []}"#).expect("parse response");
        assert!(parsed.choices.is_empty());
    }

    #[test]
    fn request_serializes_ordered_messages() {
        let messages = vec![ChatMessage::user("first"), ChatMessage::assistant("second")];
        let req = ChatCompletionRequest {
            model: "deepseek-chat",
            messages: &messages,
            stream: false,
        };
        let json = serde_json::to_value(&req).expect("serialize request");
        assert_eq!(json["model"], "deepseek-chat");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"], "first");
        assert_eq!(json["messages"][1]["role"], "assistant");
        assert_eq!(json["stream"], false);
    }
}
