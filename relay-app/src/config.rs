//! Relay configuration loader.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    75
}

fn default_http_max_in_flight() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

fn default_base_url() -> String {
    "https://api.deepseek.com".to_string()
}

fn default_request_timeout_seconds() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Broker address, e.g. `redis://127.0.0.1:6379`. Absent means no queue:
    /// requests are invoked directly.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_stream")]
    pub stream: String,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default = "default_queue_max_length")]
    pub max_length: u64,
    #[serde(default = "default_message_ttl_seconds")]
    pub message_ttl_seconds: u64,
    #[serde(default = "default_reconnect_delay_seconds")]
    pub reconnect_delay_seconds: u64,
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
    /// Processing attempts per entry before it is dropped as poison.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_stream() -> String {
    "relay:requests".to_string()
}

fn default_group() -> String {
    "relay".to_string()
}

fn default_queue_max_length() -> u64 {
    1024
}

fn default_message_ttl_seconds() -> u64 {
    60
}

fn default_reconnect_delay_seconds() -> u64 {
    5
}

fn default_block_ms() -> u64 {
    5_000
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: None,
            stream: default_stream(),
            group: default_group(),
            max_length: default_queue_max_length(),
            message_ttl_seconds: default_message_ttl_seconds(),
            reconnect_delay_seconds: default_reconnect_delay_seconds(),
            block_ms: default_block_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Sliding-window cap on stored turns per session.
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default = "default_response_timeout_seconds")]
    pub response_timeout_seconds: u64,
}

fn default_max_turns() -> usize {
    10
}

fn default_response_timeout_seconds() -> u64 {
    30
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            response_timeout_seconds: default_response_timeout_seconds(),
        }
    }
}

impl RelayConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            // A missing file is fine: defaults plus env vars carry a dev setup.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        let mut cfg: RelayConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RELAY_BIND_ADDR") {
            if !v.trim().is_empty() {
                self.server.bind_addr = v;
            }
        }
        if let Ok(v) = std::env::var("RELAY_MODEL") {
            if !v.trim().is_empty() {
                self.llm.model = v;
            }
        }
        if let Ok(v) = std::env::var("RELAY_LLM_BASE_URL") {
            if !v.trim().is_empty() {
                self.llm.base_url = v;
            }
        }
        for key in ["DEEPSEEK_API_KEY", "OPENAI_API_KEY"] {
            if let Ok(v) = std::env::var(key) {
                if !v.trim().is_empty() {
                    self.llm.api_key = v;
                    break;
                }
            }
        }
        for key in ["RELAY_QUEUE_URL", "REDIS_URL"] {
            if let Ok(v) = std::env::var(key) {
                if !v.trim().is_empty() {
                    self.queue.url = Some(v);
                    break;
                }
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.llm.api_key.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "llm.api_key is required (or set DEEPSEEK_API_KEY / OPENAI_API_KEY)"
            ));
        }
        if self.llm.model.trim().is_empty() {
            return Err(anyhow::anyhow!("llm.model is required"));
        }
        if self.queue.stream.trim().is_empty() {
            return Err(anyhow::anyhow!("queue.stream is required"));
        }
        if self.queue.group.trim().is_empty() {
            return Err(anyhow::anyhow!("queue.group is required"));
        }
        if self.queue.max_attempts == 0 {
            return Err(anyhow::anyhow!("queue.max_attempts must be > 0"));
        }
        if self.session.max_turns == 0 {
            return Err(anyhow::anyhow!("session.max_turns must be > 0"));
        }
        if self.session.response_timeout_seconds == 0 {
            return Err(anyhow::anyhow!(
                "session.response_timeout_seconds must be > 0"
            ));
        }
        self.server
            .bind_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow::anyhow!("server.bind_addr is invalid: {e}"))?;
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.session.response_timeout_seconds)
    }

    pub fn queue_policy(&self) -> relay_broker::QueuePolicy {
        relay_broker::QueuePolicy {
            stream: self.queue.stream.clone(),
            group: self.queue.group.clone(),
            consumer: format!("relay-{}", std::process::id()),
            max_length: self.queue.max_length,
            message_ttl: Duration::from_secs(self.queue.message_ttl_seconds),
            reconnect_delay: Duration::from_secs(self.queue.reconnect_delay_seconds),
            block: Duration::from_millis(self.queue.block_ms),
        }
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".relay").join("config.toml")
}
