//! Downstream completion client.
//!
//! Speaks the OpenAI-compatible `/chat/completions` wire shape: an ordered
//! list of `{role, content}` messages in, the first choice's message out.

mod client;
mod error;
mod types;

pub use client::{CompletionBackend, CompletionClient};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, Role};
