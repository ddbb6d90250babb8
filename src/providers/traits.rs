use async_trait::async_trait;
use serde::Serialize;

/// One message in an OpenAI-style chat transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// A chat-completion backend.
///
/// Implementations make exactly one HTTP request per call: no retries, no
/// backoff, and no timeout beyond the HTTP client's default.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Short provider name for logs and metrics.
    fn name(&self) -> &str;

    /// Sends `prompt` as a single user turn and returns the reply text.
    async fn complete(&self, prompt: &str, max_tokens: u32) -> anyhow::Result<String>;
}
