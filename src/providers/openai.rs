use super::traits::{ChatMessage, ChatProvider};
use super::sanitize_api_error;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// OpenAI-compatible `/chat/completions` client.
///
/// Works with the official API and with relays that mirror it under a
/// different base URL.
pub struct OpenAiProvider {
    api_base: String,
    api_key: Option<String>,
    model: String,
    temperature: f64,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiProvider {
    pub fn new(api_base: &str, api_key: Option<&str>, model: &str, temperature: f64) -> Self {
        Self {
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            api_key: api_key
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(ToOwned::to_owned),
            model: model.to_string(),
            temperature,
            client: reqwest::Client::new(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, prompt: &str, max_tokens: u32) -> anyhow::Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage::user(prompt)],
            temperature: self.temperature,
            max_tokens,
        };

        let mut builder = self.client.post(self.completions_url()).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .context("OpenAI request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(
                "OpenAI completion failed: {status} — {}",
                sanitize_api_error(&body)
            );
            anyhow::bail!("OpenAI API error: {status}");
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .context("failed to decode OpenAI completion response")?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .context("OpenAI completion response had no message content")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn complete_posts_single_user_turn() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "gpt-3.5-turbo",
                "temperature": 0.0,
                "max_tokens": 256,
                "messages": [{"role": "user", "content": "hello"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "hi there"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(
            &format!("{}/v1/", server.uri()),
            Some("sk-test"),
            "gpt-3.5-turbo",
            0.0,
        );
        let reply = provider.complete("hello", 256).await.unwrap();
        assert_eq!(reply, "hi there");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .expect(1)
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(&server.uri(), None, "gpt-3.5-turbo", 0.0);
        let err = provider.complete("hello", 16).await.unwrap_err();
        assert!(err.to_string().contains("429"));
    }

    #[tokio::test]
    async fn empty_choices_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(&server.uri(), Some("k"), "m", 0.0);
        assert!(provider.complete("hello", 16).await.is_err());
    }
}
