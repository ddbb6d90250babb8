use super::sanitize_api_error;
use super::traits::ChatProvider;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// MiniMax `text/chatcompletion` client.
pub struct MiniMaxProvider {
    endpoint: String,
    group_id: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct MiniMaxRequest<'a> {
    model: &'a str,
    tokens_to_generate: u32,
    messages: Vec<MiniMaxMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct MiniMaxMessage<'a> {
    sender_type: &'static str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct MiniMaxResponse {
    #[serde(default)]
    reply: Option<String>,
    #[serde(default)]
    base_resp: Option<BaseResp>,
}

#[derive(Debug, Deserialize)]
struct BaseResp {
    #[serde(default)]
    status_code: i64,
    #[serde(default)]
    status_msg: String,
}

impl MiniMaxProvider {
    pub fn new(endpoint: &str, group_id: &str, api_key: Option<&str>, model: &str) -> Self {
        Self {
            endpoint: endpoint.trim().to_string(),
            group_id: group_id.trim().to_string(),
            api_key: api_key
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(ToOwned::to_owned),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChatProvider for MiniMaxProvider {
    fn name(&self) -> &str {
        "minimax"
    }

    async fn complete(&self, prompt: &str, max_tokens: u32) -> anyhow::Result<String> {
        let request = MiniMaxRequest {
            model: &self.model,
            tokens_to_generate: max_tokens,
            messages: vec![MiniMaxMessage {
                sender_type: "USER",
                text: prompt,
            }],
        };

        let mut builder = self
            .client
            .post(&self.endpoint)
            .query(&[("GroupId", self.group_id.as_str())])
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.context("MiniMax request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(
                "MiniMax completion failed: {status} — {}",
                sanitize_api_error(&body)
            );
            anyhow::bail!("MiniMax API error: {status}");
        }

        let parsed: MiniMaxResponse = response
            .json()
            .await
            .context("failed to decode MiniMax completion response")?;

        if let Some(base) = parsed.base_resp.as_ref().filter(|b| b.status_code != 0) {
            anyhow::bail!(
                "MiniMax API error {}: {}",
                base.status_code,
                sanitize_api_error(&base.status_msg)
            );
        }

        parsed
            .reply
            .context("MiniMax completion response had no reply")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn complete_sends_group_id_and_reads_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/text/chatcompletion"))
            .and(query_param("GroupId", "g-1"))
            .and(header("authorization", "Bearer mm-key"))
            .and(body_partial_json(json!({
                "model": "abab5.5-chat",
                "tokens_to_generate": 512,
                "messages": [{"sender_type": "USER", "text": "你好"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "reply": "你好！",
                "base_resp": {"status_code": 0, "status_msg": "success"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = MiniMaxProvider::new(
            &format!("{}/v1/text/chatcompletion", server.uri()),
            "g-1",
            Some("mm-key"),
            "abab5.5-chat",
        );
        assert_eq!(provider.complete("你好", 512).await.unwrap(), "你好！");
    }

    #[tokio::test]
    async fn business_error_code_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "reply": "",
                "base_resp": {"status_code": 1004, "status_msg": "authentication failed"}
            })))
            .mount(&server)
            .await;

        let provider = MiniMaxProvider::new(&server.uri(), "g", Some("bad"), "abab5.5-chat");
        let err = provider.complete("hi", 64).await.unwrap_err();
        assert!(err.to_string().contains("1004"));
    }
}
