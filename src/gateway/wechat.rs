use super::message::{InboundMessage, OutboundReply, ParseError, WireFormat};
use super::AppState;
use crate::cache::{Lookup, ReplyCache};
use crate::config::WeChatConfig;
use crate::observability::{Metrics, WebhookOutcome};
use crate::providers::ChatProvider;
use crate::security::verify_signature;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;

const ACK_BODY: &str = "success";
const ERROR_BODY: &str = "error";

/// Source of reply timestamps.
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct VerifyQuery {
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub echostr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("signature verification failed")]
    Verification,
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("chat provider failed: {0:#}")]
    Upstream(anyhow::Error),
}

/// What to send back for a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Bare `success` acknowledgment, nothing relayed.
    Ack,
    Reply { reply: OutboundReply, cached: bool },
}

/// Routes one delivery through verification, qualification, the reply cache
/// and the chat provider.
pub struct WebhookDispatcher {
    token: String,
    trigger_prefix: String,
    legacy_parse_error_status: bool,
    cache: ReplyCache<OutboundReply>,
    relay: Relay,
}

/// Everything an upstream call needs, owned so the call can outlive the
/// request that started it.
#[derive(Clone)]
struct Relay {
    max_tokens: u32,
    reply_char_budget: u32,
    provider: Arc<dyn ChatProvider>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
}

impl WebhookDispatcher {
    pub fn new(cfg: &WeChatConfig, provider: Arc<dyn ChatProvider>, metrics: Metrics) -> Self {
        Self {
            token: cfg.token.trim().to_string(),
            trigger_prefix: cfg.trigger_prefix.clone(),
            legacy_parse_error_status: cfg.legacy_parse_error_status,
            cache: ReplyCache::new(cfg.cache_capacity),
            relay: Relay {
                max_tokens: cfg.max_tokens,
                reply_char_budget: cfg.reply_char_budget(),
                provider,
                clock: Arc::new(SystemClock),
                metrics,
            },
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.relay.clock = clock;
        self
    }

    pub fn cache(&self) -> &ReplyCache<OutboundReply> {
        &self.cache
    }

    /// URL-verification handshake. Returns the `echostr` to echo back.
    pub fn verify(&self, query: &VerifyQuery) -> Result<String, WebhookError> {
        let ok = verify_signature(
            &query.signature,
            &query.timestamp,
            &query.nonce,
            &self.token,
        );
        if ok {
            self.relay.metrics.record_webhook(WebhookOutcome::VerifyOk);
            Ok(query.echostr.clone())
        } else {
            tracing::warn!(
                "WeChat handshake rejected: timestamp={} nonce={}",
                query.timestamp,
                query.nonce
            );
            self.relay.metrics.record_webhook(WebhookOutcome::VerifyFailed);
            Err(WebhookError::Verification)
        }
    }

    pub async fn dispatch(&self, body: &[u8], format: WireFormat) -> Result<Dispatch, WebhookError> {
        let result = self.dispatch_inner(body, format).await;
        let outcome = match &result {
            Ok(Dispatch::Ack) => WebhookOutcome::Ignored,
            Ok(Dispatch::Reply { cached: true, .. }) => WebhookOutcome::CacheHit,
            Ok(Dispatch::Reply { cached: false, .. }) => WebhookOutcome::Upstream,
            Err(WebhookError::Parse(_)) => WebhookOutcome::ParseError,
            Err(WebhookError::Upstream(_)) => WebhookOutcome::UpstreamError,
            Err(WebhookError::Verification) => WebhookOutcome::VerifyFailed,
        };
        self.relay.metrics.record_webhook(outcome);
        self.relay.metrics.set_reply_cache_entries(self.cache.len());
        result
    }

    async fn dispatch_inner(
        &self,
        body: &[u8],
        format: WireFormat,
    ) -> Result<Dispatch, WebhookError> {
        let inbound = InboundMessage::parse(body, format)?;

        let Some(question) = inbound.triggered_text(&self.trigger_prefix) else {
            tracing::debug!(
                "WeChat delivery acknowledged without reply: msg_type={} event={} msg_id={}",
                inbound.msg_type,
                inbound.event.as_deref().unwrap_or("-"),
                inbound.msg_id
            );
            return Ok(Dispatch::Ack);
        };

        if inbound.msg_id.is_empty() {
            tracing::info!("WeChat triggered message without MsgId; reply will not be cached");
            let reply = self.relay.ask(&inbound, question).await?;
            return Ok(Dispatch::Reply {
                reply,
                cached: false,
            });
        }

        // The upstream call runs detached from this request so a dropped
        // connection cannot cancel it; the platform's retry picks up its reply.
        let relay = self.relay.clone();
        let owned = inbound.clone();
        let question = question.to_string();
        let lookup = self
            .cache
            .get_or_try_insert_with(&inbound.msg_id, move || async move {
                relay.ask(&owned, &question).await
            })
            .await?;

        let cached = lookup.is_hit();
        if cached {
            tracing::info!("WeChat retry served from cache: msg_id={}", inbound.msg_id);
        }
        Ok(Dispatch::Reply {
            reply: Lookup::into_inner(lookup),
            cached,
        })
    }

    /// HTTP status used for a failed request.
    pub fn error_status(&self, err: &WebhookError) -> StatusCode {
        match err {
            WebhookError::Verification => StatusCode::FORBIDDEN,
            WebhookError::Parse(_) if self.legacy_parse_error_status => StatusCode::FORBIDDEN,
            WebhookError::Parse(_) => StatusCode::BAD_REQUEST,
            WebhookError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl Relay {
    async fn ask(&self, inbound: &InboundMessage, question: &str) -> Result<OutboundReply, WebhookError> {
        let prompt = build_prompt(question, self.reply_char_budget);
        tracing::info!(
            "WeChat relaying to {}: msg_id={} from={} chars={}",
            self.provider.name(),
            inbound.msg_id,
            inbound.from_user_name,
            question.chars().count()
        );

        self.metrics.record_upstream_call();
        let answer = self
            .provider
            .complete(&prompt, self.max_tokens)
            .await
            .map_err(|err| {
                tracing::error!("WeChat chat completion failed: msg_id={} {err:#}", inbound.msg_id);
                WebhookError::Upstream(err)
            })?;

        Ok(OutboundReply::text(inbound, answer.trim(), self.clock.now_unix()))
    }
}

/// Appends the reply-length instruction to the user's question.
///
/// The budget is in characters while the provider limit is in tokens; the
/// two only loosely correspond.
pub fn build_prompt(question: &str, char_budget: u32) -> String {
    if char_budget == 0 {
        return question.to_string();
    }
    format!("{question}\n\n请将回答控制在{char_budget}字以内。")
}

pub(super) async fn handle_verify(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> impl IntoResponse {
    match state.dispatcher.verify(&query) {
        Ok(echostr) => (StatusCode::OK, echostr).into_response(),
        Err(err) => (state.dispatcher.error_status(&err), ERROR_BODY).into_response(),
    }
}

pub(super) async fn handle_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let format = WireFormat::from_content_type(
        headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
    );

    let dispatched = match state.dispatcher.dispatch(&body, format).await {
        Ok(value) => value,
        Err(err) => {
            if matches!(err, WebhookError::Parse(_)) {
                tracing::warn!("WeChat delivery rejected: {err}");
            }
            return (state.dispatcher.error_status(&err), ERROR_BODY).into_response();
        }
    };

    match dispatched {
        Dispatch::Ack => (StatusCode::OK, ACK_BODY).into_response(),
        Dispatch::Reply { reply, .. } => match reply.render(format) {
            Ok(rendered) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, format.content_type())],
                rendered,
            )
                .into_response(),
            Err(err) => {
                tracing::error!("WeChat reply encode failed: {err}");
                (StatusCode::INTERNAL_SERVER_ERROR, ERROR_BODY).into_response()
            }
        },
    }
}
