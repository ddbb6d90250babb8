use anyhow::{Context, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "wxrelay=info,tower_http=info";

/// Installs the global fmt subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// How a webhook request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    VerifyOk,
    VerifyFailed,
    ParseError,
    Ignored,
    CacheHit,
    Upstream,
    UpstreamError,
}

impl WebhookOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VerifyOk => "verify_ok",
            Self::VerifyFailed => "verify_failed",
            Self::ParseError => "parse_error",
            Self::Ignored => "ignored",
            Self::CacheHit => "cache_hit",
            Self::Upstream => "upstream",
            Self::UpstreamError => "upstream_error",
        }
    }
}

/// Prometheus collectors owned by one gateway instance.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    webhook_requests: IntCounterVec,
    upstream_calls: IntCounter,
    reply_cache_entries: IntGauge,
    counter_requests: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let webhook_requests = IntCounterVec::new(
            Opts::new(
                "wxrelay_webhook_requests_total",
                "Webhook requests by outcome",
            ),
            &["outcome"],
        )?;
        let upstream_calls = IntCounter::new(
            "wxrelay_upstream_calls_total",
            "Chat completion requests sent upstream",
        )?;
        let reply_cache_entries = IntGauge::new(
            "wxrelay_reply_cache_entries",
            "Replies currently held in the duplicate-delivery cache",
        )?;
        let counter_requests = IntCounterVec::new(
            Opts::new("wxrelay_counter_requests_total", "Counter API requests by action"),
            &["action"],
        )?;

        registry.register(Box::new(webhook_requests.clone()))?;
        registry.register(Box::new(upstream_calls.clone()))?;
        registry.register(Box::new(reply_cache_entries.clone()))?;
        registry.register(Box::new(counter_requests.clone()))?;

        Ok(Self {
            registry,
            webhook_requests,
            upstream_calls,
            reply_cache_entries,
            counter_requests,
        })
    }

    pub fn record_webhook(&self, outcome: WebhookOutcome) {
        self.webhook_requests
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    pub fn webhook_count(&self, outcome: WebhookOutcome) -> u64 {
        self.webhook_requests
            .with_label_values(&[outcome.as_str()])
            .get()
    }

    pub fn record_upstream_call(&self) {
        self.upstream_calls.inc();
    }

    pub fn upstream_call_count(&self) -> u64 {
        self.upstream_calls.get()
    }

    pub fn set_reply_cache_entries(&self, len: usize) {
        self.reply_cache_entries
            .set(i64::try_from(len).unwrap_or(i64::MAX));
    }

    pub fn record_counter_action(&self, action: &str) {
        self.counter_requests.with_label_values(&[action]).inc();
    }

    /// Text exposition format for `/metrics`.
    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .context("failed to encode metrics")?;
        String::from_utf8(buf).context("metrics output is not utf-8")
    }
}
