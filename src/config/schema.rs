use anyhow::{Context, Result};
use directories::ProjectDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::cache::DEFAULT_REPLY_CACHE_CAPACITY;

/// Environment variable pointing at an explicit config file.
pub const CONFIG_PATH_ENV: &str = "WXRELAY_CONFIG";

const DEFAULT_VERIFY_TOKEN: &str = "tankkyo_chatbot";
const DEFAULT_TRIGGER_PREFIX: &str = "助手";
const DEFAULT_OPENAI_API_BASE: &str = "https://api.chatanywhere.com.cn/v1";
const DEFAULT_OPENAI_MODEL: &str = "gpt-3.5-turbo";
const DEFAULT_MINIMAX_ENDPOINT: &str = "https://api.minimax.chat/v1/text/chatcompletion";
const DEFAULT_MINIMAX_MODEL: &str = "abab5.5-chat";

// ── Top-level ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub wechat: WeChatConfig,
    pub provider: ProviderConfig,
    pub database: DatabaseConfig,
}

// ── Gateway ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct GatewayConfig {
    /// Interface to bind.
    pub host: String,
    pub port: u16,
    /// Request bodies larger than this are rejected with 413.
    pub max_body_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 80,
            max_body_bytes: 64 * 1024,
        }
    }
}

// ── WeChat webhook ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct WeChatConfig {
    /// Shared token configured in the official-account console.
    pub token: String,
    /// Text messages starting with this prefix are relayed to the chat provider.
    pub trigger_prefix: String,
    /// Number of replies remembered for duplicate-delivery suppression.
    pub cache_capacity: usize,
    /// Token budget passed to the chat provider.
    pub max_tokens: u32,
    /// Subtracted from `max_tokens` to get the character budget stated in the
    /// prompt. Tokens and characters do not map 1:1; this is only a rough cap.
    pub reply_char_margin: u32,
    /// Answer malformed webhook bodies with 403 instead of 400.
    pub legacy_parse_error_status: bool,
}

impl Default for WeChatConfig {
    fn default() -> Self {
        Self {
            token: DEFAULT_VERIFY_TOKEN.to_string(),
            trigger_prefix: DEFAULT_TRIGGER_PREFIX.to_string(),
            cache_capacity: DEFAULT_REPLY_CACHE_CAPACITY,
            max_tokens: 256,
            reply_char_margin: 10,
            legacy_parse_error_status: false,
        }
    }
}

impl WeChatConfig {
    /// Character budget requested from the model.
    pub fn reply_char_budget(&self) -> u32 {
        self.max_tokens.saturating_sub(self.reply_char_margin)
    }
}

// ── Chat provider ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    OpenAi,
    MiniMax,
}

impl std::str::FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openai" | "chatgpt" => Ok(Self::OpenAi),
            "minimax" => Ok(Self::MiniMax),
            other => anyhow::bail!("unknown chat provider `{other}` (expected openai or minimax)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// Base URL of an OpenAI-compatible API.
    pub api_base: String,
    pub api_key: Option<String>,
    /// Model name. Empty selects the provider default.
    pub model: String,
    /// MiniMax group id, sent as the `GroupId` query parameter.
    pub group_id: Option<String>,
    /// MiniMax chat-completion endpoint.
    pub endpoint: String,
    pub temperature: f64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::OpenAi,
            api_base: DEFAULT_OPENAI_API_BASE.to_string(),
            api_key: None,
            model: String::new(),
            group_id: None,
            endpoint: DEFAULT_MINIMAX_ENDPOINT.to_string(),
            temperature: 0.0,
        }
    }
}

impl ProviderConfig {
    pub fn model_or_default(&self) -> &str {
        let model = self.model.trim();
        if !model.is_empty() {
            return model;
        }
        match self.kind {
            ProviderKind::OpenAi => DEFAULT_OPENAI_MODEL,
            ProviderKind::MiniMax => DEFAULT_MINIMAX_MODEL,
        }
    }
}

// ── Counter database ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file holding the counter table. `~` is expanded.
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/wxrelay.db".to_string(),
        }
    }
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).into_owned())
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl Config {
    /// Loads defaults, then the TOML file, then environment overrides.
    ///
    /// An explicit `path` must exist. Without one, `$WXRELAY_CONFIG` and then
    /// the platform config directory are tried, and a missing file just means
    /// defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        report_dotenv(dotenvy::dotenv());

        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));

        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };

        config.apply_env_overrides(&std::env::vars().collect());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Applies the deployment environment on top of file values.
    ///
    /// Blank values are ignored so an exported-but-empty variable does not wipe
    /// a default.
    pub fn apply_env_overrides(&mut self, env: &HashMap<String, String>) {
        let get = |key: &str| {
            env.get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(ToOwned::to_owned)
        };

        if let Some(token) = get("VERIFY_TOKEN") {
            self.wechat.token = token;
        }
        if let Some(kind) = get("CHAT_PROVIDER") {
            match kind.parse() {
                Ok(kind) => self.provider.kind = kind,
                Err(err) => tracing::warn!("ignoring CHAT_PROVIDER: {err}"),
            }
        }

        match self.provider.kind {
            ProviderKind::OpenAi => {
                if let Some(base) = get("OPENAI_API_BASE") {
                    self.provider.api_base = base;
                }
                if let Some(key) = get("OPENAI_API_KEY") {
                    self.provider.api_key = Some(key);
                }
                if let Some(model) = get("OPENAI_MODEL") {
                    self.provider.model = model;
                }
            }
            ProviderKind::MiniMax => {
                if let Some(endpoint) = get("MINIMAX_ENDPOINT") {
                    self.provider.endpoint = endpoint;
                }
                if let Some(key) = get("MINIMAX_API_KEY") {
                    self.provider.api_key = Some(key);
                }
                if let Some(group_id) = get("MINIMAX_GROUP_ID") {
                    self.provider.group_id = Some(group_id);
                }
                if let Some(model) = get("MINIMAX_MODEL") {
                    self.provider.model = model;
                }
            }
        }

        if let Some(path) = get("DATABASE_PATH") {
            self.database.path = path;
        }
        if let Some(host) = get("HOST") {
            self.gateway.host = host;
        }
        if let Some(port) = get("PORT") {
            match port.parse() {
                Ok(port) => self.gateway.port = port,
                Err(_) => tracing::warn!("ignoring non-numeric PORT={port}"),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.wechat.token.trim().is_empty() {
            anyhow::bail!("wechat.token must not be empty");
        }
        if self.wechat.trigger_prefix.is_empty() {
            anyhow::bail!("wechat.trigger_prefix must not be empty");
        }
        if self.wechat.max_tokens == 0 {
            anyhow::bail!("wechat.max_tokens must be greater than zero");
        }
        if self.gateway.max_body_bytes == 0 {
            anyhow::bail!("gateway.max_body_bytes must be greater than zero");
        }
        if !(0.0..=2.0).contains(&self.provider.temperature) {
            anyhow::bail!("provider.temperature must be within 0.0..=2.0");
        }
        if self.database.path.trim().is_empty() {
            anyhow::bail!("database.path must not be empty");
        }
        if self.provider.api_key.as_deref().is_none_or(|k| k.trim().is_empty()) {
            tracing::warn!("no chat provider API key configured; relayed messages will fail");
        }
        Ok(())
    }

    /// JSON schema of the config file, for editor tooling.
    pub fn json_schema() -> Result<String> {
        let schema = schemars::schema_for!(Config);
        Ok(serde_json::to_string_pretty(&schema)?)
    }
}

fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "wxrelay").map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Logs a `.env` that exists but could not be loaded. Returns `true` when it
/// did. A missing file is the normal case and stays quiet.
fn report_dotenv<T>(result: dotenvy::Result<T>) -> bool {
    match result {
        Err(err) if !err.not_found() => {
            tracing::warn!("Ignoring .env file that failed to load: {err}");
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_deployment_conventions() {
        let cfg = Config::default();
        assert_eq!(cfg.wechat.token, "tankkyo_chatbot");
        assert_eq!(cfg.wechat.cache_capacity, 100);
        assert_eq!(cfg.wechat.reply_char_budget(), 246);
        assert_eq!(cfg.provider.kind, ProviderKind::OpenAi);
        assert_eq!(cfg.provider.model_or_default(), "gpt-3.5-turbo");
        cfg.validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let cfg = Config::from_toml(
            r#"
            [wechat]
            token = "file-token"
            max_tokens = 512

            [provider]
            kind = "minimax"
            group_id = "g-1"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.wechat.token, "file-token");
        assert_eq!(cfg.wechat.reply_char_budget(), 502);
        assert_eq!(cfg.wechat.trigger_prefix, "助手");
        assert_eq!(cfg.provider.kind, ProviderKind::MiniMax);
        assert_eq!(cfg.provider.model_or_default(), "abab5.5-chat");
        assert_eq!(cfg.gateway.port, 80);
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut cfg = Config::from_toml("[wechat]\ntoken = \"file-token\"\n").unwrap();
        cfg.apply_env_overrides(&env(&[
            ("VERIFY_TOKEN", "env-token"),
            ("OPENAI_API_BASE", "http://localhost:9999/v1"),
            ("OPENAI_API_KEY", "sk-test"),
            ("PORT", "8080"),
        ]));
        assert_eq!(cfg.wechat.token, "env-token");
        assert_eq!(cfg.provider.api_base, "http://localhost:9999/v1");
        assert_eq!(cfg.provider.api_key.as_deref(), Some("sk-test"));
        assert_eq!(cfg.gateway.port, 8080);
    }

    #[test]
    fn blank_env_values_are_ignored() {
        let mut cfg = Config::default();
        cfg.apply_env_overrides(&env(&[("VERIFY_TOKEN", "  "), ("PORT", "")]));
        assert_eq!(cfg.wechat.token, "tankkyo_chatbot");
        assert_eq!(cfg.gateway.port, 80);
    }

    #[test]
    fn minimax_env_applies_only_to_minimax() {
        let mut cfg = Config::default();
        cfg.apply_env_overrides(&env(&[
            ("CHAT_PROVIDER", "minimax"),
            ("MINIMAX_API_KEY", "mm-key"),
            ("MINIMAX_GROUP_ID", "42"),
            ("OPENAI_API_KEY", "sk-ignored"),
        ]));
        assert_eq!(cfg.provider.kind, ProviderKind::MiniMax);
        assert_eq!(cfg.provider.api_key.as_deref(), Some("mm-key"));
        assert_eq!(cfg.provider.group_id.as_deref(), Some("42"));
    }

    #[test]
    fn reply_budget_saturates_at_zero() {
        let cfg = WeChatConfig {
            max_tokens: 5,
            ..WeChatConfig::default()
        };
        assert_eq!(cfg.reply_char_budget(), 0);
    }

    #[test]
    fn validate_rejects_empty_token() {
        let mut cfg = Config::default();
        cfg.wechat.token = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[database]\npath = \"/tmp/counter.db\"\n").unwrap();
        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.database.resolved_path(), PathBuf::from("/tmp/counter.db"));
    }

    #[test]
    fn schema_export_mentions_sections() {
        let schema = Config::json_schema().unwrap();
        assert!(schema.contains("wechat"));
        assert!(schema.contains("trigger_prefix"));
    }

    #[test]
    fn malformed_dotenv_is_reported_and_missing_one_is_not() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join(".env");
        std::fs::write(&broken, "this line is not an assignment\n").unwrap();

        assert!(report_dotenv(dotenvy::from_path(&broken)));
        assert!(!report_dotenv(dotenvy::from_path(dir.path().join("absent.env"))));
        assert!(!report_dotenv(Ok(())));
    }
}
