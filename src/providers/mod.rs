pub mod minimax;
pub mod openai;
pub mod traits;

pub use minimax::MiniMaxProvider;
pub use openai::OpenAiProvider;
pub use traits::{ChatMessage, ChatProvider};

use crate::config::{ProviderConfig, ProviderKind};
use std::sync::Arc;

const API_ERROR_MAX_CHARS: usize = 200;

/// Builds the configured chat provider.
pub fn create_provider(cfg: &ProviderConfig) -> anyhow::Result<Arc<dyn ChatProvider>> {
    let model = cfg.model_or_default();
    match cfg.kind {
        ProviderKind::OpenAi => Ok(Arc::new(OpenAiProvider::new(
            &cfg.api_base,
            cfg.api_key.as_deref(),
            model,
            cfg.temperature,
        ))),
        ProviderKind::MiniMax => {
            let Some(group_id) = cfg.group_id.as_deref().filter(|g| !g.trim().is_empty()) else {
                anyhow::bail!("provider.group_id (MINIMAX_GROUP_ID) is required for minimax");
            };
            Ok(Arc::new(MiniMaxProvider::new(
                &cfg.endpoint,
                group_id,
                cfg.api_key.as_deref(),
                model,
            )))
        }
    }
}

/// Collapses whitespace and truncates a vendor error body for logging.
pub fn sanitize_api_error(body: &str) -> String {
    let collapsed = body.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= API_ERROR_MAX_CHARS {
        return collapsed;
    }
    let mut truncated: String = collapsed.chars().take(API_ERROR_MAX_CHARS).collect();
    truncated.push('…');
    truncated
}
