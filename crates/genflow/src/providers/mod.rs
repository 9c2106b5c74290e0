//! Text-generation providers and the fallback dispatcher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::credentials::{CredentialSource, ProviderKind, ResolvedCredentials, Resolver};
use crate::error::ProviderError;

pub mod dispatcher;
pub mod gemini;
pub mod openrouter;

pub use dispatcher::{Dispatched, Dispatcher, ProviderOrder, ProviderSlot};
pub use gemini::GeminiClient;
pub use openrouter::OpenRouterClient;

/// `GenerateText(prompt, model)`. Implementations must be safe to call from
/// many workers at once and must only return `Ok` for a complete,
/// non-empty text.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate_text(&self, prompt: &str, model: &str) -> Result<String, ProviderError>;
}

/// Upstream error bodies are cut to this many characters before they reach
/// a job's error text.
pub(crate) const MAX_ERROR_BODY: usize = 500;

pub(crate) fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[derive(Clone, Debug)]
pub struct ClientSettings {
    pub base_url: String,
    pub max_new_tokens: u32,
    /// Transport-level backstop. The dispatcher enforces the real deadline.
    pub http_timeout: Duration,
}

pub fn build_client(
    creds: &ResolvedCredentials,
    settings: ClientSettings,
) -> anyhow::Result<Arc<dyn TextGenerator>> {
    let client: Arc<dyn TextGenerator> = match creds.provider {
        ProviderKind::OpenRouter => Arc::new(OpenRouterClient::new(creds.api_key.clone(), settings)?),
        ProviderKind::Gemini => Arc::new(GeminiClient::new(creds.api_key.clone(), settings)?),
    };
    Ok(client)
}

/// Resolve every known provider, keep the ones with a key, and order them
/// primary first. The caller applies `ProviderOrder` through the dispatcher.
pub fn resolve_slots<S: CredentialSource>(
    resolver: &Resolver<S>,
    primary: ProviderKind,
    max_new_tokens: u32,
    call_timeout: Duration,
) -> anyhow::Result<Vec<ProviderSlot>> {
    let mut kinds = vec![primary];
    kinds.extend(ProviderKind::ALL.iter().copied().filter(|k| *k != primary));

    let mut slots = Vec::with_capacity(kinds.len());
    for kind in kinds {
        let Some(creds) = resolver.resolve(kind) else {
            tracing::warn!(
                provider = kind.name(),
                env = ?kind.key_env_vars(),
                file = kind.key_file_name(),
                "no api key found; provider skipped"
            );
            continue;
        };

        tracing::info!(
            provider = kind.name(),
            model = %creds.model,
            key_source = %creds.key_source,
            "provider configured"
        );

        let client = build_client(
            &creds,
            ClientSettings {
                base_url: resolver.base_url(kind),
                max_new_tokens,
                http_timeout: call_timeout + Duration::from_secs(5),
            },
        )?;

        slots.push(ProviderSlot::new(kind.name(), creds.model, client));
    }

    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::truncate;

    #[test]
    fn truncate_keeps_short_text() {
        assert_eq!(truncate("upstream down", 500), "upstream down");
    }

    #[test]
    fn truncate_cuts_on_char_boundary() {
        assert_eq!(truncate("héllo wörld", 5), "héllo...");
    }
}
