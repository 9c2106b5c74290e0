use std::sync::Arc;
use std::time::{Duration, Instant};

use super::TextGenerator;
use crate::cache::ResponseCache;
use crate::error::{DispatchError, ProviderError, ProviderFailure};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProviderOrder {
    #[default]
    PrimaryFirst,
    Reversed,
}

impl ProviderOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "primary-first" | "primary_first" | "default" => Some(ProviderOrder::PrimaryFirst),
            "reversed" | "reverse" | "fallback-first" => Some(ProviderOrder::Reversed),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct ProviderSlot {
    pub name: String,
    pub model: String,
    pub client: Arc<dyn TextGenerator>,
}

impl ProviderSlot {
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        client: Arc<dyn TextGenerator>,
    ) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            client,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub text: String,
    pub provider: String,
    pub latency_ms: u64,
    /// Served from the response cache; no provider was called.
    pub cached: bool,
}

/// Tries providers in a fixed order and returns the first complete answer.
///
/// The order is decided at construction and never changes afterwards, so
/// every dispatch made through one `Dispatcher` sees the same sequence.
#[derive(Clone)]
pub struct Dispatcher {
    slots: Arc<Vec<ProviderSlot>>,
    call_timeout: Duration,
    cache: Option<Arc<ResponseCache>>,
}

impl Dispatcher {
    /// `slots` are given primary first; `order` may reverse them.
    pub fn new(mut slots: Vec<ProviderSlot>, order: ProviderOrder, call_timeout: Duration) -> Self {
        if order == ProviderOrder::Reversed {
            slots.reverse();
        }
        Self {
            slots: Arc::new(slots),
            call_timeout,
            cache: None,
        }
    }

    /// Answer from `cache` when any configured (provider, model) pair has the
    /// prompt cached, and cache every fresh answer.
    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache(&self) -> Option<&Arc<ResponseCache>> {
        self.cache.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Provider names in dispatch order.
    pub fn provider_names(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.name.clone()).collect()
    }

    /// (provider, model) pairs in dispatch order.
    pub fn provider_models(&self) -> Vec<(String, String)> {
        self.slots
            .iter()
            .map(|s| (s.name.clone(), s.model.clone()))
            .collect()
    }

    pub fn slots(&self) -> &[ProviderSlot] {
        &self.slots
    }

    pub async fn dispatch(&self, prompt: &str) -> Result<Dispatched, DispatchError> {
        if self.slots.is_empty() {
            return Err(DispatchError::NoProviderConfigured);
        }

        if let Some(cache) = &self.cache {
            let candidates: Vec<(&str, &str)> = self
                .slots
                .iter()
                .map(|s| (s.name.as_str(), s.model.as_str()))
                .collect();
            if let Some(hit) = cache.lookup(prompt, &candidates).await {
                tracing::debug!(provider = %hit.provider, "served from response cache");
                return Ok(Dispatched {
                    text: hit.text,
                    provider: hit.provider,
                    latency_ms: 0,
                    cached: true,
                });
            }
        }

        let mut failures = Vec::with_capacity(self.slots.len());

        for slot in self.slots.iter() {
            let start = Instant::now();
            let res = match tokio::time::timeout(
                self.call_timeout,
                slot.client.generate_text(prompt, &slot.model),
            )
            .await
            {
                Ok(inner) => inner,
                Err(_) => Err(ProviderError::Timeout(self.call_timeout)),
            };
            let latency_ms = start.elapsed().as_millis() as u64;

            match res {
                Ok(text) if !text.trim().is_empty() => {
                    tracing::debug!(provider = %slot.name, latency_ms, "provider succeeded");
                    if let Some(cache) = &self.cache {
                        cache.store(prompt, &slot.name, &slot.model, &text).await;
                    }
                    return Ok(Dispatched {
                        text,
                        provider: slot.name.clone(),
                        latency_ms,
                        cached: false,
                    });
                }
                Ok(_) => {
                    tracing::warn!(provider = %slot.name, latency_ms, "provider returned empty text");
                    failures.push(ProviderFailure {
                        provider: slot.name.clone(),
                        reason: ProviderError::EmptyResponse.to_string(),
                    });
                }
                Err(e) => {
                    tracing::warn!(provider = %slot.name, latency_ms, error = %e, "provider failed");
                    failures.push(ProviderFailure {
                        provider: slot.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(DispatchError::AllProvidersFailed(failures))
    }
}
