//! TTL cache of generated text, keyed by prompt, provider and model.
//!
//! The dispatcher consults it before calling any provider. Store errors are
//! logged and count as a miss; the cache never fails a dispatch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::PgPool;

pub mod memory;
pub mod repo;

pub use memory::MemoryCache;
pub use repo::CacheRepo;

const KEY_PREFIX: &str = "llm_cache";
const KEY_HASH_CHARS: usize = 16;
const MAX_KEY_LEN: usize = 250;

/// `llm_cache:{provider}:{model}:{hash}` where `hash` is the first 16 hex
/// characters of the prompt's SHA-256.
pub fn cache_key(prompt: &str, provider: &str, model: &str) -> String {
    let digest = hex::encode(Sha256::digest(prompt.as_bytes()));
    let mut key = format!(
        "{KEY_PREFIX}:{provider}:{model}:{}",
        &digest[..KEY_HASH_CHARS]
    );
    if key.len() > MAX_KEY_LEN {
        let mut end = MAX_KEY_LEN;
        while !key.is_char_boundary(end) {
            end -= 1;
        }
        key.truncate(end);
    }
    key
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedResponse {
    pub text: String,
    pub provider: String,
    pub model: String,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntryInfo {
    pub cache_key: String,
    pub exists: bool,
    /// Whole seconds until the entry expires.
    pub ttl_secs: Option<i64>,
    /// Bytes of cached text.
    pub size: i64,
}

impl CacheEntryInfo {
    pub fn absent(cache_key: String) -> Self {
        Self {
            cache_key,
            exists: false,
            ttl_secs: None,
            size: 0,
        }
    }
}

/// Storage behind [`ResponseCache`]. Expired entries are never returned,
/// whether or not they have been purged yet.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<CachedResponse>>;

    /// Insert or replace the entry under `key`.
    async fn put(&self, key: &str, entry: &CachedResponse, ttl: Duration) -> anyhow::Result<()>;

    async fn info(&self, key: &str) -> anyhow::Result<CacheEntryInfo>;

    /// Unexpired entries.
    async fn len(&self) -> anyhow::Result<i64>;

    /// Remove every entry. Returns the number removed.
    async fn clear(&self) -> anyhow::Result<u64>;

    /// Remove expired entries. Returns the number removed.
    async fn purge_expired(&self) -> anyhow::Result<u64>;
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,
    pub hit_rate: f64,
    pub entries: i64,
    pub ttl_secs: u64,
}

impl CacheStats {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            hits: 0,
            misses: 0,
            total_requests: 0,
            hit_rate: 0.0,
            entries: 0,
            ttl_secs: 0,
        }
    }
}

/// Response cache with in-process hit/miss counters.
pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn postgres(pool: PgPool, ttl: Duration) -> Self {
        Self::new(Arc::new(CacheRepo::new(pool)), ttl)
    }

    pub fn memory(ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryCache::default()), ttl)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// First cached answer among `candidates` (provider, model), tried in
    /// order. Each call counts as exactly one hit or one miss.
    pub async fn lookup(&self, prompt: &str, candidates: &[(&str, &str)]) -> Option<CachedResponse> {
        for (provider, model) in candidates {
            let key = cache_key(prompt, provider, model);
            match self.store.get(&key).await {
                Ok(Some(hit)) if !hit.text.trim().is_empty() => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(%key, "cache hit");
                    return Some(hit);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(%key, error = %e, "cache lookup failed"),
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Blank text is never cached.
    pub async fn store(&self, prompt: &str, provider: &str, model: &str, text: &str) {
        if text.trim().is_empty() || self.ttl.is_zero() {
            return;
        }

        let key = cache_key(prompt, provider, model);
        let entry = CachedResponse {
            text: text.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            cached_at: Utc::now(),
        };
        match self.store.put(&key, &entry, self.ttl).await {
            Ok(()) => tracing::debug!(%key, ttl_secs = self.ttl.as_secs(), "response cached"),
            Err(e) => tracing::warn!(%key, error = %e, "cache write failed"),
        }
    }

    pub async fn info(
        &self,
        prompt: &str,
        provider: &str,
        model: &str,
    ) -> anyhow::Result<CacheEntryInfo> {
        self.store.info(&cache_key(prompt, provider, model)).await
    }

    pub async fn clear(&self) -> anyhow::Result<u64> {
        let n = self.store.clear().await?;
        tracing::info!(cleared = n, "response cache cleared");
        Ok(n)
    }

    pub async fn purge_expired(&self) -> anyhow::Result<u64> {
        self.store.purge_expired().await
    }

    pub async fn stats(&self) -> anyhow::Result<CacheStats> {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        Ok(CacheStats {
            enabled: true,
            hits,
            misses,
            total_requests: total,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            entries: self.store.len().await?,
            ttl_secs: self.ttl.as_secs(),
        })
    }
}
