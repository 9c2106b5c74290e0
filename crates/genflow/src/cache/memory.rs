use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{CacheEntryInfo, CacheStore, CachedResponse};

struct Slot {
    entry: CachedResponse,
    /// `None` when the TTL is too large to represent; such entries only
    /// leave through `clear`.
    expires_at: Option<Instant>,
}

impl Slot {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |t| t > now)
    }
}

/// In-process `CacheStore` for `GENFLOW_STORE=memory` and tests.
#[derive(Default)]
pub struct MemoryCache {
    slots: Mutex<HashMap<String, Slot>>,
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<CachedResponse>> {
        let now = Instant::now();
        let slots = self.slots.lock();
        Ok(slots
            .get(key)
            .filter(|s| s.live(now))
            .map(|s| s.entry.clone()))
    }

    async fn put(&self, key: &str, entry: &CachedResponse, ttl: Duration) -> anyhow::Result<()> {
        let slot = Slot {
            entry: entry.clone(),
            expires_at: Instant::now().checked_add(ttl),
        };
        self.slots.lock().insert(key.to_string(), slot);
        Ok(())
    }

    async fn info(&self, key: &str) -> anyhow::Result<CacheEntryInfo> {
        let now = Instant::now();
        let slots = self.slots.lock();
        let info = match slots.get(key).filter(|s| s.live(now)) {
            Some(s) => CacheEntryInfo {
                cache_key: key.to_string(),
                exists: true,
                ttl_secs: s
                    .expires_at
                    .map(|t| t.saturating_duration_since(now).as_secs() as i64),
                size: s.entry.text.len() as i64,
            },
            None => CacheEntryInfo::absent(key.to_string()),
        };
        Ok(info)
    }

    async fn len(&self) -> anyhow::Result<i64> {
        let now = Instant::now();
        Ok(self.slots.lock().values().filter(|s| s.live(now)).count() as i64)
    }

    async fn clear(&self) -> anyhow::Result<u64> {
        let mut slots = self.slots.lock();
        let n = slots.len() as u64;
        slots.clear();
        Ok(n)
    }

    async fn purge_expired(&self) -> anyhow::Result<u64> {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, s| s.live(now));
        Ok((before - slots.len()) as u64)
    }
}
