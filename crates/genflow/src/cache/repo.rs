use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{CacheEntryInfo, CacheStore, CachedResponse};
use crate::jobs::model::millis;

/// Postgres-backed `CacheStore` over the `response_cache` table.
#[derive(Clone)]
pub struct CacheRepo {
    pool: PgPool,
}

impl CacheRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheStore for CacheRepo {
    async fn get(&self, key: &str) -> anyhow::Result<Option<CachedResponse>> {
        let row = sqlx::query_as::<_, (String, String, String, DateTime<Utc>)>(
            r#"
            SELECT response, provider, model, created_at
            FROM response_cache
            WHERE cache_key = $1
              AND expires_at > now()
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(text, provider, model, cached_at)| CachedResponse {
            text,
            provider,
            model,
            cached_at,
        }))
    }

    async fn put(&self, key: &str, entry: &CachedResponse, ttl: Duration) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO response_cache (cache_key, provider, model, response, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, now() + ($6::bigint * interval '1 millisecond'))
            ON CONFLICT (cache_key) DO UPDATE
            SET provider = EXCLUDED.provider,
                model = EXCLUDED.model,
                response = EXCLUDED.response,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(&entry.provider)
        .bind(&entry.model)
        .bind(&entry.text)
        .bind(entry.cached_at)
        .bind(millis(ttl))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn info(&self, key: &str) -> anyhow::Result<CacheEntryInfo> {
        let row = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT octet_length(response)::bigint,
                   GREATEST(0, floor(EXTRACT(EPOCH FROM (expires_at - now()))))::bigint
            FROM response_cache
            WHERE cache_key = $1
              AND expires_at > now()
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((size, ttl_secs)) => CacheEntryInfo {
                cache_key: key.to_string(),
                exists: true,
                ttl_secs: Some(ttl_secs),
                size,
            },
            None => CacheEntryInfo::absent(key.to_string()),
        })
    }

    async fn len(&self) -> anyhow::Result<i64> {
        let n: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM response_cache
            WHERE expires_at > now()
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(n)
    }

    async fn clear(&self) -> anyhow::Result<u64> {
        let res = sqlx::query("DELETE FROM response_cache")
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn purge_expired(&self) -> anyhow::Result<u64> {
        let res = sqlx::query("DELETE FROM response_cache WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}
