use std::time::Duration;

use crate::credentials::{ApiKey, CredentialSource, ExplicitCredentials, ProviderKind, Resolver};
use crate::providers::ProviderOrder;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    Memory,
}

// Config is the one place runtime settings come from.
// Everything is read from the environment (plus .env) and parsed once.
#[derive(Clone, Debug)]
pub struct Config {
    pub store: StoreKind,
    pub database_url: Option<String>,
    pub worker_id: String,
    pub workers: usize,
    pub lease_seconds: i64,
    pub dequeue_wait_ms: u64,
    pub api_addr: Option<String>,
    pub migrate_on_startup: bool,

    pub primary_provider: String,
    /// Explicit key and model for the primary provider. They win over the
    /// provider's env vars and key files.
    pub api_key: Option<ApiKey>,
    pub model: Option<String>,
    pub provider_order: String,
    pub provider_timeout_secs: u64,
    pub max_new_tokens: u32,

    pub result_ttl_secs: u64,
    pub retrieved_ttl_secs: u64,
    pub wait_timeout_secs: u64,
    pub max_prompt_chars: usize,

    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,

    pub maintenance_interval_secs: u64,
    pub orphan_after_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreKind::Postgres,
            database_url: None,
            worker_id: "worker-1".to_string(),
            workers: 2,
            lease_seconds: 180,
            dequeue_wait_ms: 2_000,
            api_addr: Some("0.0.0.0:8000".to_string()),
            migrate_on_startup: false,

            primary_provider: ProviderKind::OpenRouter.name().to_string(),
            api_key: None,
            model: None,
            provider_order: "primary-first".to_string(),
            provider_timeout_secs: 60,
            max_new_tokens: 150,

            result_ttl_secs: 3_600,
            retrieved_ttl_secs: 300,
            wait_timeout_secs: 600,
            max_prompt_chars: 10_000,

            cache_enabled: true,
            cache_ttl_secs: 3_600,

            maintenance_interval_secs: 60,
            orphan_after_secs: 30,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let store = match env_or_fallback("GENFLOW_STORE", "STORE")
            .map(|s| s.to_lowercase())
            .as_deref()
        {
            None | Some("postgres") | Some("pg") => StoreKind::Postgres,
            Some("memory") | Some("mem") => StoreKind::Memory,
            Some(other) => anyhow::bail!("unknown GENFLOW_STORE={other} (expected postgres|memory)"),
        };

        // Checked lazily by `database_url()`; commands without a store run fine
        // when it is unset.
        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let worker_id = env_or_fallback("GENFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker-1".to_string());

        let d = Self::default();
        Ok(Self {
            store,
            database_url,
            worker_id,
            workers: parsed("GENFLOW_WORKERS", "WORKERS", d.workers),
            lease_seconds: parsed("GENFLOW_LEASE_SECONDS", "LEASE_SECONDS", d.lease_seconds),
            dequeue_wait_ms: parsed("GENFLOW_DEQUEUE_WAIT_MS", "DEQUEUE_WAIT_MS", d.dequeue_wait_ms),
            api_addr: match env_or_fallback("GENFLOW_API_ADDR", "API_ADDR") {
                Some(v) => normalize_optional_addr(&v),
                None => d.api_addr,
            },
            migrate_on_startup: env_bool("GENFLOW_MIGRATE_ON_STARTUP").unwrap_or(false),

            primary_provider: env_or_fallback("GENFLOW_PROVIDER", "PROVIDER")
                .map(|s| s.trim().to_lowercase())
                .unwrap_or(d.primary_provider),
            api_key: env_or_fallback("GENFLOW_API_KEY", "API_KEY").map(ApiKey::new),
            model: env_or_fallback("GENFLOW_MODEL", "MODEL_NAME").map(|s| s.trim().to_string()),
            provider_order: env_or_fallback("GENFLOW_PROVIDER_ORDER", "PROVIDER_ORDER")
                .map(|s| s.trim().to_lowercase())
                .unwrap_or(d.provider_order),
            provider_timeout_secs: parsed(
                "GENFLOW_PROVIDER_TIMEOUT_SECS",
                "PROVIDER_TIMEOUT_SECS",
                d.provider_timeout_secs,
            ),
            max_new_tokens: parsed("GENFLOW_MAX_NEW_TOKENS", "MAX_NEW_TOKENS", d.max_new_tokens),

            result_ttl_secs: parsed("GENFLOW_RESULT_TTL_SECS", "RESULT_TTL_SECS", d.result_ttl_secs),
            retrieved_ttl_secs: parsed(
                "GENFLOW_RETRIEVED_TTL_SECS",
                "RETRIEVED_TTL_SECS",
                d.retrieved_ttl_secs,
            ),
            wait_timeout_secs: parsed(
                "GENFLOW_WAIT_TIMEOUT_SECS",
                "WAIT_TIMEOUT_SECS",
                d.wait_timeout_secs,
            ),
            max_prompt_chars: parsed(
                "GENFLOW_MAX_PROMPT_CHARS",
                "MAX_PROMPT_CHARS",
                d.max_prompt_chars,
            ),

            cache_enabled: env_bool("GENFLOW_CACHE_ENABLED").unwrap_or(d.cache_enabled),
            cache_ttl_secs: parsed("GENFLOW_CACHE_TTL_SECS", "CACHE_TTL_SECS", d.cache_ttl_secs),

            maintenance_interval_secs: parsed(
                "GENFLOW_MAINTENANCE_INTERVAL_SECS",
                "MAINTENANCE_INTERVAL_SECS",
                d.maintenance_interval_secs,
            ),
            orphan_after_secs: parsed(
                "GENFLOW_ORPHAN_AFTER_SECS",
                "ORPHAN_AFTER_SECS",
                d.orphan_after_secs,
            ),
        })
    }

    /// Human-readable configuration problems. Empty means the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.workers == 0 {
            issues.push("GENFLOW_WORKERS must be at least 1".to_string());
        }
        if self.max_new_tokens == 0 {
            issues.push("MAX_NEW_TOKENS must be a positive integer".to_string());
        }
        if self.provider_timeout_secs == 0 {
            issues.push("GENFLOW_PROVIDER_TIMEOUT_SECS must be at least 1".to_string());
        }
        if self.max_prompt_chars == 0 {
            issues.push("GENFLOW_MAX_PROMPT_CHARS must be at least 1".to_string());
        }
        if ProviderKind::parse(&self.primary_provider).is_none() {
            let known: Vec<&str> = ProviderKind::ALL.iter().map(|k| k.name()).collect();
            issues.push(format!(
                "PROVIDER must be one of [{}], got {:?}",
                known.join(", "),
                self.primary_provider
            ));
        }
        if ProviderOrder::parse(&self.provider_order).is_none() {
            issues.push(format!(
                "GENFLOW_PROVIDER_ORDER must be primary-first or reversed, got {:?}",
                self.provider_order
            ));
        }

        // A lease shorter than the worst-case dispatch lets a second worker
        // reclaim a job that is still being generated.
        let dispatch_budget = self.provider_timeout_secs as i64 * ProviderKind::ALL.len() as i64;
        if self.lease_seconds <= dispatch_budget {
            issues.push(format!(
                "GENFLOW_LEASE_SECONDS ({}) must exceed the worst-case dispatch time ({}s = {} providers x {}s)",
                self.lease_seconds,
                dispatch_budget,
                ProviderKind::ALL.len(),
                self.provider_timeout_secs
            ));
        }

        issues
    }

    pub fn database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is missing (or set GENFLOW_STORE=memory)"))
    }

    /// Unknown names fall back to the default provider; `validate` reports them.
    pub fn primary(&self) -> ProviderKind {
        ProviderKind::parse(&self.primary_provider).unwrap_or(ProviderKind::OpenRouter)
    }

    /// Layers the explicit key and model onto `resolver` for the primary
    /// provider.
    pub fn apply_explicit<S: CredentialSource>(&self, resolver: Resolver<S>) -> Resolver<S> {
        if self.api_key.is_none() && self.model.is_none() {
            return resolver;
        }
        resolver.with_explicit(
            self.primary(),
            ExplicitCredentials {
                api_key: self.api_key.clone(),
                model: self.model.clone(),
            },
        )
    }

    pub fn resolver(&self) -> Resolver {
        self.apply_explicit(Resolver::system())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn order(&self) -> ProviderOrder {
        ProviderOrder::parse(&self.provider_order).unwrap_or_default()
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds.max(1) as u64)
    }

    pub fn dequeue_wait(&self) -> Duration {
        Duration::from_millis(self.dequeue_wait_ms.max(1))
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }

    pub fn orphan_after(&self) -> Duration {
        Duration::from_secs(self.orphan_after_secs)
    }

    pub fn retention(&self) -> crate::jobs::Retention {
        crate::jobs::Retention {
            result_ttl: Duration::from_secs(self.result_ttl_secs),
            retrieved_ttl: Duration::from_secs(self.retrieved_ttl_secs),
        }
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn parsed<T: std::str::FromStr>(primary: &str, fallback: &str, default: T) -> T {
    env_or_fallback(primary, fallback)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
