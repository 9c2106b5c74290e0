use std::time::Duration;

use rand::{rngs::StdRng, SeedableRng};
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::jobs::retry::{next_delay, RetryConfig};

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

pub async fn make_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let max_connections = env_parsed("GENFLOW_DB_MAX_CONNECTIONS", 8u32).clamp(1, 64);
    let acquire_timeout_secs = env_parsed("GENFLOW_DB_ACQUIRE_TIMEOUT_SECS", 10u64).clamp(1, 60);

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(acquire_timeout_secs))
        .connect(database_url)
        .await?;

    Ok(pool)
}

/// `make_pool`, retried with jittered backoff while the database comes up.
pub async fn connect_with_retry(database_url: &str, attempts: u32) -> anyhow::Result<PgPool> {
    let cfg = RetryConfig {
        base_ms: 500,
        max_ms: 5_000,
        jitter_pct: 0.20,
    };
    let mut rng = StdRng::from_entropy();
    let attempts = attempts.max(1);

    let mut attempt = 1;
    loop {
        match make_pool(database_url).await {
            Ok(pool) => return Ok(pool),
            Err(e) if attempt < attempts => {
                let delay = next_delay(attempt, &cfg, &mut rng);
                tracing::warn!(
                    attempt,
                    attempts,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "database connect failed"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(e.context(format!("database unreachable after {attempts} attempts")))
            }
        }
    }
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
