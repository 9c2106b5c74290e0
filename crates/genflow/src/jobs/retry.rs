use std::time::Duration;

use rand::Rng;

/// Capped exponential backoff with symmetric jitter.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: 200,
            max_ms: 10_000,
            jitter_pct: 0.20,
        }
    }
}

/// Delay before retry number `attempt` (1-based).
pub fn next_delay(attempt: u32, cfg: &RetryConfig, rng: &mut impl Rng) -> Duration {
    let exp = attempt.max(1) - 1;
    let pow2 = 1_u64.checked_shl(exp).unwrap_or(u64::MAX);
    let delay = cfg.base_ms.saturating_mul(pow2).min(cfg.max_ms);

    let jitter_range = delay as f64 * cfg.jitter_pct;
    let jitter = if jitter_range > 0.0 {
        rng.gen_range(-jitter_range..=jitter_range)
    } else {
        0.0
    };

    let jittered = (delay as f64 + jitter).round().max(0.0) as u64;
    Duration::from_millis(jittered.min(cfg.max_ms))
}
