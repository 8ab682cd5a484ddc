use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base: Duration,
    pub max: Duration,
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter_pct: 0.20,
        }
    }
}

/// `base * 2^(attempt-1)`, capped at `max`, then jittered by ±`jitter_pct`
/// and clamped to `[0, max]`.
pub fn next_delay(attempt: i32, cfg: &RetryConfig, rng: &mut impl Rng) -> Duration {
    let attempt = attempt.max(1) as u32;
    let exp = attempt.saturating_sub(1);

    let base_ms = u64::try_from(cfg.base.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(cfg.max.as_millis()).unwrap_or(u64::MAX);

    let pow2 = 1_u64.checked_shl(exp).unwrap_or(u64::MAX);
    let delay = base_ms.saturating_mul(pow2).min(max_ms);

    let jitter_range = (delay as f64) * cfg.jitter_pct.abs();
    let jitter = if jitter_range > 0.0 {
        rng.gen_range(-jitter_range..=jitter_range)
    } else {
        0.0
    };

    let jittered = (delay as f64 + jitter).round().max(0.0) as u64;
    Duration::from_millis(jittered.min(max_ms))
}
