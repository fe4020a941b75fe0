use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Consecutive failed connection attempts before giving up.
    pub max_attempts: u32,
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_pct: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_ms: 1_000,
            max_ms: 5_000,
            jitter_pct: 0.5,
        }
    }
}

pub fn next_delay(attempt_no: u32, cfg: &ReconnectConfig, rng: &mut impl Rng) -> Duration {
    let attempt_no = attempt_no.max(1);

    // exponent = attempt_no - 1
    let exp = attempt_no.saturating_sub(1);

    // 2^exp; a huge exponent just saturates and the cap takes over
    let pow2 = 1_u64.checked_shl(exp).unwrap_or(u64::MAX);

    let delay = cfg.base_ms.saturating_mul(pow2).min(cfg.max_ms);

    // jitter in range [-jitter_pct, +jitter_pct]
    let jitter_range = (delay as f64) * cfg.jitter_pct;
    let jitter = if jitter_range > 0.0 {
        rng.gen_range(-jitter_range..=jitter_range)
    } else {
        0.0
    };

    let jittered = (delay as f64 + jitter).round().max(0.0) as u64;
    Duration::from_millis(jittered.min(cfg.max_ms))
}
