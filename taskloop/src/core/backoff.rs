//! Capped exponential backoff between retries.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter: bool,
}

impl BackoffPolicy {
    /// Delay before retry `k` (1-based): `min(base * 2^(k-1), max)`.
    pub fn delay_before_retry(&self, k: u32) -> Duration {
        if k == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(k - 1).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Delay with up to half of it added as jitter. `unit` is a sample in `[0, 1)`.
    pub fn jittered_delay(&self, k: u32, unit: f64) -> Duration {
        let delay = self.delay_before_retry(k);
        if !self.jitter {
            return delay;
        }
        let unit = unit.clamp(0.0, 1.0);
        let extra_nanos = (delay.as_nanos() as f64 * unit / 2.0) as u64;
        delay + Duration::from_nanos(extra_nanos)
    }
}
