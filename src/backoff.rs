//! Exponential backoff with jitter for Order Manager retries (spec §4.4:
//! "base 250 ms, cap 4 s, jitter ±25 %").

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter_fraction: f64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            cap: Duration::from_secs(4),
            jitter_fraction: 0.25,
            max_attempts: 3,
        }
    }
}

impl BackoffPolicy {
    /// Delay before attempt number `attempt` (1-indexed retry count, i.e.
    /// the wait before the *second* try is `delay_for(1)`).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base.as_millis() as f64 * 2f64.powi(attempt as i32 - 1);
        let capped = exp.min(self.cap.as_millis() as f64);
        let jitter = rand::thread_rng().gen_range(-self.jitter_fraction..=self.jitter_fraction);
        let jittered = (capped * (1.0 + jitter)).max(0.0);
        Duration::from_millis(jittered as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_then_caps() {
        let policy = BackoffPolicy::default();
        let d1 = policy.delay_for(1).as_millis() as f64;
        let d4 = policy.delay_for(4).as_millis() as f64;
        assert!(d1 <= 250.0 * 1.25 + 1.0);
        assert!(d4 <= 4000.0 * 1.25 + 1.0);
    }
}
