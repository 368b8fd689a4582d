//! Retry backoff: exponential with jitter, clamped to a maximum.

use std::time::Duration;

use rand::Rng;
use vp_domain::config::PipelineConfig;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub max: Duration,
}

impl From<&PipelineConfig> for BackoffPolicy {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            base: config.backoff_base,
            multiplier: config.backoff_multiplier,
            jitter: config.backoff_jitter,
            max: config.backoff_max,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry `n` (1-based):
    /// `base * multiplier^(n-1) * (1 + uniform(-jitter, +jitter))`, clamped
    /// to `max`.
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32);
        let unjittered = self.base.as_secs_f64() * self.multiplier.powi(exponent as i32);
        let factor = if self.jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            1.0
        };
        let seconds = (unjittered * factor).clamp(0.0, self.max.as_secs_f64());
        Duration::from_secs_f64(seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            jitter,
            max: Duration::from_secs(300),
        }
    }

    #[test]
    fn grows_exponentially_without_jitter() {
        let p = policy(0.0);
        assert_eq!(p.delay(1), Duration::from_secs(1));
        assert_eq!(p.delay(2), Duration::from_secs(2));
        assert_eq!(p.delay(3), Duration::from_secs(4));
        assert_eq!(p.delay(4), Duration::from_secs(8));
    }

    #[test]
    fn clamps_to_max() {
        let p = policy(0.0);
        assert_eq!(p.delay(30), Duration::from_secs(300));
    }

    #[test]
    fn jitter_stays_within_band() {
        let p = policy(0.2);
        for _ in 0..100 {
            let d = p.delay(3).as_secs_f64();
            // 4s ± 20%.
            assert!((3.2..=4.8).contains(&d), "delay {d} outside jitter band");
        }
    }

    #[test]
    fn zero_retry_is_treated_as_first() {
        let p = policy(0.0);
        assert_eq!(p.delay(0), Duration::from_secs(1));
    }
}
