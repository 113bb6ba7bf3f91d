//! Delay between a failed attempt and the next one.
//!
//! The base delay for attempt `n` (1-based, the attempt that just failed) is
//! `base × factor^(n-1)` for exponential backoff or `base` for fixed backoff,
//! clamped to `max`. Jitter draws uniformly from `[base/2, base]` so retries of
//! many tasks failing together spread out without ever exceeding the cap.

use std::time::Duration;

use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};

use crate::cli::config::RetrySettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Exponential,
    Fixed,
}

/// Retry delay policy applied by the worker pool
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub strategy: BackoffStrategy,
    pub base: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: bool,
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            strategy: settings.strategy,
            base: Duration::from_millis(settings.base_delay_ms),
            max: Duration::from_millis(settings.max_delay_ms),
            factor: settings.factor,
            jitter: settings.jitter,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after `attempt` failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = match self.strategy {
            BackoffStrategy::Fixed => self.base.min(self.max),
            BackoffStrategy::Exponential => {
                let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let nanos = self.base.as_nanos() as f64 * self.factor.powi(exp);
                if !nanos.is_finite() || nanos < 0.0 || nanos > self.max.as_nanos() as f64 {
                    self.max
                } else {
                    Duration::from_nanos(nanos.round() as u64)
                }
            }
        };

        if self.jitter && !base.is_zero() {
            let low = base.as_secs_f64() / 2.0;
            Duration::from_secs_f64(thread_rng().gen_range(low..=base.as_secs_f64()))
        } else {
            base
        }
    }

    /// Delay honoring a minimum imposed by the failure (e.g. an open circuit).
    pub fn delay_with_floor(&self, attempt: u32, floor: Option<Duration>) -> Duration {
        let delay = self.delay_for(attempt);
        match floor {
            Some(floor) => delay.max(floor),
            None => delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: BackoffStrategy, jitter: bool) -> RetryPolicy {
        RetryPolicy {
            strategy,
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            factor: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_exponential_growth_is_capped() {
        let p = policy(BackoffStrategy::Exponential, false);
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(4), Duration::from_millis(800));
        assert_eq!(p.delay_for(5), Duration::from_secs(1));
        assert_eq!(p.delay_for(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_fixed_delay_is_constant() {
        let p = policy(BackoffStrategy::Fixed, false);
        for attempt in 1..10 {
            assert_eq!(p.delay_for(attempt), Duration::from_millis(100));
        }
    }

    #[test]
    fn test_jitter_stays_within_half_and_full_base() {
        let p = policy(BackoffStrategy::Exponential, true);
        for _ in 0..100 {
            let d = p.delay_for(3);
            assert!(d >= Duration::from_millis(199) && d <= Duration::from_millis(401), "{:?}", d);
        }
    }

    #[test]
    fn test_floor_wins_when_larger() {
        let p = policy(BackoffStrategy::Fixed, false);
        assert_eq!(
            p.delay_with_floor(1, Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(p.delay_with_floor(1, None), Duration::from_millis(100));
    }
}
