//! Redelivery policy and backoff computation.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::engine::config::{millis, DEFAULT_REDELIVERY_DELAY_MS};

/// Delay schedule between redelivery attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every redelivery.
    Fixed {
        #[serde(with = "millis")]
        delay: Duration,
    },
    /// `initial * multiplier^(n-1)` before redelivery `n`, capped at `max`.
    Exponential {
        #[serde(with = "millis")]
        initial: Duration,
        multiplier: f64,
        #[serde(with = "millis")]
        max: Duration,
    },
}

impl Backoff {
    #[must_use]
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    #[must_use]
    pub fn exponential(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self::Exponential {
            initial,
            multiplier,
            max,
        }
    }

    /// Undithered delay before redelivery number `redelivery` (1-based).
    #[must_use]
    pub fn delay(&self, redelivery: u32) -> Duration {
        match *self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let exponent = i32::try_from(redelivery.saturating_sub(1)).unwrap_or(i32::MAX);
                let factor = multiplier.max(1.0).powi(exponent);
                scale(initial, factor).min(max)
            }
        }
    }

    fn ceiling(&self) -> Option<Duration> {
        match *self {
            Self::Fixed { .. } => None,
            Self::Exponential { max, .. } => Some(max),
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Fixed {
            delay: Duration::from_millis(DEFAULT_REDELIVERY_DELAY_MS),
        }
    }
}

fn scale(base: Duration, factor: f64) -> Duration {
    let secs = base.as_secs_f64() * factor;
    if secs.is_finite() && secs >= 0.0 {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    } else {
        Duration::MAX
    }
}

/// Retry configuration attached to an error handler.
///
/// `maximum_redeliveries` counts retries, not invocations: `3` allows up to
/// four invocations of the protected scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedeliveryPolicy {
    pub maximum_redeliveries: u32,
    pub backoff: Backoff,
    /// Jitter factor in `[0, 1]`; each delay becomes `delay * (1 ± factor)`.
    pub collision_avoidance: Option<f64>,
    /// Log a warning when an exchange exhausts its redeliveries.
    pub log_exhausted: bool,
    /// Log each redelivery attempt at debug level.
    pub log_retry_attempted: bool,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            maximum_redeliveries: 0,
            backoff: Backoff::default(),
            collision_avoidance: None,
            log_exhausted: true,
            log_retry_attempted: true,
        }
    }
}

impl RedeliveryPolicy {
    #[must_use]
    pub fn with_maximum_redeliveries(mut self, maximum: u32) -> Self {
        self.maximum_redeliveries = maximum;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_collision_avoidance(mut self, factor: f64) -> Self {
        self.collision_avoidance = Some(factor.clamp(0.0, 1.0));
        self
    }

    /// Delay before redelivery number `redelivery` (1-based), with jitter
    /// applied when collision avoidance is on.
    #[must_use]
    pub fn delay_for(&self, redelivery: u32) -> Duration {
        let base = self.backoff.delay(redelivery);
        let Some(factor) = self.collision_avoidance.filter(|f| *f > 0.0) else {
            return base;
        };
        let factor = factor.min(1.0);
        let jitter = rand::rng().random_range((1.0 - factor)..=(1.0 + factor));
        let jittered = scale(base, jitter);
        match self.backoff.ceiling() {
            Some(max) => jittered.min(max),
            None => jittered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_is_constant() {
        let backoff = Backoff::fixed(Duration::from_millis(250));
        assert_eq!(backoff.delay(1), Duration::from_millis(250));
        assert_eq!(backoff.delay(9), Duration::from_millis(250));
    }

    #[test]
    fn exponential_backoff_grows_and_caps() {
        let backoff = Backoff::exponential(Duration::from_millis(100), 2.0, Duration::from_millis(1_000));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_millis(1_000));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_factor_and_ceiling() {
        let policy = RedeliveryPolicy::default()
            .with_backoff(Backoff::exponential(
                Duration::from_millis(400),
                2.0,
                Duration::from_millis(1_000),
            ))
            .with_collision_avoidance(0.25);
        for _ in 0..200 {
            let first = policy.delay_for(1);
            assert!(first >= Duration::from_millis(300) && first <= Duration::from_millis(500));
            assert!(policy.delay_for(3) <= Duration::from_millis(1_000));
        }
    }

    #[test]
    fn deserializes_from_json_with_defaults() {
        let policy: RedeliveryPolicy = serde_json::from_str(
            r#"{
                "maximum_redeliveries": 5,
                "backoff": { "type": "exponential", "initial": 50, "multiplier": 1.5, "max": 2000 }
            }"#,
        )
        .unwrap();
        assert_eq!(policy.maximum_redeliveries, 5);
        assert_eq!(
            policy.backoff,
            Backoff::exponential(Duration::from_millis(50), 1.5, Duration::from_secs(2))
        );
        assert!(policy.log_exhausted);
        assert_eq!(policy.collision_avoidance, None);
    }
}
