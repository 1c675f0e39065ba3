//! Exponential reconnect backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// Parameters for [`Backoff`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// First delay after a failure.
    pub initial: Duration,
    /// Upper bound for the un-jittered delay.
    pub max: Duration,
    /// Growth factor per consecutive failure.
    pub multiplier: u32,
    /// Random spread applied to each delay, as a fraction (0.2 = ±20%).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2,
            jitter: 0.2,
        }
    }
}

/// Stateful delay generator. Reset after every successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            current: policy.initial,
            policy,
        }
    }

    /// Delay to wait before the next attempt. Advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = base
            .saturating_mul(self.policy.multiplier.max(1))
            .min(self.policy.max);

        if self.policy.jitter <= 0.0 {
            return base;
        }
        let spread = self.policy.jitter.min(1.0);
        let factor = 1.0 + rand::thread_rng().gen_range(-spread..=spread);
        base.mul_f64(factor)
    }

    /// Start over from the initial delay.
    pub fn reset(&mut self) {
        self.current = self.policy.initial;
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}
