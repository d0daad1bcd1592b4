//! Exponential reconnection schedule.
//!
//! `delay = base_ms * 2^attempt`, capped at `max_delay_ms`. With the default
//! policy the schedule is 1s, 2s, 4s, 8s, 16s and then nothing: the fifth
//! failed cycle exhausts `max_attempts`.

use std::time::Duration;

use beacon_common::config::ReconnectPolicy;

/// Stateful backoff counter driven by connection outcomes.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay for a given attempt number, independent of internal state.
    pub fn delay_for(policy: &ReconnectPolicy, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let millis = policy
            .base_ms
            .saturating_mul(factor)
            .min(policy.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// Consume one attempt and return the delay before it, or `None` once the
    /// policy is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let delay = Self::delay_for(&self.policy, self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// Called on a successful open.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.policy.max_attempts
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}
