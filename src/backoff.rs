/// file: src/backoff.rs
/// description: reconnect attempt counter and delay computation
use crate::config::ReconnectPolicy;
use std::time::Duration;

/// Reconnect state owned by the connection manager.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Consecutive failed attempts since the last successful handshake.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Records a failure and returns the delay before the next attempt, or
    /// `None` once the configured ceiling is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);

        if let Some(max) = self.policy.max_attempts
            && self.attempt > max
        {
            return None;
        }

        let base = self.base_delay();
        if !self.policy.jitter || base.is_zero() {
            return Some(base);
        }

        // Up to 25% extra, never past the cap
        let jitter_ms = fastrand::u64(0..=(base.as_millis() as u64 / 4));
        Some((base + Duration::from_millis(jitter_ms)).min(self.policy.max_delay))
    }

    fn base_delay(&self) -> Duration {
        let exponent = self.attempt.saturating_sub(1).min(32) as i32;
        let factor = self.policy.multiplier.max(1.0).powi(exponent);
        let millis = self.policy.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.policy.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: Option<u32>) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            multiplier: 2.0,
            jitter: false,
            max_attempts,
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let mut backoff = Backoff::new(policy(None));
        let delays: Vec<u64> = (0..6)
            .map(|_| backoff.next_delay().unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(backoff.attempt(), 6);
    }

    #[test]
    fn test_reset_starts_over() {
        let mut backoff = Backoff::new(policy(None));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_ceiling_gives_up() {
        let mut backoff = Backoff::new(policy(Some(2)));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn test_immediate_policy_never_waits() {
        let mut backoff = Backoff::new(ReconnectPolicy::immediate());
        for _ in 0..100 {
            assert_eq!(backoff.next_delay(), Some(Duration::ZERO));
        }
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut backoff = Backoff::new(ReconnectPolicy {
            jitter: true,
            ..policy(None)
        });
        for _ in 0..50 {
            backoff.reset();
            let delay = backoff.next_delay().unwrap();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }
}
