//! Reconnect delay schedule.

use std::time::Duration;

/// Growth factor between consecutive reconnect delays.
pub const BACKOFF_FACTOR: f64 = 1.5;

/// Exponential reconnect schedule: `base_delay × 1.5^attempt`, giving up after
/// `max_attempts` consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub factor: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            factor: BACKOFF_FACTOR,
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (zero-based), or `None` once
    /// the attempts are used up.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        Some(self.base_delay.mul_f64(self.factor.powi(exponent)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_by_half_each_attempt() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(0), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay(1), Some(Duration::from_millis(1500)));
        assert_eq!(policy.delay(2), Some(Duration::from_millis(2250)));

        let delays: Vec<_> = (0..policy.max_attempts)
            .map(|a| policy.delay(a).unwrap())
            .collect();
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let policy = ReconnectPolicy {
            max_attempts: 3,
            ..ReconnectPolicy::default()
        };
        assert!(policy.delay(2).is_some());
        assert_eq!(policy.delay(3), None);
        assert_eq!(policy.delay(u32::MAX), None);
    }
}
