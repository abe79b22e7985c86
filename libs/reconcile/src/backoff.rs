//! Exponential backoff.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// A policy without jitter, for deterministic schedules.
    pub fn fixed_exponential(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(30) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exp);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows() {
        let policy = BackoffPolicy::default();

        assert!(policy.delay(0) <= Duration::from_millis(125));
        assert!(policy.delay(1) <= Duration::from_millis(250));
        assert!(policy.delay(2) <= Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_capped() {
        let policy = BackoffPolicy::fixed_exponential(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(policy.delay(10), Duration::from_secs(5));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_no_jitter_is_exact() {
        let policy =
            BackoffPolicy::fixed_exponential(Duration::from_millis(10), Duration::from_secs(1));
        assert_eq!(policy.delay(0), Duration::from_millis(10));
        assert_eq!(policy.delay(3), Duration::from_millis(80));
    }
}
