use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

/// When and how often a crashed service is relaunched.
///
/// The production policy is [`RestartPolicy::forever_fixed`]: a constant delay
/// and no retry cap. `backoff` and `max_restarts` exist for deployments that
/// want something else.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestartPolicy {
    pub delay: Duration,
    pub backoff: BackoffStrategy,
    pub max_delay: Duration,
    /// `None` restarts forever.
    pub max_restarts: Option<u32>,
}

pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

impl RestartPolicy {
    pub fn forever_fixed(delay: Duration) -> Self {
        Self {
            delay,
            backoff: BackoffStrategy::Fixed,
            max_delay: delay,
            max_restarts: None,
        }
    }

    /// Delay before restart number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let millis = calculate_backoff_delay(
            attempt,
            &self.backoff,
            self.delay.as_millis() as u64,
            self.max_delay.max(self.delay).as_millis() as u64,
        );
        Duration::from_millis(millis)
    }

    /// Whether another restart is allowed after `restarts` have already happened.
    pub fn allows_restart(&self, restarts: u32) -> bool {
        match self.max_restarts {
            Some(max) => restarts < max,
            None => true,
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::forever_fixed(DEFAULT_RESTART_DELAY)
    }
}

/// Calculate next restart delay based on backoff strategy
pub fn calculate_backoff_delay(
    attempt: u32,
    strategy: &BackoffStrategy,
    initial_delay: u64,
    max_delay: u64,
) -> u64 {
    let delay = match strategy {
        BackoffStrategy::Fixed => initial_delay,
        BackoffStrategy::Linear => initial_delay.saturating_mul(attempt as u64 + 1),
        BackoffStrategy::Exponential => {
            initial_delay.saturating_mul(2_u64.saturating_pow(attempt))
        },
    };

    delay.min(max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let delay = calculate_backoff_delay(0, &BackoffStrategy::Exponential, 60, 3600);
        assert_eq!(delay, 60);

        let delay = calculate_backoff_delay(1, &BackoffStrategy::Exponential, 60, 3600);
        assert_eq!(delay, 120);

        let delay = calculate_backoff_delay(2, &BackoffStrategy::Exponential, 60, 3600);
        assert_eq!(delay, 240);

        // Test max delay cap
        let delay = calculate_backoff_delay(10, &BackoffStrategy::Exponential, 60, 3600);
        assert_eq!(delay, 3600);

        // No overflow on very long crash loops
        let delay = calculate_backoff_delay(200, &BackoffStrategy::Exponential, 60, 3600);
        assert_eq!(delay, 3600);
    }

    #[test]
    fn test_linear_backoff() {
        let delay = calculate_backoff_delay(0, &BackoffStrategy::Linear, 60, 3600);
        assert_eq!(delay, 60);

        let delay = calculate_backoff_delay(2, &BackoffStrategy::Linear, 60, 3600);
        assert_eq!(delay, 180);
    }

    #[test]
    fn test_fixed_backoff() {
        let delay = calculate_backoff_delay(0, &BackoffStrategy::Fixed, 60, 3600);
        assert_eq!(delay, 60);

        let delay = calculate_backoff_delay(5, &BackoffStrategy::Fixed, 60, 3600);
        assert_eq!(delay, 60);
    }

    #[test]
    fn test_default_policy_restarts_forever_every_five_seconds() {
        let policy = RestartPolicy::default();
        for attempt in [0, 1, 10, 1000, u32::MAX] {
            assert_eq!(policy.delay_for(attempt), Duration::from_secs(5));
            assert!(policy.allows_restart(attempt));
        }
    }

    #[test]
    fn test_retry_cap() {
        let policy = RestartPolicy {
            max_restarts: Some(2),
            ..RestartPolicy::default()
        };
        assert!(policy.allows_restart(0));
        assert!(policy.allows_restart(1));
        assert!(!policy.allows_restart(2));
    }

    #[test]
    fn test_max_delay_below_delay_is_ignored() {
        let policy = RestartPolicy {
            delay: Duration::from_secs(5),
            backoff: BackoffStrategy::Exponential,
            max_delay: Duration::from_secs(1),
            max_restarts: None,
        };
        assert_eq!(policy.delay_for(3), Duration::from_secs(5));
    }
}
