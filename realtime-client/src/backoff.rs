// realtime-client/src/backoff.rs
use std::time::Duration;

use common::ChannelConfig;

/// Exponential reconnect schedule: `base * 2^(attempt-1)`, capped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ChannelConfig::default())
    }
}

impl From<&ChannelConfig> for ReconnectPolicy {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            max_attempts: config.max_attempts,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect `attempt` (1-based), or `None` once the
    /// attempt budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Some(
            self.base_delay
                .checked_mul(factor)
                .unwrap_or(self.max_delay)
                .min(self.max_delay),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_attempts: 8,
        }
    }

    #[test]
    fn test_delay_doubles_from_base() {
        let policy = policy();
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_secs(4)));
    }

    #[test]
    fn test_delays_are_monotonic_and_capped() {
        let policy = policy();
        let delays: Vec<Duration> = (1..=policy.max_attempts)
            .filter_map(|attempt| policy.delay_for(attempt))
            .collect();

        assert_eq!(delays.len(), 8);
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(delays.iter().all(|delay| *delay <= policy.max_delay));
        assert_eq!(delays[7], Duration::from_secs(10));
    }

    #[test]
    fn test_budget_is_enforced() {
        let policy = policy();
        assert_eq!(policy.delay_for(0), None);
        assert_eq!(policy.delay_for(9), None);
    }

    #[test]
    fn test_huge_attempt_counts_do_not_overflow() {
        let policy = ReconnectPolicy {
            max_attempts: u32::MAX,
            ..policy()
        };
        assert_eq!(policy.delay_for(200), Some(Duration::from_secs(10)));
    }
}
