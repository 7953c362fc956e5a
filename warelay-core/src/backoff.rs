// ABOUTME: Exponential backoff and restart cap for transport reconnects
// ABOUTME: 1s, 2s, 4s... up to 60s between restarts, giving up after max_restarts in a row

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnect policy, configured under `[reconnect]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first restart
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Ceiling for the delay between restarts
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each restart
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    /// Consecutive restarts allowed without reaching `open` (0 = unlimited)
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_multiplier() -> u32 {
    2
}

fn default_max_restarts() -> u32 {
    10
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_restarts: default_max_restarts(),
        }
    }
}

impl BackoffConfig {
    /// No delay and no cap, for tests that drive many restarts
    pub fn immediate() -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1,
            max_restarts: 0,
        }
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Tracks consecutive restarts and the next delay
#[derive(Debug)]
pub struct BackoffState {
    config: BackoffConfig,
    consecutive_restarts: u32,
    current_delay: Duration,
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        let current_delay = config.initial_delay();
        Self {
            config,
            consecutive_restarts: 0,
            current_delay,
        }
    }

    /// A connection reached `open`; the next drop starts from the initial delay
    pub fn record_success(&mut self) {
        self.consecutive_restarts = 0;
        self.current_delay = self.config.initial_delay();
    }

    /// Record a drop and return how long to wait before restarting,
    /// or None once the restart cap is exceeded
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.consecutive_restarts += 1;

        if self.config.max_restarts > 0 && self.consecutive_restarts > self.config.max_restarts {
            return None;
        }

        let delay = self.current_delay;
        let max_delay = self.config.max_delay();
        self.current_delay = self
            .current_delay
            .checked_mul(self.config.multiplier.max(1))
            .map_or(max_delay, |next| next.min(max_delay));

        Some(delay)
    }

    pub fn consecutive_restarts(&self) -> u32 {
        self.consecutive_restarts
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backoff_config() {
        let config = BackoffConfig::default();
        assert_eq!(config.initial_delay(), Duration::from_secs(1));
        assert_eq!(config.max_delay(), Duration::from_secs(60));
        assert_eq!(config.multiplier, 2);
        assert_eq!(config.max_restarts, 10);
    }

    #[test]
    fn test_exponential_sequence_caps_at_max() {
        let mut state = BackoffState::new(BackoffConfig {
            max_restarts: 0,
            ..BackoffConfig::default()
        });

        let delays: Vec<u64> = (0..8)
            .map(|_| state.record_failure().unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(state.consecutive_restarts(), 8);
    }

    #[test]
    fn test_success_resets_backoff() {
        let mut state = BackoffState::new(BackoffConfig::default());
        state.record_failure();
        state.record_failure();
        state.record_failure();

        state.record_success();
        assert_eq!(state.consecutive_restarts(), 0);
        assert_eq!(state.current_delay(), Duration::from_secs(1));
        assert_eq!(state.record_failure(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_restart_cap() {
        let mut state = BackoffState::new(BackoffConfig {
            max_restarts: 3,
            ..BackoffConfig::default()
        });

        assert!(state.record_failure().is_some());
        assert!(state.record_failure().is_some());
        assert!(state.record_failure().is_some());
        assert_eq!(state.record_failure(), None);
    }

    #[test]
    fn test_huge_multiplier_saturates_at_max_delay() {
        let mut state = BackoffState::new(BackoffConfig {
            initial_delay_ms: u64::MAX / 2,
            max_delay_ms: u64::MAX,
            multiplier: u32::MAX,
            max_restarts: 0,
        });

        assert_eq!(state.record_failure(), Some(Duration::from_millis(u64::MAX / 2)));
        assert_eq!(state.record_failure(), Some(Duration::from_millis(u64::MAX)));
        assert_eq!(state.record_failure(), Some(Duration::from_millis(u64::MAX)));
    }

    #[test]
    fn test_immediate_never_waits_or_gives_up() {
        let mut state = BackoffState::new(BackoffConfig::immediate());
        for _ in 0..50 {
            assert_eq!(state.record_failure(), Some(Duration::ZERO));
        }
    }

    #[test]
    fn test_deserialize_partial_section() {
        let config: BackoffConfig = toml::from_str("max_restarts = 0").unwrap();
        assert_eq!(config.max_restarts, 0);
        assert_eq!(config.initial_delay_ms, 1_000);
    }
}
