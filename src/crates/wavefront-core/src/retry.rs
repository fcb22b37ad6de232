//! Retry policies for node execution.
//!
//! A [`RetryPolicy`] bounds how many times a node is attempted and how long
//! the engine waits between attempts. Backoff is linear by default and
//! exponential when the node opts in; jitter randomizes the delay to avoid
//! synchronized retries across parallel nodes.

use crate::graph::{NodeRuntimeConfig, WorkflowSettings};
use std::time::Duration;

/// Per-node retry configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Base delay between attempts in milliseconds.
    pub delay_ms: u64,
    /// Doubles the delay each attempt when set.
    pub exponential: bool,
    /// Adds up to 25% random extra delay when set.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 1_000,
            exponential: false,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_exponential(mut self, exponential: bool) -> Self {
        self.exponential = exponential;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Effective policy for a node: node config overrides workflow settings.
    pub fn for_node(config: &NodeRuntimeConfig, settings: &WorkflowSettings) -> Self {
        Self {
            max_attempts: config.retry_count.unwrap_or(settings.max_retries).max(1),
            delay_ms: config.retry_delay.unwrap_or(settings.retry_delay),
            exponential: config.exponential_backoff,
            jitter: config.exponential_backoff,
        }
    }

    /// Whether another attempt is allowed after `attempts` tries.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the given attempt (1-indexed: the delay taken after
    /// attempt `n` fails).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.delay_ms as f64;
        let scaled = if self.exponential {
            base * 2f64.powi(attempt.saturating_sub(1) as i32)
        } else {
            base
        };
        let with_jitter = if self.jitter {
            use rand::Rng;
            let factor: f64 = rand::thread_rng().gen_range(0.0..0.25);
            scaled * (1.0 + factor)
        } else {
            scaled
        };
        Duration::from_millis(with_jitter as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_single_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.should_retry(1));
    }

    #[test]
    fn linear_delay_is_constant() {
        let policy = RetryPolicy::new(3).with_delay_ms(100);
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(100));
    }

    #[test]
    fn exponential_delay_doubles() {
        let policy = RetryPolicy::new(4).with_delay_ms(100).with_exponential(true);
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
    }

    #[test]
    fn jitter_bounds() {
        let policy = RetryPolicy::new(2).with_delay_ms(100).with_jitter(true);
        for _ in 0..20 {
            let d = policy.delay(1).as_millis() as u64;
            assert!((100..=125).contains(&d), "delay {d} out of jitter range");
        }
    }

    #[test]
    fn node_config_overrides_settings() {
        let settings = WorkflowSettings {
            max_retries: 2,
            retry_delay: 500,
            ..Default::default()
        };
        let node_config = NodeRuntimeConfig {
            retry_count: Some(5),
            retry_delay: None,
            exponential_backoff: true,
            ..Default::default()
        };
        let policy = RetryPolicy::for_node(&node_config, &settings);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_ms, 500);
        assert!(policy.exponential);
    }
}
