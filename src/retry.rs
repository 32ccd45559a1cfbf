//! Retry policy for tile decodes
//!
//! Fixed delay between attempts, no exponential growth. The engine arms a
//! timer for each retry instead of sleeping on the scheduling thread.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Extra attempts after the first failure
    pub max_retries: u32,
    /// Delay before each retry
    #[serde(rename = "delay_ms", with = "crate::config::duration_ms")]
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delay: Duration::from_millis(200),
        }
    }
}

impl RetryConfig {
    /// Create a new retry config
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum retries
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the delay between attempts
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Delay before the next attempt given `failures` failed attempts so far,
    /// or `None` once the budget is spent
    pub fn next_delay(&self, failures: u32) -> Option<Duration> {
        if failures == 0 || failures > self.max_retries {
            return None;
        }
        Some(self.delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay_until_budget_spent() {
        let config = RetryConfig::default();
        assert_eq!(config.next_delay(1), Some(Duration::from_millis(200)));
        assert_eq!(config.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(config.next_delay(3), None);
    }

    #[test]
    fn test_zero_retries() {
        let config = RetryConfig::new().max_retries(0).delay(Duration::from_millis(5));
        assert_eq!(config.next_delay(1), None);
        assert_eq!(config.delay, Duration::from_millis(5));
    }

    #[test]
    fn test_serde_uses_millis() {
        let json = serde_json::to_string(&RetryConfig::default()).unwrap();
        assert_eq!(json, r#"{"max_retries":2,"delay_ms":200}"#);
        let back: RetryConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, RetryConfig::default());
    }
}
