//! Engine configuration
//!
//! ## Table of Contents
//! - **StreamConfig**: Budget, thresholds, pool and cache sizing
//! - **OrphanPolicy**: What the index does with tiles whose parent is missing
//! - **duration_ms**: Serde helper storing durations as integer milliseconds

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};
use crate::retry::RetryConfig;

/// Handling of hierarchy entries whose direct parent is not in the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Attach to the nearest existing ancestor and log a warning
    #[default]
    Reparent,
    /// Refuse the insertion with `MissingAncestor`
    Reject,
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Maximum simultaneously visible (or in-flight) points
    pub point_budget: u64,
    /// Tiles whose error estimate is at or below this are not refined
    pub error_threshold: f64,
    /// Number of decode workers
    pub pool_size: usize,
    /// Retry policy for failed decodes
    pub retry: RetryConfig,
    /// Minimum interval between interaction-triggered passes
    #[serde(rename = "throttle_ms", with = "duration_ms")]
    pub throttle: Duration,
    /// Cached point ceiling; `None` means twice the point budget
    pub cache_ceiling: Option<u64>,
    /// Deepest level the traversal descends to
    pub max_traversal_depth: Option<u32>,
    /// Orphaned hierarchy entries
    pub orphan_policy: OrphanPolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            point_budget: 4_000_000,
            error_threshold: 0.002,
            pool_size: 4,
            retry: RetryConfig::default(),
            throttle: Duration::from_millis(300),
            cache_ceiling: None,
            max_traversal_depth: None,
            orphan_policy: OrphanPolicy::Reparent,
        }
    }
}

impl StreamConfig {
    /// Create a config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from JSON; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.point_budget == 0 {
            return Err(StreamError::config("point_budget must be positive"));
        }
        if self.pool_size == 0 {
            return Err(StreamError::config("pool_size must be at least 1"));
        }
        if !self.error_threshold.is_finite() || self.error_threshold < 0.0 {
            return Err(StreamError::config(format!(
                "error_threshold must be finite and non-negative, got {}",
                self.error_threshold
            )));
        }
        if self.cache_ceiling == Some(0) {
            return Err(StreamError::config("cache_ceiling must be positive"));
        }
        Ok(())
    }

    /// Effective cache ceiling in points
    pub fn effective_cache_ceiling(&self) -> u64 {
        self.cache_ceiling
            .unwrap_or_else(|| self.point_budget.saturating_mul(2))
    }

    /// Set the point budget
    pub fn point_budget(mut self, points: u64) -> Self {
        self.point_budget = points;
        self
    }

    /// Set the error threshold
    pub fn error_threshold(mut self, threshold: f64) -> Self {
        self.error_threshold = threshold;
        self
    }

    /// Set the worker count
    pub fn pool_size(mut self, workers: usize) -> Self {
        self.pool_size = workers;
        self
    }

    /// Set the retry policy
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the interaction throttle interval
    pub fn throttle(mut self, interval: Duration) -> Self {
        self.throttle = interval;
        self
    }

    /// Set an explicit cache ceiling in points
    pub fn cache_ceiling(mut self, points: u64) -> Self {
        self.cache_ceiling = Some(points);
        self
    }

    /// Cap traversal depth
    pub fn max_traversal_depth(mut self, depth: u32) -> Self {
        self.max_traversal_depth = Some(depth);
        self
    }

    /// Set the orphan policy
    pub fn orphan_policy(mut self, policy: OrphanPolicy) -> Self {
        self.orphan_policy = policy;
        self
    }
}

/// Serialize a `Duration` as whole milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize as `u64` milliseconds
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    /// Deserialize from `u64` milliseconds
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
