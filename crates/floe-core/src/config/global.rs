//! Process-wide settings shared by every table loop.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Global configuration shared across all components.
///
/// ```
/// use floe_core::config::GlobalConfig;
///
/// let config = GlobalConfig::default();
/// assert_eq!(config.total_concurrency, None);
/// assert_eq!(config.retry.max_backoff_secs, 300);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Upper bound on tables writing or publishing at the same time.
    ///
    /// `None` leaves every table free to publish whenever its batch is ready.
    #[serde(default)]
    pub total_concurrency: Option<usize>,

    /// Random delay (0..N seconds) added to start times and poll intervals.
    #[serde(default)]
    pub poll_jitter_secs: u64,

    /// Backoff applied after transient failures.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl GlobalConfig {
    /// Merge values from another config file (last non-default wins).
    pub fn merge_from(&mut self, other: Self) {
        if other.total_concurrency.is_some() {
            self.total_concurrency = other.total_concurrency;
        }
        if other.poll_jitter_secs != 0 {
            self.poll_jitter_secs = other.poll_jitter_secs;
        }
        if other.retry != RetryConfig::default() {
            self.retry = other.retry;
        }
    }
}

/// Exponential backoff for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_secs() -> u64 {
    300
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

impl RetryConfig {
    /// Delay before the next attempt after `failures` consecutive transient failures.
    ///
    /// `poll_interval * multiplier^(failures - 1)`, capped at `max_backoff_secs`
    /// but never shorter than the poll interval itself.
    pub fn backoff_delay(&self, poll_interval: Duration, failures: u32) -> Duration {
        let max = Duration::from_secs(self.max_backoff_secs).max(poll_interval);
        let exponent = failures.saturating_sub(1).min(63) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let secs = poll_interval.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= max.as_secs_f64() {
            max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default() {
        let config = GlobalConfig::default();
        assert_eq!(config.total_concurrency, None);
        assert_eq!(config.poll_jitter_secs, 0);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
total_concurrency: 8
poll_jitter_secs: 3
retry:
  backoff_multiplier: 1.5
"#;
        let config: GlobalConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.total_concurrency, Some(8));
        assert_eq!(config.poll_jitter_secs, 3);
        assert_eq!(config.retry.backoff_multiplier, 1.5);
        assert_eq!(config.retry.max_backoff_secs, 300);
    }

    #[test]
    fn test_yaml_empty() {
        let config: GlobalConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, GlobalConfig::default());
    }

    #[test]
    fn test_merge_from_keeps_non_default_values() {
        let mut base = GlobalConfig {
            total_concurrency: Some(4),
            ..Default::default()
        };
        base.merge_from(GlobalConfig {
            poll_jitter_secs: 5,
            ..Default::default()
        });
        assert_eq!(base.total_concurrency, Some(4));
        assert_eq!(base.poll_jitter_secs, 5);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryConfig {
            backoff_multiplier: 2.0,
            max_backoff_secs: 60,
        };
        let interval = Duration::from_secs(10);
        assert_eq!(retry.backoff_delay(interval, 1), Duration::from_secs(10));
        assert_eq!(retry.backoff_delay(interval, 2), Duration::from_secs(20));
        assert_eq!(retry.backoff_delay(interval, 3), Duration::from_secs(40));
        assert_eq!(retry.backoff_delay(interval, 4), Duration::from_secs(60));
        assert_eq!(retry.backoff_delay(interval, 1000), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_never_below_interval() {
        let retry = RetryConfig {
            backoff_multiplier: 2.0,
            max_backoff_secs: 1,
        };
        let interval = Duration::from_secs(30);
        assert_eq!(retry.backoff_delay(interval, 5), interval);
    }
}
