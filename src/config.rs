use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::transfer::{LivenessConfig, RetryPolicy, ServiceTimeouts};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DoorConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    /// Pool selection for downloads
    #[serde(default = "RetryPolicyConfig::read_default")]
    pub read_retry: RetryPolicyConfig,
    /// Pool selection for uploads
    #[serde(default = "RetryPolicyConfig::write_default")]
    pub write_retry: RetryPolicyConfig,
    #[serde(default)]
    pub liveness: LivenessSection,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    /// never, hourly or daily
    pub rotation: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "door.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
        }
    }
}

/// Service reply timeouts in milliseconds
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub namespace_ms: u64,
    pub pool_manager_ms: u64,
    pub pool_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        let defaults = ServiceTimeouts::default();
        Self {
            namespace_ms: millis(defaults.namespace),
            pool_manager_ms: millis(defaults.pool_manager),
            pool_ms: millis(defaults.pool),
        }
    }
}

impl TimeoutsConfig {
    pub fn to_timeouts(&self) -> ServiceTimeouts {
        ServiceTimeouts {
            namespace: Duration::from_millis(self.namespace_ms),
            pool_manager: Duration::from_millis(self.pool_manager_ms),
            pool: Duration::from_millis(self.pool_ms),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RetryPolicyConfig {
    pub retry_count: u32,
    pub retry_period_ms: u64,
    /// Absent means no deadline
    #[serde(default)]
    pub total_timeout_ms: Option<u64>,
    pub mover_start_timeout_ms: u64,
}

impl RetryPolicyConfig {
    fn read_default() -> Self {
        Self {
            retry_count: u32::MAX,
            retry_period_ms: 60_000,
            total_timeout_ms: None,
            mover_start_timeout_ms: 60_000,
        }
    }

    fn write_default() -> Self {
        Self {
            retry_count: 2,
            retry_period_ms: 10_000,
            total_timeout_ms: Some(300_000),
            mover_start_timeout_ms: 60_000,
        }
    }

    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::bounded(
            self.retry_count,
            Duration::from_millis(self.retry_period_ms),
            self.total_timeout_ms
                .map_or(Duration::MAX, Duration::from_millis),
            Duration::from_millis(self.mover_start_timeout_ms),
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LivenessSection {
    pub poll_interval_secs: u64,
}

impl Default for LivenessSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: LivenessConfig::default().poll_interval.as_secs(),
        }
    }
}

impl LivenessSection {
    pub fn to_config(&self) -> LivenessConfig {
        LivenessConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
        }
    }
}

impl Default for DoorConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            timeouts: TimeoutsConfig::default(),
            read_retry: RetryPolicyConfig::read_default(),
            write_retry: RetryPolicyConfig::write_default(),
            liveness: LivenessSection::default(),
        }
    }
}

impl DoorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).context("Failed to parse config yaml")?;
        if config.liveness.poll_interval_secs == 0 {
            anyhow::bail!("liveness.poll_interval_secs must be positive");
        }
        Ok(config)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_sample_config() {
        let config = DoorConfig::from_yaml(include_str!("../config/door.yaml")).unwrap();
        assert_eq!(config.logging.rotation, "daily");
        assert_eq!(config.timeouts.pool_ms, 30_000);
        assert_eq!(config.write_retry.retry_count, 3);
        assert_eq!(config.liveness.to_config().poll_interval, Duration::from_secs(120));
    }

    #[test]
    fn test_defaults_for_missing_sections() {
        let config = DoorConfig::from_yaml("logging:\n  log_level: debug\n").unwrap();
        assert_eq!(config.logging.log_level, "debug");
        assert_eq!(config.logging.log_file, "door.log");
        assert_eq!(config.timeouts.to_timeouts(), ServiceTimeouts::default());
        assert_eq!(config.read_retry.to_policy(), RetryPolicy::never_fail_policy());
        assert_eq!(config.write_retry.total_timeout_ms, Some(300_000));
    }

    #[test]
    fn test_missing_total_timeout_is_infinite() {
        let config = DoorConfig::from_yaml(
            "read_retry:\n  retry_count: 5\n  retry_period_ms: 1000\n  mover_start_timeout_ms: 2000\n",
        )
        .unwrap();
        let policy = config.read_retry.to_policy();
        assert_eq!(policy.retry_count(), 5);
        assert_eq!(policy.total_timeout(), Duration::MAX);
        assert_eq!(policy.mover_start_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_rejects_zero_poll_interval() {
        assert!(DoorConfig::from_yaml("liveness:\n  poll_interval_secs: 0\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "timeouts:\n  namespace_ms: 1500").unwrap();

        let config = DoorConfig::load(file.path()).unwrap();
        assert_eq!(
            config.timeouts.to_timeouts().namespace,
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_load_missing_file() {
        let err = DoorConfig::load("/nonexistent/door.yaml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
