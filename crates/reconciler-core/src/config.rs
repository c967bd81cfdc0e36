//! Installer configuration.
//!
//! Deserialized from the embedding application's configuration (the daemon
//! reads it from the `[installer]` TOML table); every key has a default so
//! an empty table yields a working configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{InstallerError, InstallerResult};
use crate::retry::RetryPolicy;

/// Installer tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallerConfig {
    /// Transient failures tolerated before a task is given up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base retry delay in milliseconds
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Retry delay cap in milliseconds
    #[serde(default = "default_max_retry_backoff")]
    pub max_retry_backoff_ms: u64,

    /// Startup window for producers to re-confirm tracked entities
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,

    /// Background loop wake-up interval when idle
    #[serde(default = "default_idle_interval")]
    pub idle_interval_ms: u64,

    /// Directory of the file-backed tracking store
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_backoff() -> u64 {
    500
}

fn default_max_retry_backoff() -> u64 {
    30_000
}

fn default_grace_period() -> u64 {
    60
}

fn default_idle_interval() -> u64 {
    1000
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/reconciler/state")
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff(),
            max_retry_backoff_ms: default_max_retry_backoff(),
            grace_period_secs: default_grace_period(),
            idle_interval_ms: default_idle_interval(),
            state_dir: default_state_dir(),
        }
    }
}

impl InstallerConfig {
    /// Checks value ranges.
    pub fn validate(&self) -> InstallerResult<()> {
        if self.max_attempts == 0 {
            return Err(InstallerError::invalid_config(
                "max_attempts",
                "must be at least 1",
            ));
        }
        if self.max_retry_backoff_ms < self.retry_backoff_ms {
            return Err(InstallerError::invalid_config(
                "max_retry_backoff_ms",
                format!(
                    "cap {} is lower than base backoff {}",
                    self.max_retry_backoff_ms, self.retry_backoff_ms
                ),
            ));
        }
        if self.idle_interval_ms == 0 {
            return Err(InstallerError::invalid_config(
                "idle_interval_ms",
                "must be > 0",
            ));
        }
        Ok(())
    }

    /// Returns the retry policy these settings describe.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.retry_backoff_ms),
            Duration::from_millis(self.max_retry_backoff_ms),
        )
    }

    /// Get grace period as Duration
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Get idle interval as Duration
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = InstallerConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.retry_backoff_ms, 500);
        assert_eq!(config.max_retry_backoff_ms, 30_000);
        assert_eq!(config.grace_period(), Duration::from_secs(60));
        assert_eq!(config.idle_interval(), Duration::from_secs(1));
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/reconciler/state"));
        assert!(config.validate().is_ok());
    }

    fn parse(content: &str) -> InstallerConfig {
        toml::from_str(content).unwrap()
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = parse(
            r#"
max_attempts = 3
state_dir = "/tmp/state"
"#,
        );
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.state_dir, PathBuf::from("/tmp/state"));
        assert_eq!(config.grace_period_secs, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let err = parse("max_attempts = 0").validate().unwrap_err();
        assert!(matches!(err, InstallerError::InvalidConfig { ref field, .. } if field == "max_attempts"));
    }

    #[test]
    fn test_validate_rejects_cap_below_base() {
        let config = InstallerConfig {
            retry_backoff_ms: 1000,
            max_retry_backoff_ms: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_policy() {
        let config = InstallerConfig {
            max_attempts: 3,
            retry_backoff_ms: 100,
            max_retry_backoff_ms: 150,
            ..Default::default()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_for(2), Duration::from_millis(150));
    }

    #[test]
    fn test_malformed_toml() {
        assert!(toml::from_str::<InstallerConfig>("max_attempts = \"many\"").is_err());
    }
}
