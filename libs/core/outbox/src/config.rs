//! Forwarder and store settings

use core_config::{ConfigError, FromEnv, env_parse, env_parse_opt};
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_BATCH_SIZE: u64 = 100;
/// Pending records younger than this are left alone by the forwarder
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxConfig {
    pub poll_interval: Duration,
    pub batch_size: u64,
    pub stale_after: Duration,
    /// Move a record to FAILED once this many publishes failed. Unset means retry forever.
    pub max_publish_attempts: Option<u32>,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            stale_after: DEFAULT_STALE_AFTER,
            max_publish_attempts: None,
        }
    }
}

impl OutboxConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_max_publish_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_publish_attempts = attempts;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "outbox poll interval must be greater than zero".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "outbox batch size must be greater than zero".to_string(),
            ));
        }
        if self.max_publish_attempts == Some(0) {
            return Err(ConfigError::Invalid(
                "max publish attempts must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }
}

impl FromEnv for OutboxConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            poll_interval: Duration::from_millis(env_parse(
                "OUTBOX_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            batch_size: env_parse("OUTBOX_BATCH_SIZE", defaults.batch_size)?,
            stale_after: Duration::from_secs(env_parse(
                "OUTBOX_STALE_AFTER_SECS",
                defaults.stale_after.as_secs(),
            )?),
            max_publish_attempts: env_parse_opt("OUTBOX_MAX_PUBLISH_ATTEMPTS")?,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OutboxConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.stale_after, Duration::from_secs(60));
        assert_eq!(config.max_publish_attempts, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_env() {
        temp_env::with_vars(
            [
                ("OUTBOX_POLL_INTERVAL_MS", Some("250")),
                ("OUTBOX_BATCH_SIZE", Some("20")),
                ("OUTBOX_STALE_AFTER_SECS", Some("5")),
                ("OUTBOX_MAX_PUBLISH_ATTEMPTS", Some("10")),
            ],
            || {
                let config = OutboxConfig::from_env().unwrap();
                assert_eq!(config.poll_interval, Duration::from_millis(250));
                assert_eq!(config.batch_size, 20);
                assert_eq!(config.stale_after, Duration::from_secs(5));
                assert_eq!(config.max_publish_attempts, Some(10));
            },
        );
    }

    #[test]
    fn test_from_env_defaults() {
        temp_env::with_vars_unset(
            [
                "OUTBOX_POLL_INTERVAL_MS",
                "OUTBOX_BATCH_SIZE",
                "OUTBOX_STALE_AFTER_SECS",
                "OUTBOX_MAX_PUBLISH_ATTEMPTS",
            ],
            || {
                assert_eq!(OutboxConfig::from_env().unwrap(), OutboxConfig::default());
            },
        );
    }

    #[test]
    fn test_invalid_values() {
        temp_env::with_var("OUTBOX_BATCH_SIZE", Some("0"), || {
            assert!(OutboxConfig::from_env().is_err());
        });
        temp_env::with_var("OUTBOX_BATCH_SIZE", Some("lots"), || {
            assert!(OutboxConfig::from_env().is_err());
        });
        assert!(
            OutboxConfig::default()
                .with_max_publish_attempts(Some(0))
                .validate()
                .is_err()
        );
    }
}
