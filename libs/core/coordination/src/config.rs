//! Coordination client and lock configuration

use crate::lock::{DEFAULT_LOCK_ROOT, DEFAULT_WAIT_TIMEOUT, LockOptions};
use core_config::{ConfigError, FromEnv, env_list, env_or_default, env_parse};
use std::time::Duration;

/// Connection settings for the etcd-backed coordinator plus lock defaults
#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    /// etcd endpoints, e.g. `http://etcd-0:2379`
    pub endpoints: Vec<String>,
    /// Lease TTL backing the session; ephemeral nodes vanish this long after a crash
    pub session_ttl_secs: i64,
    pub connect_timeout: Duration,
    pub lock_root: String,
    pub lock_wait_timeout: Duration,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            session_ttl_secs: 10,
            connect_timeout: Duration::from_secs(5),
            lock_root: DEFAULT_LOCK_ROOT.to_string(),
            lock_wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

impl CoordinationConfig {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            ..Default::default()
        }
    }

    pub fn with_session_ttl(mut self, ttl_secs: i64) -> Self {
        self.session_ttl_secs = ttl_secs;
        self
    }

    pub fn with_lock_root(mut self, root: impl Into<String>) -> Self {
        self.lock_root = root.into();
        self
    }

    pub fn with_lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = timeout;
        self
    }

    /// Interval between lease keep-alives, a third of the TTL
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis((self.session_ttl_secs.max(1) as u64 * 1000) / 3)
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions::default()
            .with_root(self.lock_root.clone())
            .with_wait_timeout(self.lock_wait_timeout)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one etcd endpoint is required".to_string(),
            ));
        }
        if self.session_ttl_secs < 2 {
            return Err(ConfigError::Invalid(format!(
                "session TTL must be at least 2 seconds, got {}",
                self.session_ttl_secs
            )));
        }
        if !self.lock_root.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "lock root must be an absolute path, got '{}'",
                self.lock_root
            )));
        }
        Ok(())
    }
}

impl FromEnv for CoordinationConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            endpoints: env_list("ETCD_ENDPOINTS").unwrap_or(defaults.endpoints),
            session_ttl_secs: env_parse("ETCD_SESSION_TTL_SECS", defaults.session_ttl_secs)?,
            connect_timeout: Duration::from_secs(env_parse(
                "ETCD_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout.as_secs(),
            )?),
            lock_root: env_or_default("LOCK_ROOT", DEFAULT_LOCK_ROOT),
            lock_wait_timeout: Duration::from_secs(env_parse(
                "LOCK_WAIT_TIMEOUT_SECS",
                defaults.lock_wait_timeout.as_secs(),
            )?),
        };
        config.validate()?;
        Ok(config)
    }
}
