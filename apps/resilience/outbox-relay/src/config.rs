//! Relay configuration, loaded from the environment

use coordination::CoordinationConfig;
use core_config::{ConfigError, FromEnv, env_bool, env_or_default, env_parse, env_required};
use outbox::OutboxConfig;
use sea_orm::ConnectOptions;
use std::time::Duration;

use crate::retry::RetryConfig;

pub const DEFAULT_SERVICE_NAME: &str = "outbox-relay";
pub const DEFAULT_LEADER_RESOURCE: &str = "outbox-relay";

/// PostgreSQL pool settings
#[derive(Debug, Clone)]
pub struct PostgresSettings {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    pub acquire_timeout: Duration,
    pub sqlx_logging: bool,
}

impl PostgresSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(8),
            acquire_timeout: Duration::from_secs(8),
            sqlx_logging: false,
        }
    }

    pub fn connect_options(&self) -> ConnectOptions {
        let mut options = ConnectOptions::new(self.url.clone());
        options
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .connect_timeout(self.connect_timeout)
            .acquire_timeout(self.acquire_timeout)
            .sqlx_logging(self.sqlx_logging);
        options
    }
}

impl FromEnv for PostgresSettings {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::new(env_required("DATABASE_URL")?);
        Ok(Self {
            max_connections: env_parse("DB_MAX_CONNECTIONS", defaults.max_connections)?,
            min_connections: env_parse("DB_MIN_CONNECTIONS", defaults.min_connections)?,
            connect_timeout: Duration::from_secs(env_parse(
                "DB_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout.as_secs(),
            )?),
            acquire_timeout: Duration::from_secs(env_parse(
                "DB_ACQUIRE_TIMEOUT_SECS",
                defaults.acquire_timeout.as_secs(),
            )?),
            sqlx_logging: env_bool("DB_SQLX_LOGGING", defaults.sqlx_logging)?,
            ..defaults
        })
    }
}

/// Only one relay forwards at a time when this is set
#[derive(Debug, Clone)]
pub struct LeaderSettings {
    pub resource: String,
    pub coordination: CoordinationConfig,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub service_name: String,
    pub database: PostgresSettings,
    pub redis_url: String,
    pub stream_max_length: i64,
    pub run_migrations: bool,
    pub connect_retry: RetryConfig,
    pub outbox: OutboxConfig,
    pub leader: Option<LeaderSettings>,
}

impl FromEnv for AppConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let retry_defaults = RetryConfig::default();
        let connect_retry = RetryConfig::default()
            .with_max_retries(env_parse("CONNECT_MAX_RETRIES", retry_defaults.max_retries)?)
            .with_initial_delay(Duration::from_millis(env_parse(
                "CONNECT_INITIAL_DELAY_MS",
                retry_defaults.initial_delay.as_millis() as u64,
            )?));

        let leader = if env_bool("LEADER_LOCK_ENABLED", false)? {
            Some(LeaderSettings {
                resource: env_or_default("LEADER_LOCK_RESOURCE", DEFAULT_LEADER_RESOURCE),
                coordination: CoordinationConfig::from_env()?,
            })
        } else {
            None
        };

        Ok(Self {
            service_name: env_or_default("SERVICE_NAME", DEFAULT_SERVICE_NAME),
            database: PostgresSettings::from_env()?,
            redis_url: env_or_default("REDIS_URL", "redis://127.0.0.1:6379"),
            stream_max_length: env_parse("STREAM_MAX_LENGTH", 100_000i64)?,
            run_migrations: env_bool("RUN_MIGRATIONS", false)?,
            connect_retry,
            outbox: OutboxConfig::from_env()?,
            leader,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNSET: [&str; 6] = [
        "LEADER_LOCK_ENABLED",
        "RUN_MIGRATIONS",
        "REDIS_URL",
        "SERVICE_NAME",
        "STREAM_MAX_LENGTH",
        "CONNECT_MAX_RETRIES",
    ];

    #[test]
    fn test_minimal_env() {
        temp_env::with_vars_unset(UNSET, || {
            temp_env::with_var("DATABASE_URL", Some("postgres://localhost/outbox"), || {
                let config = AppConfig::from_env().unwrap();
                assert_eq!(config.service_name, "outbox-relay");
                assert_eq!(config.database.url, "postgres://localhost/outbox");
                assert_eq!(config.redis_url, "redis://127.0.0.1:6379");
                assert_eq!(config.connect_retry.max_retries, 5);
                assert!(!config.run_migrations);
                assert!(config.leader.is_none());
            });
        });
    }

    #[test]
    fn test_database_url_is_required() {
        temp_env::with_var_unset("DATABASE_URL", || {
            assert!(matches!(
                AppConfig::from_env(),
                Err(ConfigError::MissingEnvVar(_))
            ));
        });
    }

    #[test]
    fn test_leader_lock() {
        temp_env::with_vars_unset(UNSET, || {
            temp_env::with_vars(
                [
                    ("DATABASE_URL", Some("postgres://localhost/outbox")),
                    ("LEADER_LOCK_ENABLED", Some("true")),
                    ("LEADER_LOCK_RESOURCE", Some("relay-eu")),
                    ("ETCD_ENDPOINTS", Some("http://etcd-0:2379,http://etcd-1:2379")),
                ],
                || {
                    let config = AppConfig::from_env().unwrap();

                    let leader = config.leader.unwrap();
                    assert_eq!(leader.resource, "relay-eu");
                    assert_eq!(leader.coordination.endpoints.len(), 2);
                },
            );
        });
    }

    #[test]
    fn test_consumer_variables_do_not_affect_relay() {
        // The relay only forwards outbox records; it never consumes retry topics
        temp_env::with_vars_unset(UNSET, || {
            temp_env::with_vars(
                [
                    ("DATABASE_URL", Some("postgres://localhost/outbox")),
                    ("REDRIVE_ENABLED", Some("true")),
                    ("CONSUMER_TOPIC", None),
                    ("RESILIENCE_CONFIG_PATH", Some("/does/not/exist.yaml")),
                ],
                || {
                    let config = AppConfig::from_env().unwrap();
                    assert!(config.leader.is_none());
                },
            );
        });
    }

    #[test]
    fn test_postgres_connect_options() {
        let settings = PostgresSettings::new("postgres://localhost/outbox");
        let options = settings.connect_options();
        assert_eq!(options.get_url(), "postgres://localhost/outbox");
        assert_eq!(options.get_max_connections(), Some(10));
    }
}
