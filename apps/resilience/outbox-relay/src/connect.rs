//! Connection bootstrap with retry

use coordination::{CoordinationConfig, CoordinationResult, EtcdCoordinator};
use redis::aio::ConnectionManager;
use sea_orm::{Database, DatabaseConnection, DbErr};
use tracing::info;

use crate::config::PostgresSettings;
use crate::retry::{RetryConfig, retry_with_backoff};

pub async fn connect_postgres(
    settings: &PostgresSettings,
    retry: &RetryConfig,
) -> Result<DatabaseConnection, DbErr> {
    info!("Connecting to PostgreSQL...");
    let db = retry_with_backoff("postgres", retry, || {
        Database::connect(settings.connect_options())
    })
    .await?;
    info!("Connected to PostgreSQL");
    Ok(db)
}

pub async fn connect_redis(url: &str, retry: &RetryConfig) -> redis::RedisResult<ConnectionManager> {
    info!("Connecting to Redis...");
    let client = redis::Client::open(url)?;
    let manager = retry_with_backoff("redis", retry, || ConnectionManager::new(client.clone())).await?;
    info!("Connected to Redis");
    Ok(manager)
}

pub async fn connect_etcd(
    config: &CoordinationConfig,
    retry: &RetryConfig,
) -> CoordinationResult<EtcdCoordinator> {
    info!(endpoints = ?config.endpoints, "Connecting to etcd...");
    let coordinator = retry_with_backoff("etcd", retry, || EtcdCoordinator::connect(config)).await?;
    info!(lease_id = coordinator.lease_id(), "Connected to etcd");
    Ok(coordinator)
}
