//! Redis test infrastructure
//!
//! `TestRedis` starts a Redis container and hands out the connection flavour
//! the messaging crate expects (`ConnectionManager`).

use redis::Client;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// Test Redis wrapper that ensures proper cleanup
///
/// The container is automatically stopped and removed when this struct is dropped.
///
/// # Example
///
/// ```no_run
/// use test_utils::TestRedis;
///
/// # async fn example() {
/// let redis = TestRedis::new().await;
/// let manager = redis.shared_manager();
/// // Hand `manager` to a publisher or consumer
/// # }
/// ```
pub struct TestRedis {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    manager: ConnectionManager,
    pub connection_string: String,
}

impl TestRedis {
    /// Create a new test Redis instance (Redis 8 Alpine)
    pub async fn new() -> Self {
        let redis_image = Redis::default().with_tag("8-alpine");

        let container = redis_image
            .start()
            .await
            .expect("Failed to start Redis container");

        let host_port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let connection_string = format!("redis://127.0.0.1:{}", host_port);

        let client =
            Client::open(connection_string.clone()).expect("Failed to create Redis client");

        let manager = ConnectionManager::new(client)
            .await
            .expect("Failed to connect to Redis");

        tracing::info!(port = host_port, "Test Redis ready (Redis 8-alpine)");

        Self {
            container,
            manager,
            connection_string,
        }
    }

    /// A cloned connection manager
    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// The connection manager wrapped the way publishers and consumers take it
    pub fn shared_manager(&self) -> Arc<ConnectionManager> {
        Arc::new(self.manager.clone())
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}

impl Drop for TestRedis {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test Redis container");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_append_and_length() {
        let redis = TestRedis::new().await;
        let mut conn = redis.connection();

        let _: String = redis::cmd("XADD")
            .arg("test-stream")
            .arg("*")
            .arg("payload")
            .arg("hello")
            .query_async(&mut conn)
            .await
            .unwrap();

        let len: usize = redis::cmd("XLEN")
            .arg("test-stream")
            .query_async(&mut conn)
            .await
            .unwrap();
        assert_eq!(len, 1);
    }

    #[tokio::test]
    async fn test_shared_manager_sees_same_server() {
        let redis = TestRedis::new().await;
        let mut shared = (*redis.shared_manager()).clone();

        let _: () = redis::cmd("SET")
            .arg("relay")
            .arg("up")
            .query_async(&mut shared)
            .await
            .unwrap();

        let mut conn = redis.connection();
        let value: String = redis::cmd("GET")
            .arg("relay")
            .query_async(&mut conn)
            .await
            .unwrap();
        assert_eq!(value, "up");
    }
}
