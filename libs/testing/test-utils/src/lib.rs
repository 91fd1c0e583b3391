//! Shared test utilities for the outbox and messaging crates
//!
//! - `TestDatabase`: PostgreSQL container with migrations applied (feature: "postgres")
//! - `TestRedis`: Redis container handing out `ConnectionManager`s (feature: "redis")
//! - `TestDataBuilder`: deterministic topics, keys and payloads (always available)
//! - `assertions`: custom assertion helpers (always available)
//!
//! # Features
//!
//! - `postgres` (default): PostgreSQL test infrastructure
//! - `redis`: Redis test infrastructure
//! - `all`: both
//!
//! # Usage
//!
//! ```rust,no_run
//! use test_utils::{TestDatabase, TestDataBuilder};
//!
//! #[tokio::test]
//! async fn my_outbox_test() {
//!     let db = TestDatabase::new().await;
//!     let builder = TestDataBuilder::from_test_name("my_outbox_test");
//!
//!     let topic = builder.topic("orders");
//!     let key = builder.key(1);
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "postgres")]
mod postgres;

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "postgres")]
pub use postgres::TestDatabase;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Builder for test data with deterministic randomization
///
/// Tests sharing one container stay isolated by deriving topic names from
/// the test name.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_forward_pending");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Deterministic aggregate id
    pub fn aggregate_id(&self) -> Uuid {
        let bytes = self.seed.to_le_bytes();
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&bytes);
        uuid_bytes[8..16].copy_from_slice(&bytes);
        Uuid::from_bytes(uuid_bytes)
    }

    /// Topic name unique to this builder
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(7);
    /// assert_eq!(builder.topic("orders"), "test-7-orders");
    /// ```
    pub fn topic(&self, base: &str) -> String {
        format!("test-{}-{}", self.seed, base)
    }

    /// Message key for the `n`th message of a test
    pub fn key(&self, n: usize) -> String {
        format!("key-{}-{}", self.seed, n)
    }

    /// Small JSON payload carrying the sequence number
    pub fn payload(&self, n: usize) -> Vec<u8> {
        format!(r#"{{"seed":{},"n":{}}}"#, self.seed, n).into_bytes()
    }
}

/// Test assertion helpers
pub mod assertions {
    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }

    /// Assert that `items` appear in exactly the order given by `expected`
    pub fn assert_in_order<T: PartialEq + std::fmt::Debug>(items: &[T], expected: &[T], context: &str) {
        assert_eq!(items, expected, "{}: unexpected order", context);
    }
}
