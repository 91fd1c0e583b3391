//! Publishing seams and their Redis Streams implementations
//!
//! A topic maps to one stream. Each entry carries the message key, the raw
//! payload and one `header:<name>` field per header:
//!
//! ```text
//! XADD <topic> MAXLEN ~ <max_length> * key <key> payload <bytes> header:retry-count 1 ...
//! ```

use crate::error::{MessagingError, MessagingResult};
use crate::message::BrokerMessage;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tracing::debug;

pub const FIELD_KEY: &str = "key";
pub const FIELD_PAYLOAD: &str = "payload";
pub const HEADER_FIELD_PREFIX: &str = "header:";
pub const DEFAULT_MAX_LENGTH: i64 = 100_000;

/// Publishes a message to the topic named on the message itself
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Returns the broker-assigned entry id.
    async fn publish(&self, message: &BrokerMessage) -> MessagingResult<String>;
}

/// A writer bound to one topic; the message's own topic is ignored
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TopicWriter: Send + Sync {
    fn topic(&self) -> &str;

    async fn write(&self, message: &BrokerMessage) -> MessagingResult<String>;
}

/// Builds writers on demand for the failure handler's cache
#[cfg_attr(test, mockall::automock)]
pub trait WriterFactory: Send + Sync {
    fn create_writer(&self, topic: &str) -> MessagingResult<Arc<dyn TopicWriter>>;
}

/// Redis Streams publisher
#[derive(Clone)]
pub struct RedisStreamPublisher {
    redis: Arc<ConnectionManager>,
    max_length: i64,
}

impl RedisStreamPublisher {
    pub fn new(redis: ConnectionManager) -> Self {
        Self::from_arc(Arc::new(redis))
    }

    /// Create from an `Arc<ConnectionManager>` (for sharing connections).
    pub fn from_arc(redis: Arc<ConnectionManager>) -> Self {
        Self {
            redis,
            max_length: DEFAULT_MAX_LENGTH,
        }
    }

    /// Set the approximate maximum stream length (MAXLEN ~).
    pub fn with_max_length(mut self, max_length: i64) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn max_length(&self) -> i64 {
        self.max_length
    }

    async fn append(&self, topic: &str, message: &BrokerMessage) -> MessagingResult<String> {
        if topic.is_empty() {
            return Err(MessagingError::publish(topic, "topic must not be empty"));
        }

        let mut conn = (*self.redis).clone();

        let mut cmd = redis::cmd("XADD");
        cmd.arg(topic)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_length)
            .arg("*")
            .arg(FIELD_KEY)
            .arg(&message.key)
            .arg(FIELD_PAYLOAD)
            .arg(&message.payload);

        for (name, value) in message.headers.iter() {
            cmd.arg(format!("{HEADER_FIELD_PREFIX}{name}")).arg(value);
        }

        let entry_id: String = cmd.query_async(&mut conn).await?;

        debug!(
            topic = %topic,
            entry_id = %entry_id,
            headers = message.headers.len(),
            "Appended message"
        );

        Ok(entry_id)
    }
}

#[async_trait]
impl MessagePublisher for RedisStreamPublisher {
    async fn publish(&self, message: &BrokerMessage) -> MessagingResult<String> {
        self.append(&message.topic, message).await
    }
}

/// [`TopicWriter`] over a shared [`RedisStreamPublisher`]
pub struct RedisStreamWriter {
    publisher: RedisStreamPublisher,
    topic: String,
}

impl RedisStreamWriter {
    pub fn new(publisher: RedisStreamPublisher, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl TopicWriter for RedisStreamWriter {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn write(&self, message: &BrokerMessage) -> MessagingResult<String> {
        self.publisher.append(&self.topic, message).await
    }
}

#[derive(Clone)]
pub struct RedisWriterFactory {
    publisher: RedisStreamPublisher,
}

impl RedisWriterFactory {
    pub fn new(publisher: RedisStreamPublisher) -> Self {
        Self { publisher }
    }
}

impl WriterFactory for RedisWriterFactory {
    fn create_writer(&self, topic: &str) -> MessagingResult<Arc<dyn TopicWriter>> {
        debug!(topic = %topic, "Creating stream writer");
        Ok(Arc::new(RedisStreamWriter::new(self.publisher.clone(), topic)))
    }
}
