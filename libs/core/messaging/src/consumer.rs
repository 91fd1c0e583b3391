//! Redis Streams consumer-group reader
//!
//! Decodes entries written by [`crate::publisher::RedisStreamPublisher`] back
//! into [`BrokerMessage`]s. Streams have no partitions, so every message
//! reports partition 0 and the millisecond part of its entry id as offset.

use crate::config::ConsumerConfig;
use crate::error::{MessagingError, MessagingResult};
use crate::message::{BrokerMessage, Headers};
use crate::publisher::{FIELD_KEY, FIELD_PAYLOAD, HEADER_FIELD_PREFIX};
use redis::RedisResult;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tracing::{debug, info, warn};

type StreamEntries = Vec<(String, Vec<(String, Vec<u8>)>)>;
type StreamReply = Vec<(String, StreamEntries)>;

/// A message read from a stream, with the entry id needed to acknowledge it
#[derive(Debug, Clone)]
pub struct Delivery {
    pub entry_id: String,
    pub message: BrokerMessage,
}

pub struct StreamConsumer {
    redis: Arc<ConnectionManager>,
    config: ConsumerConfig,
}

impl StreamConsumer {
    pub fn new(redis: Arc<ConnectionManager>, config: ConsumerConfig) -> Self {
        Self { redis, config }
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    pub fn group(&self) -> &str {
        &self.config.group
    }

    pub fn consumer_id(&self) -> &str {
        &self.config.consumer_id
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn is_blocking(&self) -> bool {
        self.config.block_ms.is_some()
    }

    /// Create the consumer group (and the stream) unless it already exists.
    pub async fn init_consumer_group(&self) -> MessagingResult<()> {
        let mut conn = (*self.redis).clone();

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.topic)
            .arg(&self.config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(
                    topic = %self.config.topic,
                    group = %self.config.group,
                    "Created consumer group"
                );
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(
                    topic = %self.config.topic,
                    group = %self.config.group,
                    "Consumer group already exists"
                );
            }
            Err(e) => return Err(MessagingError::Redis(e)),
        }

        Ok(())
    }

    /// Messages delivered to this consumer earlier but never acknowledged
    pub async fn read_pending(&self) -> MessagingResult<Vec<Delivery>> {
        let mut conn = (*self.redis).clone();

        let streams: StreamReply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.group)
            .arg(&self.config.consumer_id)
            .arg("COUNT")
            .arg(self.config.batch_size)
            .arg("STREAMS")
            .arg(&self.config.topic)
            .arg("0")
            .query_async(&mut conn)
            .await?;

        Ok(self.decode_reply(streams))
    }

    /// New messages, blocking up to `block_ms` when configured
    pub async fn read_new(&self) -> MessagingResult<Vec<Delivery>> {
        let mut conn = (*self.redis).clone();

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.config.group)
            .arg(&self.config.consumer_id);

        if let Some(block_ms) = self.config.block_ms {
            cmd.arg("BLOCK").arg(block_ms);
        }

        cmd.arg("COUNT")
            .arg(self.config.batch_size)
            .arg("STREAMS")
            .arg(&self.config.topic)
            .arg(">");

        // Nil reply when BLOCK elapses without messages
        let streams: Option<StreamReply> = cmd.query_async(&mut conn).await?;

        Ok(streams
            .map(|streams| self.decode_reply(streams))
            .unwrap_or_default())
    }

    pub async fn ack(&self, entry_id: &str) -> MessagingResult<()> {
        let mut conn = (*self.redis).clone();

        let _: i64 = redis::cmd("XACK")
            .arg(&self.config.topic)
            .arg(&self.config.group)
            .arg(entry_id)
            .query_async(&mut conn)
            .await?;

        debug!(entry_id = %entry_id, "Acknowledged message");
        Ok(())
    }

    fn decode_reply(&self, streams: StreamReply) -> Vec<Delivery> {
        streams
            .into_iter()
            .flat_map(|(topic, entries)| {
                entries.into_iter().filter_map(move |(entry_id, fields)| {
                    decode_entry(&topic, &entry_id, fields).map(|message| Delivery {
                        entry_id,
                        message,
                    })
                })
            })
            .collect()
    }
}

/// Rebuild a message from one stream entry.
///
/// Entries without a payload field are skipped with a warning.
pub fn decode_entry(
    topic: &str,
    entry_id: &str,
    fields: Vec<(String, Vec<u8>)>,
) -> Option<BrokerMessage> {
    let mut key = Vec::new();
    let mut payload = None;
    let mut headers = Headers::new();

    for (field, value) in fields {
        if field == FIELD_KEY {
            key = value;
        } else if field == FIELD_PAYLOAD {
            payload = Some(value);
        } else if let Some(name) = field.strip_prefix(HEADER_FIELD_PREFIX) {
            headers.set(name, String::from_utf8_lossy(&value).into_owned());
        }
    }

    let Some(payload) = payload else {
        warn!(topic = %topic, entry_id = %entry_id, "Missing 'payload' field in entry, skipping");
        return None;
    };

    let offset = entry_id
        .split_once('-')
        .and_then(|(millis, _)| millis.parse().ok())
        .unwrap_or_default();

    Some(BrokerMessage {
        topic: topic.to_string(),
        partition: 0,
        offset,
        key,
        headers,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, value: &str) -> (String, Vec<u8>) {
        (name.to_string(), value.as_bytes().to_vec())
    }

    #[test]
    fn test_decode_entry() {
        let message = decode_entry(
            "orders",
            "1700000000123-4",
            vec![
                field("key", "order-1"),
                field("payload", r#"{"id":1}"#),
                field("header:retry-count", "2"),
                field("header:traceparent", "00-abc-def-01"),
                field("unrelated", "x"),
            ],
        )
        .unwrap();

        assert_eq!(message.topic, "orders");
        assert_eq!(message.partition, 0);
        assert_eq!(message.offset, 1_700_000_000_123);
        assert_eq!(message.key_str(), "order-1");
        assert_eq!(message.headers.retry_count(), 2);
        assert_eq!(message.headers.keys(), vec!["retry-count", "traceparent"]);
    }

    #[test]
    fn test_decode_entry_without_payload() {
        assert!(decode_entry("orders", "1-0", vec![field("key", "k")]).is_none());
    }
}
