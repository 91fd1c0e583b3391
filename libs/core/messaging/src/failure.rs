//! Retry and dead-letter routing for messages a consumer failed to process
//!
//! A failed message is republished either to a delayed retry topic or to the
//! dead-letter topic. Lineage headers always name the first hop, no matter
//! how many retry topics the message has already passed through.

use crate::config::{DELAY_PLACEHOLDER, ResilienceConfig, TOPIC_PLACEHOLDER};
use crate::error::{MessagingResult, ProcessingError};
use crate::message::{
    BrokerMessage, HEADER_EXCEPTION_FQCN, HEADER_EXCEPTION_KIND, HEADER_EXCEPTION_MESSAGE,
    HEADER_EXCEPTION_STACKTRACE, HEADER_ORIGINAL_OFFSET, HEADER_ORIGINAL_PARTITION,
    HEADER_ORIGINAL_TOPIC, HEADER_RETRY_COUNT, Headers,
};
use crate::metrics;
use crate::propagation::inject_trace_context;
use crate::publisher::{TopicWriter, WriterFactory};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use strum::{AsRefStr, Display};
use tokio::sync::Mutex;
use tracing::{Span, error, field, info, instrument};

const STACKTRACE_UNAVAILABLE: &str = "stacktrace not captured";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
pub enum FailureAction {
    #[strum(serialize = "RETRY")]
    Retry,
    #[strum(serialize = "DLT")]
    DeadLetter,
}

/// What the handler did with a failed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureOutcome {
    pub action: FailureAction,
    pub target_topic: String,
    /// Value written to the `retry-count` header
    pub retry_count: u32,
    /// Whether the republish succeeded
    pub delivered: bool,
}

pub struct FailureHandler<F: WriterFactory + ?Sized> {
    config: ResilienceConfig,
    retryable_exceptions: HashSet<String>,
    factory: Arc<F>,
    writers: Mutex<HashMap<String, Arc<dyn TopicWriter>>>,
}

impl<F: WriterFactory + ?Sized> FailureHandler<F> {
    pub fn new(config: ResilienceConfig, factory: Arc<F>) -> Self {
        let retryable_exceptions = config.retryable_exceptions.iter().cloned().collect();
        Self {
            config,
            retryable_exceptions,
            factory,
            writers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Route a failed message to its retry or dead-letter topic.
    ///
    /// Returns `None` when resilience is disabled. A failure to publish the
    /// routed message is logged and reported through `delivered`; it is not
    /// retried.
    #[instrument(
        name = "FailureHandler.handle",
        skip_all,
        fields(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            failure.action = field::Empty,
            failure.target_topic = field::Empty,
            otel.status_code = field::Empty,
        )
    )]
    pub async fn handle(
        &self,
        message: &BrokerMessage,
        error: Option<&ProcessingError>,
    ) -> Option<FailureOutcome> {
        if !self.config.enabled {
            return None;
        }

        let span = Span::current();
        let retry_count = message.headers.retry_count();
        let base_topic = message
            .headers
            .get(HEADER_ORIGINAL_TOPIC)
            .filter(|topic| !topic.is_empty())
            .unwrap_or(message.topic.as_str())
            .to_string();

        let (action, target_topic, next_retry_count) =
            self.route(&base_topic, retry_count, error);

        span.record("failure.action", action.as_ref());
        span.record("failure.target_topic", target_topic.as_str());

        let routed =
            self.prepare_message(message, error, next_retry_count, &base_topic, &target_topic);

        info!(
            action = %action,
            target_topic = %target_topic,
            retry_count = next_retry_count,
            error = error.map(|e| e.message.as_str()).unwrap_or("none"),
            "Routing failed message"
        );
        metrics::failure_routed(action.as_ref(), &base_topic);

        let delivered = match self.publish(&routed).await {
            Ok(entry_id) => {
                info!(target_topic = %target_topic, entry_id = %entry_id, "Failed message republished");
                true
            }
            Err(e) => {
                span.record("otel.status_code", "ERROR");
                error!(
                    target_topic = %target_topic,
                    error = %e,
                    "Failed to publish to failure topic"
                );
                metrics::failure_publish_failed(&target_topic);
                false
            }
        };

        Some(FailureOutcome {
            action,
            target_topic,
            retry_count: next_retry_count,
            delivered,
        })
    }

    fn is_retryable(&self, error: Option<&ProcessingError>) -> bool {
        match error {
            Some(err) => {
                self.config.retryable_kinds.contains(&err.kind)
                    || self.retryable_exceptions.contains(&err.message)
            }
            None => false,
        }
    }

    fn route(
        &self,
        base_topic: &str,
        retry_count: u32,
        error: Option<&ProcessingError>,
    ) -> (FailureAction, String, u32) {
        let delay = self.config.retry_delays.get(retry_count as usize);

        match delay {
            Some(&delay) if self.is_retryable(error) => (
                FailureAction::Retry,
                render_topic(&self.config.retry_topic_template, base_topic, Some(delay)),
                retry_count + 1,
            ),
            _ => (
                FailureAction::DeadLetter,
                render_topic(&self.config.dlt_topic_template, base_topic, None),
                retry_count,
            ),
        }
    }

    fn prepare_message(
        &self,
        original: &BrokerMessage,
        error: Option<&ProcessingError>,
        retry_count: u32,
        base_topic: &str,
        target_topic: &str,
    ) -> BrokerMessage {
        let mut headers: Headers = original
            .headers
            .iter()
            .filter(|(name, _)| *name != HEADER_RETRY_COUNT)
            .collect();

        headers.set(HEADER_RETRY_COUNT, retry_count.to_string());
        headers.set(HEADER_ORIGINAL_TOPIC, base_topic);
        if !headers.contains(HEADER_ORIGINAL_PARTITION) {
            headers.set(HEADER_ORIGINAL_PARTITION, original.partition.to_string());
        }
        if !headers.contains(HEADER_ORIGINAL_OFFSET) {
            headers.set(HEADER_ORIGINAL_OFFSET, original.offset.to_string());
        }

        if let Some(err) = error {
            headers.set(HEADER_EXCEPTION_FQCN, err.type_name.as_str());
            headers.set(HEADER_EXCEPTION_MESSAGE, err.message.as_str());
            headers.set(HEADER_EXCEPTION_KIND, err.kind.as_ref());
            headers.set(
                HEADER_EXCEPTION_STACKTRACE,
                err.backtrace.as_deref().unwrap_or(STACKTRACE_UNAVAILABLE),
            );
        }

        inject_trace_context(&mut headers);

        BrokerMessage {
            topic: target_topic.to_string(),
            partition: 0,
            offset: 0,
            key: original.key.clone(),
            headers,
            payload: original.payload.clone(),
        }
    }

    async fn publish(&self, message: &BrokerMessage) -> MessagingResult<String> {
        let writer = self.writer(&message.topic).await?;
        writer.write(message).await
    }

    /// Cached writer for `topic`, created on first use.
    ///
    /// The cache lock is held across creation so concurrent first use builds
    /// exactly one writer.
    async fn writer(&self, topic: &str) -> MessagingResult<Arc<dyn TopicWriter>> {
        let mut writers = self.writers.lock().await;
        if let Some(writer) = writers.get(topic) {
            return Ok(writer.clone());
        }

        let writer = self.factory.create_writer(topic)?;
        writers.insert(topic.to_string(), writer.clone());
        Ok(writer)
    }

    pub async fn cached_writers(&self) -> usize {
        self.writers.lock().await.len()
    }
}

/// Single-pass placeholder substitution; replacement text is never rescanned.
fn render_topic(template: &str, topic: &str, delay_secs: Option<u64>) -> String {
    let delay = delay_secs.map(|d| d.to_string());
    let mut rendered = String::with_capacity(template.len() + topic.len());
    let mut rest = template;

    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix(TOPIC_PLACEHOLDER) {
            rendered.push_str(topic);
            rest = tail;
            continue;
        }
        if let (Some(delay), Some(tail)) = (&delay, rest.strip_prefix(DELAY_PLACEHOLDER)) {
            rendered.push_str(delay);
            rest = tail;
            continue;
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            rendered.push(c);
        }
        rest = chars.as_str();
    }

    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, MessagingError};
    use crate::publisher::{MockTopicWriter, MockWriterFactory};
    use std::sync::Mutex as StdMutex;

    type Sent = Arc<StdMutex<Vec<BrokerMessage>>>;

    fn recording_factory(creates: usize) -> (MockWriterFactory, Sent) {
        let sent: Sent = Arc::new(StdMutex::new(Vec::new()));
        let mut factory = MockWriterFactory::new();
        let sink = sent.clone();
        factory
            .expect_create_writer()
            .times(creates)
            .returning(move |_| {
                let sink = sink.clone();
                let mut writer = MockTopicWriter::new();
                writer.expect_write().returning(move |message| {
                    sink.lock().unwrap().push(message.clone());
                    Ok("1-0".to_string())
                });
                Ok(Arc::new(writer) as Arc<dyn TopicWriter>)
            });
        (factory, sent)
    }

    fn enabled() -> ResilienceConfig {
        ResilienceConfig::default().with_enabled(true)
    }

    fn failed_message(retry_count: Option<u32>) -> BrokerMessage {
        let mut message = BrokerMessage::new("orders", "order-1", r#"{"id":1}"#).at(2, 41);
        if let Some(count) = retry_count {
            message.headers.set(HEADER_RETRY_COUNT, count.to_string());
        }
        message
    }

    #[tokio::test]
    async fn test_disabled_is_noop() {
        let mut factory = MockWriterFactory::new();
        factory.expect_create_writer().never();
        let handler = FailureHandler::new(ResilienceConfig::default(), Arc::new(factory));

        let err = ProcessingError::transient("boom");
        assert!(handler.handle(&failed_message(None), Some(&err)).await.is_none());
    }

    #[tokio::test]
    async fn test_retryable_below_budget_goes_to_retry_topic() {
        let (factory, sent) = recording_factory(1);
        let handler = FailureHandler::new(enabled(), Arc::new(factory));

        let err = ProcessingError::transient("inventory service unavailable");
        let outcome = handler
            .handle(&failed_message(Some(2)), Some(&err))
            .await
            .unwrap();

        assert_eq!(outcome.action, FailureAction::Retry);
        assert_eq!(outcome.target_topic, "orders-retry-120s");
        assert_eq!(outcome.retry_count, 3);
        assert!(outcome.delivered);

        let sent = sent.lock().unwrap();
        let routed = &sent[0];
        assert_eq!(routed.topic, "orders-retry-120s");
        assert_eq!(routed.headers.get(HEADER_RETRY_COUNT), Some("3"));
        assert_eq!(routed.headers.get(HEADER_ORIGINAL_TOPIC), Some("orders"));
        assert_eq!(routed.headers.get(HEADER_ORIGINAL_PARTITION), Some("2"));
        assert_eq!(routed.headers.get(HEADER_ORIGINAL_OFFSET), Some("41"));
        assert_eq!(
            routed.headers.get(HEADER_EXCEPTION_MESSAGE),
            Some("inventory service unavailable")
        );
        assert_eq!(routed.headers.get(HEADER_EXCEPTION_KIND), Some("transient"));
        assert_eq!(routed.key, b"order-1".to_vec());
        assert_eq!(routed.payload, br#"{"id":1}"#.to_vec());
    }

    #[tokio::test]
    async fn test_exhausted_budget_goes_to_dlt() {
        let (factory, sent) = recording_factory(1);
        let handler = FailureHandler::new(enabled(), Arc::new(factory));

        let err = ProcessingError::transient("inventory service unavailable");
        let outcome = handler
            .handle(&failed_message(Some(3)), Some(&err))
            .await
            .unwrap();

        assert_eq!(outcome.action, FailureAction::DeadLetter);
        assert_eq!(outcome.target_topic, "orders-dlt");
        assert_eq!(outcome.retry_count, 3);
        assert_eq!(sent.lock().unwrap()[0].headers.get(HEADER_RETRY_COUNT), Some("3"));
    }

    #[tokio::test]
    async fn test_non_retryable_goes_straight_to_dlt() {
        let (factory, sent) = recording_factory(1);
        let handler = FailureHandler::new(enabled(), Arc::new(factory));

        let err = ProcessingError::validation("missing order id").with_backtrace("frame 0");
        let outcome = handler
            .handle(&failed_message(None), Some(&err))
            .await
            .unwrap();

        assert_eq!(outcome.action, FailureAction::DeadLetter);
        assert_eq!(outcome.target_topic, "orders-dlt");
        assert_eq!(outcome.retry_count, 0);

        let sent = sent.lock().unwrap();
        assert_eq!(sent[0].headers.get(HEADER_RETRY_COUNT), Some("0"));
        assert_eq!(sent[0].headers.get(HEADER_EXCEPTION_STACKTRACE), Some("frame 0"));
        assert!(
            sent[0]
                .headers
                .get(HEADER_EXCEPTION_FQCN)
                .unwrap()
                .ends_with("ProcessingError")
        );
    }

    #[tokio::test]
    async fn test_missing_error_goes_to_dlt_without_exception_headers() {
        let (factory, sent) = recording_factory(1);
        let handler = FailureHandler::new(enabled(), Arc::new(factory));

        let outcome = handler.handle(&failed_message(None), None).await.unwrap();

        assert_eq!(outcome.action, FailureAction::DeadLetter);
        let sent = sent.lock().unwrap();
        assert!(!sent[0].headers.contains(HEADER_EXCEPTION_MESSAGE));
        assert!(!sent[0].headers.contains(HEADER_EXCEPTION_STACKTRACE));
    }

    #[tokio::test]
    async fn test_exact_message_match_is_retryable() {
        let (factory, _sent) = recording_factory(2);
        let config = enabled()
            .with_retryable_kinds(vec![])
            .with_retryable_exceptions(["connection reset by peer"]);
        let handler = FailureHandler::new(config, Arc::new(factory));

        let matching = ProcessingError::new(ErrorKind::Unknown, "connection reset by peer");
        let outcome = handler
            .handle(&failed_message(None), Some(&matching))
            .await
            .unwrap();
        assert_eq!(outcome.target_topic, "orders-retry-5s");

        let different = ProcessingError::new(ErrorKind::Unknown, "connection reset by peer!");
        let outcome = handler
            .handle(&failed_message(None), Some(&different))
            .await
            .unwrap();
        assert_eq!(outcome.target_topic, "orders-dlt");
    }

    #[tokio::test]
    async fn test_lineage_survives_second_hop() {
        let (factory, sent) = recording_factory(1);
        let handler = FailureHandler::new(enabled(), Arc::new(factory));

        let mut second_hop = BrokerMessage::new("orders-retry-5s", "order-1", "{}").at(0, 7);
        second_hop.headers.set(HEADER_RETRY_COUNT, "1");
        second_hop.headers.set(HEADER_ORIGINAL_TOPIC, "orders");
        second_hop.headers.set(HEADER_ORIGINAL_PARTITION, "2");
        second_hop.headers.set(HEADER_ORIGINAL_OFFSET, "41");

        let err = ProcessingError::timeout("payment gateway timed out");
        let outcome = handler.handle(&second_hop, Some(&err)).await.unwrap();

        assert_eq!(outcome.target_topic, "orders-retry-30s");
        let sent = sent.lock().unwrap();
        assert_eq!(sent[0].headers.get(HEADER_ORIGINAL_TOPIC), Some("orders"));
        assert_eq!(sent[0].headers.get(HEADER_ORIGINAL_PARTITION), Some("2"));
        assert_eq!(sent[0].headers.get(HEADER_ORIGINAL_OFFSET), Some("41"));
        assert_eq!(sent[0].headers.get(HEADER_RETRY_COUNT), Some("2"));
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported_not_retried() {
        let mut factory = MockWriterFactory::new();
        factory.expect_create_writer().times(1).returning(|_| {
            let mut writer = MockTopicWriter::new();
            writer
                .expect_write()
                .times(1)
                .returning(|_| Err(MessagingError::publish("orders-retry-5s", "broker down")));
            Ok(Arc::new(writer) as Arc<dyn TopicWriter>)
        });
        let handler = FailureHandler::new(enabled(), Arc::new(factory));

        let err = ProcessingError::transient("boom");
        let outcome = handler
            .handle(&failed_message(None), Some(&err))
            .await
            .unwrap();

        assert_eq!(outcome.action, FailureAction::Retry);
        assert!(!outcome.delivered);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_writer_created_once_under_concurrent_use() {
        let (factory, sent) = recording_factory(1);
        let handler = Arc::new(FailureHandler::new(enabled(), Arc::new(factory)));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let handler = handler.clone();
            handles.push(tokio::spawn(async move {
                let err = ProcessingError::transient("boom");
                handler.handle(&failed_message(None), Some(&err)).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().delivered);
        }

        assert_eq!(handler.cached_writers().await, 1);
        assert_eq!(sent.lock().unwrap().len(), 16);
    }

    #[test]
    fn test_render_topic() {
        assert_eq!(
            render_topic("{topic}-retry-{delaySec}s", "orders", Some(30)),
            "orders-retry-30s"
        );
        assert_eq!(render_topic("{topic}-dlt", "orders", None), "orders-dlt");
        assert_eq!(
            render_topic("{topic}.{delaySec}", "orders", None),
            "orders.{delaySec}"
        );
    }

    #[test]
    fn test_render_topic_does_not_rescan_replacements() {
        assert_eq!(
            render_topic("{topic}-retry-{delaySec}s", "odd{delaySec}", Some(5)),
            "odd{delaySec}-retry-5s"
        );
    }
}
