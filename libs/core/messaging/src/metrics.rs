//! Prometheus metrics for consumers and failure routing

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<&'static PrometheusHandle, BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok(handle)
    })
}

pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Labelled metric helpers for one consumed topic
#[derive(Clone)]
pub struct ConsumerMetrics {
    topic: String,
    group: String,
}

impl ConsumerMetrics {
    pub fn new(topic: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
        }
    }

    pub fn message_received(&self) {
        counter!(
            "consumer_messages_received_total",
            "topic" => self.topic.clone(),
            "group" => self.group.clone()
        )
        .increment(1);
    }

    pub fn message_processed(&self, duration: Duration) {
        counter!(
            "consumer_messages_processed_total",
            "topic" => self.topic.clone(),
            "group" => self.group.clone(),
            "status" => "success"
        )
        .increment(1);

        histogram!(
            "consumer_message_duration_seconds",
            "topic" => self.topic.clone(),
            "group" => self.group.clone()
        )
        .record(duration.as_secs_f64());
    }

    pub fn message_failed(&self, kind: &str) {
        counter!(
            "consumer_messages_processed_total",
            "topic" => self.topic.clone(),
            "group" => self.group.clone(),
            "status" => "failed"
        )
        .increment(1);

        counter!(
            "consumer_message_errors_total",
            "topic" => self.topic.clone(),
            "group" => self.group.clone(),
            "kind" => kind.to_string()
        )
        .increment(1);
    }
}

pub(crate) fn failure_routed(action: &str, base_topic: &str) {
    counter!(
        "resilience_failures_routed_total",
        "action" => action.to_string(),
        "topic" => base_topic.to_string()
    )
    .increment(1);
}

pub(crate) fn failure_publish_failed(target_topic: &str) {
    counter!(
        "resilience_publish_failures_total",
        "topic" => target_topic.to_string()
    )
    .increment(1);
}
