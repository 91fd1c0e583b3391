//! Resilience and consumer configuration
//!
//! `ResilienceConfig` can come from the environment (`RESILIENCE_*`) or, per
//! consumer, from a YAML document:
//!
//! ```yaml
//! resilience:
//!   consumers:
//!     order-events:
//!       enabled: true
//!       retryDelays: [5, 30, 120]
//!       retryTopicTemplate: "{topic}-retry-{delaySec}s"
//!       dltTopicTemplate: "{topic}-dlt"
//!       retryableExceptions: ["inventory service unavailable"]
//!       retryableKinds: [transient, timeout]
//! ```

use crate::error::{ErrorKind, MessagingError, MessagingResult};
use core_config::{
    ConfigError, FromEnv, env_bool, env_list, env_or_default, env_parse, env_parse_list,
    env_required,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub const TOPIC_PLACEHOLDER: &str = "{topic}";
pub const DELAY_PLACEHOLDER: &str = "{delaySec}";
pub const DEFAULT_RETRY_TOPIC_TEMPLATE: &str = "{topic}-retry-{delaySec}s";
pub const DEFAULT_DLT_TOPIC_TEMPLATE: &str = "{topic}-dlt";

/// Retry and dead-letter routing policy for one consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResilienceConfig {
    pub enabled: bool,
    /// Delay in seconds per attempt; the length is the retry budget
    pub retry_delays: Vec<u64>,
    pub retry_topic_template: String,
    pub dlt_topic_template: String,
    /// Error messages retried on exact match
    pub retryable_exceptions: Vec<String>,
    pub retryable_kinds: Vec<ErrorKind>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            retry_delays: vec![5, 30, 120],
            retry_topic_template: DEFAULT_RETRY_TOPIC_TEMPLATE.to_string(),
            dlt_topic_template: DEFAULT_DLT_TOPIC_TEMPLATE.to_string(),
            retryable_exceptions: Vec::new(),
            retryable_kinds: vec![
                ErrorKind::Transient,
                ErrorKind::Timeout,
                ErrorKind::Unavailable,
                ErrorKind::RateLimited,
            ],
        }
    }
}

impl ResilienceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_retry_delays(mut self, delays: Vec<u64>) -> Self {
        self.retry_delays = delays;
        self
    }

    pub fn with_retry_topic_template(mut self, template: impl Into<String>) -> Self {
        self.retry_topic_template = template.into();
        self
    }

    pub fn with_dlt_topic_template(mut self, template: impl Into<String>) -> Self {
        self.dlt_topic_template = template.into();
        self
    }

    pub fn with_retryable_exceptions<I, S>(mut self, messages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_exceptions = messages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retryable_kinds(mut self, kinds: Vec<ErrorKind>) -> Self {
        self.retryable_kinds = kinds;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.retry_delays.len() as u32
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.retry_topic_template.contains(TOPIC_PLACEHOLDER) {
            return Err(ConfigError::Invalid(format!(
                "retry topic template '{}' must contain {}",
                self.retry_topic_template, TOPIC_PLACEHOLDER
            )));
        }
        if !self.dlt_topic_template.contains(TOPIC_PLACEHOLDER) {
            return Err(ConfigError::Invalid(format!(
                "dead-letter topic template '{}' must contain {}",
                self.dlt_topic_template, TOPIC_PLACEHOLDER
            )));
        }
        Ok(())
    }
}

impl FromEnv for ResilienceConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            enabled: env_bool("RESILIENCE_ENABLED", defaults.enabled)?,
            retry_delays: env_parse_list("RESILIENCE_RETRY_DELAYS")?
                .unwrap_or(defaults.retry_delays),
            retry_topic_template: env_or_default(
                "RESILIENCE_RETRY_TOPIC_TEMPLATE",
                DEFAULT_RETRY_TOPIC_TEMPLATE,
            ),
            dlt_topic_template: env_or_default(
                "RESILIENCE_DLT_TOPIC_TEMPLATE",
                DEFAULT_DLT_TOPIC_TEMPLATE,
            ),
            retryable_exceptions: env_list("RESILIENCE_RETRYABLE_EXCEPTIONS")
                .unwrap_or(defaults.retryable_exceptions),
            retryable_kinds: env_parse_list("RESILIENCE_RETRYABLE_KINDS")?
                .unwrap_or(defaults.retryable_kinds),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Per-consumer resilience policies
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    pub consumers: HashMap<String, ResilienceConfig>,
}

#[derive(Deserialize)]
struct SettingsDocument {
    #[serde(default)]
    resilience: ResilienceSettings,
}

impl ResilienceSettings {
    /// Parse the `resilience` section of a YAML document.
    pub fn from_yaml_str(yaml: &str) -> MessagingResult<Self> {
        let document: SettingsDocument = serde_yaml_ng::from_str(yaml)?;
        for (name, config) in &document.resilience.consumers {
            config
                .validate()
                .map_err(|e| MessagingError::Config(format!("consumer '{}': {}", name, e)))?;
        }
        Ok(document.resilience)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> MessagingResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            MessagingError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Policy for `consumer`, or the disabled default when none is configured
    pub fn consumer(&self, consumer: &str) -> ResilienceConfig {
        self.consumers.get(consumer).cloned().unwrap_or_default()
    }
}

/// Where a consumer reads from
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Stream (topic) to consume
    pub topic: String,
    pub group: String,
    pub consumer_id: String,
    pub batch_size: usize,
    /// XREADGROUP BLOCK in milliseconds; `None` polls without blocking
    pub block_ms: Option<u64>,
    pub poll_interval_ms: u64,
}

impl ConsumerConfig {
    pub fn new(topic: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            consumer_id: format!("consumer-{}", uuid::Uuid::new_v4().simple()),
            batch_size: 10,
            block_ms: Some(5_000),
            poll_interval_ms: 100,
        }
    }

    pub fn with_consumer_id(mut self, consumer_id: impl Into<String>) -> Self {
        self.consumer_id = consumer_id.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_block_ms(mut self, block_ms: Option<u64>) -> Self {
        self.block_ms = block_ms;
        self
    }
}

impl FromEnv for ConsumerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new(
            env_required("CONSUMER_TOPIC")?,
            env_required("CONSUMER_GROUP")?,
        );
        if let Ok(id) = env_required("CONSUMER_ID") {
            config.consumer_id = id;
        }
        config.batch_size = env_parse("CONSUMER_BATCH_SIZE", config.batch_size)?;
        config.block_ms = match env_parse::<u64>("CONSUMER_BLOCK_MS", 5_000)? {
            0 => None,
            ms => Some(ms),
        };
        config.poll_interval_ms = env_parse("CONSUMER_POLL_INTERVAL_MS", config.poll_interval_ms)?;
        Ok(config)
    }
}
