//! Broker message and header carrier
//!
//! `Headers` keeps insertion order and allows one value per key. It is also
//! the OpenTelemetry text-map carrier used by [`crate::propagation`].

use opentelemetry::propagation::{Extractor, Injector};
use serde::{Deserialize, Serialize};

pub const HEADER_ORIGINAL_TOPIC: &str = "dlt-original-topic";
pub const HEADER_ORIGINAL_PARTITION: &str = "dlt-original-partition";
pub const HEADER_ORIGINAL_OFFSET: &str = "dlt-original-offset";
pub const HEADER_EXCEPTION_FQCN: &str = "dlt-exception-fqcn";
pub const HEADER_EXCEPTION_MESSAGE: &str = "dlt-exception-message";
pub const HEADER_EXCEPTION_STACKTRACE: &str = "dlt-exception-stacktrace";
pub const HEADER_EXCEPTION_KIND: &str = "dlt-exception-kind";
pub const HEADER_RETRY_COUNT: &str = "retry-count";

/// Ordered message headers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set a header, replacing any existing value in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(idx).1)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> Vec<&str> {
        self.0.iter().map(|(k, _)| k.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Retry count carried by the message; absent or unparsable counts as zero.
    pub fn retry_count(&self) -> u32 {
        self.get(HEADER_RETRY_COUNT)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.set(k, v);
        }
        headers
    }
}

impl Injector for Headers {
    fn set(&mut self, key: &str, value: String) {
        Headers::set(self, key, value);
    }
}

impl Extractor for Headers {
    fn get(&self, key: &str) -> Option<&str> {
        Headers::get(self, key)
    }

    fn keys(&self) -> Vec<&str> {
        Headers::keys(self)
    }
}

/// A message as seen by producers and consumers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Vec<u8>,
    pub headers: Headers,
    pub payload: Vec<u8>,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, key: impl Into<Vec<u8>>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Broker coordinates of an already-delivered message
    pub fn at(mut self, partition: i32, offset: i64) -> Self {
        self.partition = partition;
        self.offset = offset;
        self
    }

    pub fn key_str(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_replaces_in_place() {
        let mut headers: Headers = [("a", "1"), ("b", "2")].into_iter().collect();
        headers.set("a", "3");

        assert_eq!(headers.keys(), vec!["a", "b"]);
        assert_eq!(headers.get("a"), Some("3"));
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_remove() {
        let mut headers: Headers = [("a", "1")].into_iter().collect();
        assert_eq!(headers.remove("a").as_deref(), Some("1"));
        assert!(headers.remove("a").is_none());
        assert!(headers.is_empty());
    }

    #[test]
    fn test_retry_count_defaults_to_zero() {
        let mut headers = Headers::new();
        assert_eq!(headers.retry_count(), 0);

        headers.set(HEADER_RETRY_COUNT, "not-a-number");
        assert_eq!(headers.retry_count(), 0);

        headers.set(HEADER_RETRY_COUNT, "2");
        assert_eq!(headers.retry_count(), 2);
    }
}
