//! Messaging error types and failure classification
//!
//! `MessagingError` covers broker and encoding failures inside this crate.
//! `ProcessingError` is what a message handler returns; its `ErrorKind` is
//! what the failure handler classifies on.

use serde::{Deserialize, Serialize};
use std::backtrace::{Backtrace, BacktraceStatus};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use thiserror::Error;

/// Broker, encoding and configuration errors
#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Publishing to a topic failed for a reason other than transport
    #[error("Publish to '{topic}' failed: {message}")]
    Publish { topic: String, message: String },
}

impl MessagingError {
    pub fn publish(topic: impl Into<String>, message: impl Into<String>) -> Self {
        MessagingError::Publish {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Connection-level Redis failures worth backing off on
    pub fn is_connection_error(&self) -> bool {
        match self {
            MessagingError::Redis(e) => {
                e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error()
            }
            _ => false,
        }
    }

    pub fn is_nogroup_error(&self) -> bool {
        matches!(self, MessagingError::Redis(e) if e.to_string().contains("NOGROUP"))
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        MessagingError::Serialization(err.to_string())
    }
}

impl From<serde_yaml_ng::Error> for MessagingError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        MessagingError::Config(err.to_string())
    }
}

impl From<core_config::ConfigError> for MessagingError {
    fn from(err: core_config::ConfigError) -> Self {
        MessagingError::Config(err.to_string())
    }
}

pub type MessagingResult<T> = Result<T, MessagingError>;

/// Structured classification of a processing failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Temporary failure (network blip, lock contention)
    Transient,
    Timeout,
    /// Downstream dependency is down
    Unavailable,
    RateLimited,
    /// The message itself is malformed
    Validation,
    /// Unrecoverable for this message
    Permanent,
    Unknown,
}

/// Error returned by a message handler
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct ProcessingError {
    pub kind: ErrorKind,
    /// Name of the underlying error type, recorded in the DLT headers
    pub type_name: String,
    pub message: String,
    pub backtrace: Option<String>,
}

impl ProcessingError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            type_name: std::any::type_name::<Self>().to_string(),
            message: message.into(),
            backtrace: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    /// Wrap any error, keeping its type name and display text.
    pub fn from_error<E>(kind: ErrorKind, err: &E) -> Self
    where
        E: std::error::Error,
    {
        Self {
            kind,
            type_name: std::any::type_name::<E>().to_string(),
            message: err.to_string(),
            backtrace: None,
        }
    }

    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = type_name.into();
        self
    }

    pub fn with_backtrace(mut self, backtrace: impl Into<String>) -> Self {
        self.backtrace = Some(backtrace.into());
        self
    }

    /// Capture a backtrace at the call site when `RUST_BACKTRACE` allows it.
    pub fn capture_backtrace(mut self) -> Self {
        let backtrace = Backtrace::capture();
        if backtrace.status() == BacktraceStatus::Captured {
            self.backtrace = Some(backtrace.to_string());
        }
        self
    }
}

impl From<MessagingError> for ProcessingError {
    fn from(err: MessagingError) -> Self {
        let kind = match &err {
            MessagingError::Redis(_) => ErrorKind::Unavailable,
            MessagingError::Serialization(_) => ErrorKind::Validation,
            MessagingError::Config(_) => ErrorKind::Permanent,
            MessagingError::Publish { .. } => ErrorKind::Transient,
        };
        ProcessingError::from_error(kind, &err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_error_kind_parses_case_insensitively() {
        assert_eq!(ErrorKind::from_str("rate_limited").unwrap(), ErrorKind::RateLimited);
        assert_eq!(ErrorKind::from_str("TIMEOUT").unwrap(), ErrorKind::Timeout);
        assert!(ErrorKind::from_str("flaky").is_err());
        assert_eq!(ErrorKind::Unavailable.to_string(), "unavailable");
    }

    #[test]
    fn test_from_error_keeps_type_name() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream timed out");
        let err = ProcessingError::from_error(ErrorKind::Timeout, &io);

        assert!(err.type_name.starts_with("std::io"));
        assert_eq!(err.message, "upstream timed out");
        assert_eq!(err.to_string(), "upstream timed out");
    }

    #[test]
    fn test_messaging_error_classification() {
        let err: ProcessingError = MessagingError::Serialization("bad json".into()).into();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(err.type_name.ends_with("MessagingError"));
    }
}
