//! Broker messaging with retry and dead-letter routing
//!
//! - [`BrokerMessage`] and [`Headers`], the header map doubling as the
//!   trace-context carrier ([`propagation`])
//! - [`MessagePublisher`], [`TopicWriter`] and [`WriterFactory`] seams with
//!   Redis Streams implementations
//! - [`FailureHandler`], which republishes failed messages to a delayed retry
//!   topic or to the dead-letter topic while preserving first-hop lineage
//! - [`MessageWorker`], a consumer-group loop that drives the failure handler
//!
//! # Example
//!
//! ```rust,ignore
//! use messaging::{
//!     ConsumerConfig, FailureHandler, MessageWorker, RedisStreamPublisher,
//!     RedisWriterFactory, ResilienceConfig, StreamConsumer,
//! };
//!
//! let publisher = RedisStreamPublisher::from_arc(redis.clone());
//! let failures = Arc::new(FailureHandler::new(
//!     ResilienceConfig::default().with_enabled(true),
//!     Arc::new(RedisWriterFactory::new(publisher)),
//! ));
//!
//! let consumer = StreamConsumer::new(redis, ConsumerConfig::new("orders", "billing"));
//! let worker = MessageWorker::new(consumer, Arc::new(BillingHandler), failures);
//! worker.run(shutdown_rx).await?;
//! ```

pub mod config;
pub mod consumer;
pub mod error;
pub mod failure;
pub mod message;
pub mod metrics;
pub mod propagation;
pub mod publisher;
pub mod worker;

pub use config::{ConsumerConfig, ResilienceConfig, ResilienceSettings};
pub use consumer::{Delivery, StreamConsumer};
pub use error::{ErrorKind, MessagingError, MessagingResult, ProcessingError};
pub use failure::{FailureAction, FailureHandler, FailureOutcome};
pub use message::{BrokerMessage, Headers};
pub use metrics::{ConsumerMetrics, init_metrics, render_metrics};
pub use propagation::{extract_trace_context, inject_trace_context, set_parent_from_headers};
pub use publisher::{
    MessagePublisher, RedisStreamPublisher, RedisStreamWriter, RedisWriterFactory, TopicWriter,
    WriterFactory,
};
pub use worker::{MessageHandler, MessageWorker};
