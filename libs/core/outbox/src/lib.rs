//! Transactional outbox
//!
//! Producers call [`OutboxService::send_in_tx`] on the same database
//! transaction as their business write. An [`OutboxForwarder`] later picks up
//! stale PENDING records and publishes them through a
//! [`messaging::MessagePublisher`]. Delivery is at-least-once: a crash between
//! publish and status update, or two forwarders racing, can publish a record
//! twice.
//!
//! ```rust,ignore
//! let store = Arc::new(PgOutboxStore::new(db.clone()).with_stale_after(config.stale_after));
//! let service = Arc::new(OutboxService::new(store, publisher, config));
//!
//! let tx = db.begin().await?;
//! orders::insert(&tx, &order).await?;
//! service.send_in_tx(&tx, "orders", &order.id.to_string(), payload).await?;
//! tx.commit().await?;
//!
//! OutboxForwarder::new(service).run(shutdown_rx).await;
//! ```

pub mod config;
pub mod entity;
pub mod error;
pub mod forwarder;
mod metrics;
pub mod models;
pub mod postgres;
pub mod service;
pub mod store;

pub use config::OutboxConfig;
pub use error::{OutboxError, OutboxResult};
pub use forwarder::OutboxForwarder;
pub use models::{ForwardReport, NewOutboxMessage, OutboxMessage, OutboxStatus};
pub use postgres::PgOutboxStore;
pub use service::OutboxService;
pub use store::OutboxStore;
