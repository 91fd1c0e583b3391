//! Distributed coordination primitives
//!
//! Provides [`DistributedLock`], a fair FIFO lock built on ephemeral
//! sequential nodes, and the [`Coordinator`] seam it runs on. Two backends
//! ship with the crate:
//!
//! - [`EtcdCoordinator`]: lease-backed sessions against an etcd cluster
//! - [`MemoryEnsemble`]: in-process state for tests and single-node setups
//!
//! # Example
//!
//! ```rust,ignore
//! use coordination::{CoordinationConfig, DistributedLock, EtcdCoordinator};
//! use core_config::FromEnv;
//! use std::sync::Arc;
//!
//! let config = CoordinationConfig::from_env()?;
//! let coordinator = Arc::new(EtcdCoordinator::connect(&config).await?);
//!
//! let mut lock = DistributedLock::with_options(coordinator, "sku-42", config.lock_options()).await?;
//! lock.lock().await?;
//! // critical section
//! lock.unlock().await?;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod etcd;
pub mod lock;
pub mod memory;

pub use client::{ChildNode, Coordinator, NodeWatch, SequentialNode, SessionState, WatchEvent};
pub use config::CoordinationConfig;
pub use error::{CoordinationError, CoordinationResult, LockError, LockResult};
pub use etcd::EtcdCoordinator;
pub use lock::{DistributedLock, LockOptions, LockState};
pub use memory::{MemoryEnsemble, MemorySession};
