//! Coordination and lock error types
//!
//! Transport failures (`CoordinationError::Unavailable`) are kept distinct
//! from an elapsed wait bound (`LockError::Timeout`) so callers can decide
//! whether re-attempting makes sense.

use std::time::Duration;
use thiserror::Error;

/// Errors returned by a coordination backend
#[derive(Error, Debug)]
pub enum CoordinationError {
    /// Backend unreachable or returned a transport error
    #[error("Coordination service unavailable: {0}")]
    Unavailable(String),

    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    /// The session owning ephemeral nodes is gone
    #[error("Coordination session expired")]
    SessionExpired,

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

impl From<etcd_client::Error> for CoordinationError {
    fn from(err: etcd_client::Error) -> Self {
        CoordinationError::Unavailable(err.to_string())
    }
}

pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Errors returned by [`crate::DistributedLock`]
#[derive(Error, Debug)]
pub enum LockError {
    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    /// The wait bound elapsed while a predecessor still held the lock
    #[error("Timed out after {waited:?} waiting for lock on '{resource}'")]
    Timeout { resource: String, waited: Duration },

    #[error("Lock acquisition on '{0}' was cancelled")]
    Cancelled(String),

    #[error("No lock held on '{0}'")]
    NotHeld(String),

    #[error("Lock on '{0}' is already held by this handle")]
    AlreadyHeld(String),

    /// Our own node disappeared while waiting, usually because the session expired
    #[error("Lock node '{0}' vanished while waiting")]
    NodeVanished(String),
}

impl LockError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, LockError::Timeout { .. })
    }

    /// Whether the failure came from the coordination backend itself
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            LockError::Coordination(CoordinationError::Unavailable(_))
        )
    }
}

pub type LockResult<T> = Result<T, LockError>;
