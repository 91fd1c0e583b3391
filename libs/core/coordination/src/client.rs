//! The coordination-service seam used by the lock
//!
//! Paths are slash-separated and absolute (`/distributed_locks/sku-42`).
//! Backends provide ephemeral sequential nodes whose sequence number is
//! assigned by the service, plus a one-shot existence watch.

use crate::error::{CoordinationError, CoordinationResult};
use async_trait::async_trait;
use std::fmt;
use tokio::sync::oneshot;

/// A node created by [`Coordinator::create_ephemeral_sequential`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequentialNode {
    /// Full path of the node
    pub path: String,
    /// Last path segment
    pub name: String,
    /// Service-assigned, monotonically increasing under the same parent
    pub sequence: u64,
}

/// A direct child returned by [`Coordinator::children`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildNode {
    pub name: String,
    pub sequence: u64,
}

/// Why a one-shot watch fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    Deleted,
    /// The watch stream ended without observing a delete
    SessionLost,
}

/// Receiving half of a one-shot existence watch
pub type NodeWatch = oneshot::Receiver<WatchEvent>;

/// Liveness of the session that owns our ephemeral nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Disconnected,
    Expired,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connected => write!(f, "connected"),
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Expired => write!(f, "expired"),
        }
    }
}

/// Coordination-service primitives
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Create a persistent node. Fails with `NodeExists` if it is already there.
    async fn create(&self, path: &str) -> CoordinationResult<()>;

    /// Create an ephemeral node named `{prefix}…` under `parent`, tied to this session.
    async fn create_ephemeral_sequential(
        &self,
        parent: &str,
        prefix: &str,
    ) -> CoordinationResult<SequentialNode>;

    /// List the direct children of `path`.
    async fn children(&self, path: &str) -> CoordinationResult<Vec<ChildNode>>;

    /// Install a one-shot watch that fires when `path` is deleted.
    ///
    /// Returns `None` when the node does not exist at the time of the call.
    async fn exists_watch(&self, path: &str) -> CoordinationResult<Option<NodeWatch>>;

    /// Delete a node. Fails with `NoNode` if it is already gone.
    async fn delete(&self, path: &str) -> CoordinationResult<()>;

    fn session_state(&self) -> SessionState;
}

/// Join a parent path and a child name
pub fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), name)
    }
}

/// Reject relative paths, trailing slashes and empty segments
pub fn validate_path(path: &str) -> CoordinationResult<()> {
    if path == "/" {
        return Ok(());
    }

    let valid = path.starts_with('/')
        && !path.ends_with('/')
        && path[1..].split('/').all(|segment| !segment.is_empty());

    if valid {
        Ok(())
    } else {
        Err(CoordinationError::InvalidPath(path.to_string()))
    }
}

/// Every ancestor of `path` including itself, shortest first
///
/// `/a/b/c` yields `/a`, `/a/b`, `/a/b/c`.
pub fn path_prefixes(path: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        prefixes.push(current.clone());
    }
    prefixes
}

/// Create `path` and any missing ancestors.
///
/// `NodeExists` on any segment counts as success, so two callers racing to
/// create the same segment both succeed.
pub async fn ensure_path<C>(coordinator: &C, path: &str) -> CoordinationResult<()>
where
    C: Coordinator + ?Sized,
{
    validate_path(path)?;

    for prefix in path_prefixes(path) {
        match coordinator.create(&prefix).await {
            Ok(()) | Err(CoordinationError::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/", "locks"), "/locks");
        assert_eq!(join_path("/locks", "sku-1"), "/locks/sku-1");
        assert_eq!(join_path("/locks/", "sku-1"), "/locks/sku-1");
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/distributed_locks/sku-1").is_ok());
        assert!(validate_path("relative").is_err());
        assert!(validate_path("/trailing/").is_err());
        assert!(validate_path("/double//slash").is_err());
    }

    #[test]
    fn test_path_prefixes() {
        assert_eq!(
            path_prefixes("/distributed_locks/orders/42"),
            vec![
                "/distributed_locks".to_string(),
                "/distributed_locks/orders".to_string(),
                "/distributed_locks/orders/42".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_ensure_path_tolerates_existing_segments() {
        let mut mock = MockCoordinator::new();
        mock.expect_create()
            .withf(|path| path.ends_with("/distributed_locks"))
            .times(1)
            .returning(|path| Err(CoordinationError::NodeExists(path.to_string())));
        mock.expect_create()
            .withf(|path| path.ends_with("/sku-1"))
            .times(1)
            .returning(|_| Ok(()));

        ensure_path(&mock, "/distributed_locks/sku-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_path_propagates_transport_errors() {
        let mut mock = MockCoordinator::new();
        mock.expect_create()
            .returning(|_| Err(CoordinationError::Unavailable("connection refused".into())));

        let err = ensure_path(&mock, "/distributed_locks/sku-1")
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Unavailable(_)));
    }
}
