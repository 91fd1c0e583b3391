//! Fair distributed lock over a [`Coordinator`]
//!
//! Each contender creates an ephemeral sequential node under
//! `{root}/{resource_id}`. The lowest sequence holds the lock; every other
//! contender watches only its immediate predecessor, so a release wakes
//! exactly one waiter and acquisition is strictly first-come first-served.

use crate::client::{Coordinator, SequentialNode, WatchEvent, ensure_path, join_path};
use crate::error::{CoordinationError, LockError, LockResult};
use metrics::{counter, histogram};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_LOCK_ROOT: &str = "/distributed_locks";
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
pub const NODE_PREFIX: &str = "lock-";

#[derive(Debug, Clone)]
pub struct LockOptions {
    pub root: String,
    pub wait_timeout: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            root: DEFAULT_LOCK_ROOT.to_string(),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

impl LockOptions {
    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Idle,
    Requesting,
    WaitingOnPredecessor,
    Acquired,
    Released,
    TimedOut,
}

/// A handle contending for one named resource
pub struct DistributedLock<C: Coordinator + ?Sized> {
    coordinator: Arc<C>,
    resource_id: String,
    path: String,
    wait_timeout: Duration,
    state: LockState,
    node: Option<SequentialNode>,
}

impl<C: Coordinator + ?Sized> DistributedLock<C> {
    /// Create a lock handle under the default root, creating the resource path if missing.
    pub async fn new(coordinator: Arc<C>, resource_id: impl Into<String>) -> LockResult<Self> {
        Self::with_options(coordinator, resource_id, LockOptions::default()).await
    }

    #[instrument(skip(coordinator, resource_id, options), fields(root = %options.root))]
    pub async fn with_options(
        coordinator: Arc<C>,
        resource_id: impl Into<String>,
        options: LockOptions,
    ) -> LockResult<Self> {
        let resource_id = resource_id.into();
        if resource_id.is_empty() || resource_id.contains('/') {
            return Err(CoordinationError::InvalidPath(resource_id).into());
        }

        let path = join_path(&options.root, &resource_id);
        ensure_path(coordinator.as_ref(), &path).await?;
        debug!(path = %path, "Lock path ready");

        Ok(Self {
            coordinator,
            resource_id,
            path,
            wait_timeout: options.wait_timeout,
            state: LockState::Idle,
            node: None,
        })
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn is_held(&self) -> bool {
        self.state == LockState::Acquired
    }

    /// Path of our contender node while the lock is held
    pub fn node_path(&self) -> Option<&str> {
        self.node.as_ref().map(|n| n.path.as_str())
    }

    /// Block until the lock is held or the configured wait bound elapses.
    pub async fn lock(&mut self) -> LockResult<()> {
        self.lock_with_timeout(self.wait_timeout).await
    }

    pub async fn lock_with_timeout(&mut self, timeout: Duration) -> LockResult<()> {
        self.acquire(timeout, std::future::pending()).await
    }

    /// Like [`lock_with_timeout`](Self::lock_with_timeout), but gives up as soon
    /// as `cancel` turns `true`.
    pub async fn lock_until(
        &mut self,
        timeout: Duration,
        mut cancel: watch::Receiver<bool>,
    ) -> LockResult<()> {
        let cancelled = async move {
            let closed = cancel.wait_for(|cancelled| *cancelled).await.is_err();
            if closed {
                // Sender gone: nobody can cancel any more
                std::future::pending::<()>().await;
            }
        };
        self.acquire(timeout, cancelled).await
    }

    #[instrument(skip(self, cancelled), fields(resource = %self.resource_id))]
    async fn acquire<F>(&mut self, timeout: Duration, cancelled: F) -> LockResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        if self.node.is_some() {
            return Err(LockError::AlreadyHeld(self.resource_id.clone()));
        }

        let started = Instant::now();
        let deadline = started + timeout;
        self.state = LockState::Requesting;

        let node = match self
            .coordinator
            .create_ephemeral_sequential(&self.path, NODE_PREFIX)
            .await
        {
            Ok(node) => node,
            Err(e) => {
                self.state = LockState::Idle;
                counter!("lock_acquisitions_total", "outcome" => "error").increment(1);
                return Err(e.into());
            }
        };
        debug!(node = %node.path, sequence = node.sequence, "Created contender node");

        let mut cancelled = std::pin::pin!(cancelled);
        let result = self
            .wait_for_turn(&node, started, deadline, cancelled.as_mut())
            .await;
        histogram!("lock_wait_seconds").record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                info!(
                    node = %node.path,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Lock acquired"
                );
                counter!("lock_acquisitions_total", "outcome" => "acquired").increment(1);
                self.state = LockState::Acquired;
                self.node = Some(node);
                Ok(())
            }
            Err(err) => {
                let outcome = match &err {
                    LockError::Timeout { .. } => "timeout",
                    LockError::Cancelled(_) => "cancelled",
                    _ => "error",
                };
                counter!("lock_acquisitions_total", "outcome" => outcome).increment(1);
                self.state = if err.is_timeout() {
                    LockState::TimedOut
                } else {
                    LockState::Released
                };

                if !matches!(err, LockError::NodeVanished(_)) {
                    self.discard(&node).await;
                }
                warn!(error = %err, "Lock not acquired");
                Err(err)
            }
        }
    }

    async fn wait_for_turn<F>(
        &mut self,
        node: &SequentialNode,
        started: Instant,
        deadline: Instant,
        mut cancelled: Pin<&mut F>,
    ) -> LockResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        loop {
            let mut contenders: Vec<_> = self
                .coordinator
                .children(&self.path)
                .await?
                .into_iter()
                .filter(|c| c.name.starts_with(NODE_PREFIX))
                .collect();
            contenders.sort_by_key(|c| c.sequence);

            let position = contenders
                .iter()
                .position(|c| c.name == node.name)
                .ok_or_else(|| LockError::NodeVanished(node.path.clone()))?;

            if position == 0 {
                return Ok(());
            }

            let predecessor = join_path(&self.path, &contenders[position - 1].name);
            let Some(watch) = self.coordinator.exists_watch(&predecessor).await? else {
                // Predecessor left between listing and watching
                continue;
            };

            self.state = LockState::WaitingOnPredecessor;
            debug!(predecessor = %predecessor, queue_position = position, "Waiting on predecessor");

            tokio::select! {
                event = watch => {
                    match event {
                        Ok(WatchEvent::Deleted) => debug!(predecessor = %predecessor, "Predecessor released"),
                        Ok(WatchEvent::SessionLost) | Err(_) => {
                            debug!(predecessor = %predecessor, "Watch ended, re-checking queue")
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(LockError::Timeout {
                        resource: self.resource_id.clone(),
                        waited: started.elapsed(),
                    });
                }
                _ = &mut cancelled => {
                    return Err(LockError::Cancelled(self.resource_id.clone()));
                }
            }
        }
    }

    async fn discard(&self, node: &SequentialNode) {
        match self.coordinator.delete(&node.path).await {
            Ok(()) | Err(CoordinationError::NoNode(_)) => {}
            Err(e) => {
                warn!(node = %node.path, error = %e, "Failed to remove contender node");
            }
        }
    }

    /// Release the lock by deleting our node, waking the next waiter.
    #[instrument(skip(self), fields(resource = %self.resource_id))]
    pub async fn unlock(&mut self) -> LockResult<()> {
        let node = self
            .node
            .take()
            .ok_or_else(|| LockError::NotHeld(self.resource_id.clone()))?;

        match self.coordinator.delete(&node.path).await {
            Ok(()) => {}
            Err(CoordinationError::NoNode(_)) => {
                warn!(node = %node.path, "Lock node already gone, session likely expired");
            }
            Err(e) => {
                self.node = Some(node);
                return Err(e.into());
            }
        }

        self.state = LockState::Released;
        info!(node = %node.path, "Lock released");
        Ok(())
    }
}

impl<C: Coordinator + ?Sized> Drop for DistributedLock<C> {
    fn drop(&mut self) {
        if let Some(node) = &self.node {
            warn!(
                node = %node.path,
                "Lock handle dropped while held; node remains until the session ends"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockCoordinator;
    use crate::memory::MemoryEnsemble;

    #[tokio::test]
    async fn test_lock_and_unlock() {
        let ensemble = MemoryEnsemble::new();
        let mut lock = DistributedLock::new(Arc::new(ensemble.connect()), "sku-1")
            .await
            .unwrap();
        assert_eq!(lock.path(), "/distributed_locks/sku-1");
        assert_eq!(lock.state(), LockState::Idle);

        lock.lock().await.unwrap();
        assert!(lock.is_held());
        assert_eq!(
            lock.node_path(),
            Some("/distributed_locks/sku-1/lock-0000000001")
        );

        lock.unlock().await.unwrap();
        assert_eq!(lock.state(), LockState::Released);
        assert!(ensemble.child_names("/distributed_locks/sku-1").is_empty());
    }

    #[tokio::test]
    async fn test_unlock_without_lock() {
        let ensemble = MemoryEnsemble::new();
        let mut lock = DistributedLock::new(Arc::new(ensemble.connect()), "sku-1")
            .await
            .unwrap();

        let err = lock.unlock().await.unwrap_err();
        assert!(matches!(err, LockError::NotHeld(ref r) if r == "sku-1"));
    }

    #[tokio::test]
    async fn test_lock_twice_is_rejected() {
        let ensemble = MemoryEnsemble::new();
        let mut lock = DistributedLock::new(Arc::new(ensemble.connect()), "sku-1")
            .await
            .unwrap();

        lock.lock().await.unwrap();
        let err = lock.lock().await.unwrap_err();
        assert!(matches!(err, LockError::AlreadyHeld(_)));
        assert!(lock.is_held());
        assert_eq!(ensemble.child_names("/distributed_locks/sku-1").len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_resource_id() {
        let ensemble = MemoryEnsemble::new();
        let session = Arc::new(ensemble.connect());

        for id in ["", "a/b"] {
            let result = DistributedLock::new(session.clone(), id).await;
            assert!(matches!(
                result,
                Err(LockError::Coordination(CoordinationError::InvalidPath(_)))
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_waiter_node() {
        let ensemble = MemoryEnsemble::new();
        let mut holder = DistributedLock::new(Arc::new(ensemble.connect()), "sku-1")
            .await
            .unwrap();
        holder.lock().await.unwrap();

        let options = LockOptions::default().with_wait_timeout(Duration::from_secs(2));
        let mut waiter =
            DistributedLock::with_options(Arc::new(ensemble.connect()), "sku-1", options)
                .await
                .unwrap();

        let err = waiter.lock().await.unwrap_err();
        match err {
            LockError::Timeout { resource, waited } => {
                assert_eq!(resource, "sku-1");
                assert!(waited >= Duration::from_secs(2));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(waiter.state(), LockState::TimedOut);
        assert_eq!(
            ensemble.child_names("/distributed_locks/sku-1"),
            vec!["lock-0000000001"]
        );
        assert!(holder.is_held());
    }

    #[tokio::test]
    async fn test_cancellation_removes_waiter_node() {
        let ensemble = MemoryEnsemble::new();
        let mut holder = DistributedLock::new(Arc::new(ensemble.connect()), "sku-1")
            .await
            .unwrap();
        holder.lock().await.unwrap();

        let mut waiter = DistributedLock::new(Arc::new(ensemble.connect()), "sku-1")
            .await
            .unwrap();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        cancel_tx.send(true).unwrap();

        let err = waiter
            .lock_until(Duration::from_secs(30), cancel_rx)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Cancelled(_)));
        assert_eq!(ensemble.child_names("/distributed_locks/sku-1").len(), 1);
    }

    #[tokio::test]
    async fn test_expired_holder_hands_over_to_waiter() {
        let ensemble = MemoryEnsemble::new();
        let holder_session = Arc::new(ensemble.connect());
        let mut holder = DistributedLock::new(holder_session.clone(), "sku-1")
            .await
            .unwrap();
        holder.lock().await.unwrap();

        let mut waiter = DistributedLock::new(Arc::new(ensemble.connect()), "sku-1")
            .await
            .unwrap();
        let handle = tokio::spawn(async move {
            waiter.lock().await.map(|()| waiter)
        });

        tokio::task::yield_now().await;
        holder_session.expire();

        let waiter = handle.await.unwrap().unwrap();
        assert!(waiter.is_held());

        let err = holder.unlock().await.unwrap_err();
        assert!(matches!(
            err,
            LockError::Coordination(CoordinationError::SessionExpired)
        ));
    }

    #[tokio::test]
    async fn test_unavailable_backend_is_not_a_timeout() {
        let mut mock = MockCoordinator::new();
        mock.expect_create().returning(|_| Ok(()));
        mock.expect_create_ephemeral_sequential()
            .times(1)
            .returning(|_, _| Err(CoordinationError::Unavailable("connection refused".into())));

        let mut lock = DistributedLock::new(Arc::new(mock), "sku-1").await.unwrap();
        let err = lock.lock().await.unwrap_err();

        assert!(err.is_unavailable());
        assert!(!err.is_timeout());
        assert_eq!(lock.state(), LockState::Idle);
    }
}
