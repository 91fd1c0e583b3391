//! In-process coordination backend
//!
//! `MemoryEnsemble` is shared, linearizable state; each `MemorySession`
//! behaves like one client session against it. Useful for tests and for
//! single-process deployments where no etcd cluster exists.

use crate::client::{
    ChildNode, Coordinator, NodeWatch, SequentialNode, SessionState, WatchEvent, join_path,
    validate_path,
};
use crate::error::{CoordinationError, CoordinationResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, info};

#[derive(Debug)]
struct Node {
    owner: Option<u64>,
    sequence: u64,
}

#[derive(Default)]
struct EnsembleState {
    nodes: BTreeMap<String, Node>,
    child_counters: HashMap<String, u64>,
    watches: HashMap<String, Vec<oneshot::Sender<WatchEvent>>>,
    sessions: HashMap<u64, SessionState>,
    next_session: u64,
}

impl EnsembleState {
    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn next_sequence(&mut self, parent: &str) -> u64 {
        let counter = self.child_counters.entry(parent.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    fn insert(&mut self, path: String, owner: Option<u64>) -> CoordinationResult<u64> {
        let parent = parent_of(&path);
        if !self.exists(parent) {
            return Err(CoordinationError::NoNode(parent.to_string()));
        }
        let sequence = self.next_sequence(parent);
        self.nodes.insert(path, Node { owner, sequence });
        Ok(sequence)
    }

    fn remove(&mut self, path: &str) {
        self.nodes.remove(path);
        for watcher in self.watches.remove(path).unwrap_or_default() {
            let _ = watcher.send(WatchEvent::Deleted);
        }
    }

    fn children_of(&self, path: &str) -> Vec<ChildNode> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };

        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, node)| {
                let name = &key[prefix.len()..];
                (!name.contains('/')).then(|| ChildNode {
                    name: name.to_string(),
                    sequence: node.sequence,
                })
            })
            .collect()
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Shared in-memory coordination state
#[derive(Clone, Default)]
pub struct MemoryEnsemble {
    state: Arc<Mutex<EnsembleState>>,
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session against this ensemble
    pub fn connect(&self) -> MemorySession {
        let mut state = self.lock_state();
        state.next_session += 1;
        let id = state.next_session;
        state.sessions.insert(id, SessionState::Connected);
        debug!(session_id = id, "In-memory coordination session opened");

        MemorySession {
            id,
            ensemble: self.clone(),
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock_state().exists(path)
    }

    /// Names of the direct children of `path`, ordered by sequence
    pub fn child_names(&self, path: &str) -> Vec<String> {
        let mut children = self.lock_state().children_of(path);
        children.sort_by_key(|c| c.sequence);
        children.into_iter().map(|c| c.name).collect()
    }

    fn lock_state(&self) -> MutexGuard<'_, EnsembleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One client session against a [`MemoryEnsemble`]
pub struct MemorySession {
    id: u64,
    ensemble: MemoryEnsemble,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Expire this session: its ephemeral nodes are removed and their watches fire.
    pub fn expire(&self) {
        let mut state = self.ensemble.lock_state();
        let owned: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(self.id))
            .map(|(path, _)| path.clone())
            .collect();

        for path in &owned {
            state.remove(path);
        }
        state.sessions.insert(self.id, SessionState::Expired);

        info!(
            session_id = self.id,
            removed_nodes = owned.len(),
            "In-memory coordination session expired"
        );
    }

    fn live_state(&self) -> CoordinationResult<MutexGuard<'_, EnsembleState>> {
        let state = self.ensemble.lock_state();
        match state.sessions.get(&self.id) {
            Some(SessionState::Expired) | None => Err(CoordinationError::SessionExpired),
            Some(_) => Ok(state),
        }
    }
}

#[async_trait]
impl Coordinator for MemorySession {
    async fn create(&self, path: &str) -> CoordinationResult<()> {
        validate_path(path)?;
        let mut state = self.live_state()?;
        if state.exists(path) {
            return Err(CoordinationError::NodeExists(path.to_string()));
        }
        state.insert(path.to_string(), None)?;
        Ok(())
    }

    async fn create_ephemeral_sequential(
        &self,
        parent: &str,
        prefix: &str,
    ) -> CoordinationResult<SequentialNode> {
        validate_path(parent)?;
        let mut state = self.live_state()?;
        if !state.exists(parent) {
            return Err(CoordinationError::NoNode(parent.to_string()));
        }

        // The name carries the sequence the parent will assign next
        let sequence = state.child_counters.get(parent).copied().unwrap_or(0) + 1;
        let name = format!("{}{:010}", prefix, sequence);
        let path = join_path(parent, &name);
        let assigned = state.insert(path.clone(), Some(self.id))?;

        Ok(SequentialNode {
            path,
            name,
            sequence: assigned,
        })
    }

    async fn children(&self, path: &str) -> CoordinationResult<Vec<ChildNode>> {
        let state = self.live_state()?;
        if !state.exists(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        Ok(state.children_of(path))
    }

    async fn exists_watch(&self, path: &str) -> CoordinationResult<Option<NodeWatch>> {
        let mut state = self.live_state()?;
        if !state.exists(path) {
            return Ok(None);
        }
        let (tx, rx) = oneshot::channel();
        state.watches.entry(path.to_string()).or_default().push(tx);
        Ok(Some(rx))
    }

    async fn delete(&self, path: &str) -> CoordinationResult<()> {
        let mut state = self.live_state()?;
        if !state.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        if !state.children_of(path).is_empty() {
            return Err(CoordinationError::NotEmpty(path.to_string()));
        }
        state.remove(path);
        Ok(())
    }

    fn session_state(&self) -> SessionState {
        self.ensemble
            .lock_state()
            .sessions
            .get(&self.id)
            .copied()
            .unwrap_or(SessionState::Expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_requires_parent() {
        let ensemble = MemoryEnsemble::new();
        let session = ensemble.connect();

        let err = session.create("/a/b").await.unwrap_err();
        assert!(matches!(err, CoordinationError::NoNode(ref p) if p == "/a"));

        session.create("/a").await.unwrap();
        session.create("/a/b").await.unwrap();
        assert!(matches!(
            session.create("/a").await,
            Err(CoordinationError::NodeExists(_))
        ));
    }

    #[tokio::test]
    async fn test_sequential_nodes_are_monotonic() {
        let ensemble = MemoryEnsemble::new();
        let session = ensemble.connect();
        session.create("/locks").await.unwrap();

        let first = session
            .create_ephemeral_sequential("/locks", "lock-")
            .await
            .unwrap();
        let second = session
            .create_ephemeral_sequential("/locks", "lock-")
            .await
            .unwrap();

        assert_eq!(first.name, "lock-0000000001");
        assert_eq!(second.name, "lock-0000000002");
        assert!(second.sequence > first.sequence);
        assert_eq!(
            ensemble.child_names("/locks"),
            vec!["lock-0000000001", "lock-0000000002"]
        );
    }

    #[tokio::test]
    async fn test_children_excludes_grandchildren() {
        let ensemble = MemoryEnsemble::new();
        let session = ensemble.connect();
        session.create("/a").await.unwrap();
        session.create("/a/b").await.unwrap();
        session.create("/a/b/c").await.unwrap();
        session.create("/ab").await.unwrap();

        let names: Vec<String> = session
            .children("/a")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["b"]);
    }

    #[tokio::test]
    async fn test_watch_fires_on_delete() {
        let ensemble = MemoryEnsemble::new();
        let session = ensemble.connect();
        session.create("/n").await.unwrap();

        let watch = session.exists_watch("/n").await.unwrap().unwrap();
        session.delete("/n").await.unwrap();

        assert_eq!(watch.await.unwrap(), WatchEvent::Deleted);
        assert!(session.exists_watch("/n").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expire_removes_ephemeral_nodes_only() {
        let ensemble = MemoryEnsemble::new();
        let owner = ensemble.connect();
        let observer = ensemble.connect();
        owner.create("/locks").await.unwrap();
        let node = owner
            .create_ephemeral_sequential("/locks", "lock-")
            .await
            .unwrap();
        let watch = observer.exists_watch(&node.path).await.unwrap().unwrap();

        owner.expire();

        assert_eq!(watch.await.unwrap(), WatchEvent::Deleted);
        assert!(ensemble.exists("/locks"));
        assert!(!ensemble.exists(&node.path));
        assert_eq!(owner.session_state(), SessionState::Expired);
        assert!(matches!(
            owner.children("/locks").await,
            Err(CoordinationError::SessionExpired)
        ));
    }

    #[tokio::test]
    async fn test_delete_missing_node() {
        let ensemble = MemoryEnsemble::new();
        let session = ensemble.connect();
        assert!(matches!(
            session.delete("/missing").await,
            Err(CoordinationError::NoNode(_))
        ));
    }
}
