//! etcd-backed coordinator
//!
//! A session is an etcd lease kept alive by a background task. Ephemeral
//! nodes are keys attached to that lease, so they disappear when the process
//! stops renewing it. A node's sequence is its create revision, which etcd
//! assigns from a cluster-wide monotonic counter.

use crate::client::{
    ChildNode, Coordinator, NodeWatch, SequentialNode, SessionState, WatchEvent, join_path,
    validate_path,
};
use crate::config::CoordinationConfig;
use crate::error::{CoordinationError, CoordinationResult};
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, LeaseKeepAliveStream,
    LeaseKeeper, PutOptions, Txn, TxnOp, WatchOptions,
};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub struct EtcdCoordinator {
    client: Client,
    lease_id: i64,
    session: watch::Receiver<SessionState>,
    keep_alive: JoinHandle<()>,
}

impl EtcdCoordinator {
    /// Connect and open a lease-backed session.
    #[instrument(skip(config), fields(endpoints = ?config.endpoints))]
    pub async fn connect(config: &CoordinationConfig) -> CoordinationResult<Self> {
        let options = ConnectOptions::new().with_connect_timeout(config.connect_timeout);
        let mut client = Client::connect(config.endpoints.clone(), Some(options)).await?;

        let lease = client.lease_grant(config.session_ttl_secs, None).await?;
        let lease_id = lease.id();
        let (keeper, stream) = client.lease_keep_alive(lease_id).await?;

        let (state_tx, state_rx) = watch::channel(SessionState::Connected);
        info!(
            lease_id,
            ttl_secs = config.session_ttl_secs,
            "Coordination session connected"
        );

        let keep_alive = tokio::spawn(keep_session_alive(
            keeper,
            stream,
            lease_id,
            config.keep_alive_interval(),
            Duration::from_secs(config.session_ttl_secs.max(1) as u64),
            state_tx,
        ));

        Ok(Self {
            client,
            lease_id,
            session: state_rx,
            keep_alive,
        })
    }

    pub fn lease_id(&self) -> i64 {
        self.lease_id
    }

    /// Subscribe to session state transitions
    pub fn session_events(&self) -> watch::Receiver<SessionState> {
        self.session.clone()
    }

    /// Revoke the lease, removing every ephemeral node owned by this session.
    pub async fn close(self) -> CoordinationResult<()> {
        self.keep_alive.abort();
        let mut client = self.client.clone();
        client.lease_revoke(self.lease_id).await?;
        info!(lease_id = self.lease_id, "Coordination session closed");
        Ok(())
    }

    fn map_err(&self, err: etcd_client::Error) -> CoordinationError {
        if *self.session.borrow() == SessionState::Expired {
            CoordinationError::SessionExpired
        } else {
            err.into()
        }
    }
}

impl Drop for EtcdCoordinator {
    fn drop(&mut self) {
        self.keep_alive.abort();
    }
}

fn transition(state_tx: &watch::Sender<SessionState>, next: SessionState, lease_id: i64) {
    let previous = state_tx.send_replace(next);
    if previous == next {
        return;
    }
    match next {
        SessionState::Connected => info!(lease_id, %previous, "Coordination session connected"),
        SessionState::Disconnected => {
            warn!(lease_id, %previous, "Coordination session disconnected")
        }
        SessionState::Expired => error!(lease_id, %previous, "Coordination session expired"),
    }
}

/// Time since the last confirmed lease renewal
///
/// The server drops the lease once `ttl` passes without a renewal, so a
/// session that cannot renew for that long is expired even if it never
/// hears so from etcd.
#[derive(Debug, Clone, Copy)]
struct LeaseClock {
    ttl: Duration,
    last_renewal: Instant,
}

impl LeaseClock {
    fn new(ttl: Duration, now: Instant) -> Self {
        Self {
            ttl,
            last_renewal: now,
        }
    }

    fn renewed(&mut self, now: Instant) {
        self.last_renewal = now;
    }

    fn state_after_failure(&self, now: Instant) -> SessionState {
        if now.saturating_duration_since(self.last_renewal) >= self.ttl {
            SessionState::Expired
        } else {
            SessionState::Disconnected
        }
    }
}

async fn keep_session_alive(
    mut keeper: LeaseKeeper,
    mut stream: LeaseKeepAliveStream,
    lease_id: i64,
    interval: Duration,
    ttl: Duration,
    state_tx: watch::Sender<SessionState>,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut clock = LeaseClock::new(ttl, Instant::now());

    loop {
        ticker.tick().await;

        let failure = match keeper.keep_alive().await {
            Err(e) => Some(e),
            Ok(()) => match stream.message().await {
                Ok(Some(response)) if response.ttl() > 0 => {
                    clock.renewed(Instant::now());
                    transition(&state_tx, SessionState::Connected, lease_id);
                    None
                }
                Ok(_) => {
                    transition(&state_tx, SessionState::Expired, lease_id);
                    return;
                }
                Err(e) => Some(e),
            },
        };

        if let Some(e) = failure {
            debug!(lease_id, error = %e, "Lease keep-alive failed");
            let next = clock.state_after_failure(Instant::now());
            transition(&state_tx, next, lease_id);
            if next == SessionState::Expired {
                return;
            }
        }
    }
}

#[async_trait]
impl Coordinator for EtcdCoordinator {
    async fn create(&self, path: &str) -> CoordinationResult<()> {
        validate_path(path)?;
        let mut client = self.client.clone();

        let txn = Txn::new()
            .when(vec![Compare::create_revision(path, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(path, "", None)]);

        let response = client.txn(txn).await.map_err(|e| self.map_err(e))?;
        if response.succeeded() {
            debug!(path, "Created node");
            Ok(())
        } else {
            Err(CoordinationError::NodeExists(path.to_string()))
        }
    }

    async fn create_ephemeral_sequential(
        &self,
        parent: &str,
        prefix: &str,
    ) -> CoordinationResult<SequentialNode> {
        validate_path(parent)?;
        let mut client = self.client.clone();

        let name = format!("{}{}", prefix, Uuid::new_v4().simple());
        let path = join_path(parent, &name);

        let response = client
            .put(
                path.as_str(),
                "",
                Some(PutOptions::new().with_lease(self.lease_id)),
            )
            .await
            .map_err(|e| self.map_err(e))?;

        let revision = response.header().map(|h| h.revision()).ok_or_else(|| {
            CoordinationError::Unavailable("put response carried no header".to_string())
        })?;

        Ok(SequentialNode {
            path,
            name,
            sequence: revision as u64,
        })
    }

    async fn children(&self, path: &str) -> CoordinationResult<Vec<ChildNode>> {
        let mut client = self.client.clone();
        let prefix = format!("{}/", path.trim_end_matches('/'));

        let response = client
            .get(prefix.as_str(), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| self.map_err(e))?;

        let children = response
            .kvs()
            .iter()
            .filter_map(|kv| {
                let key = kv.key_str().ok()?;
                let name = key.strip_prefix(&prefix)?;
                (!name.is_empty() && !name.contains('/')).then(|| ChildNode {
                    name: name.to_string(),
                    sequence: kv.create_revision() as u64,
                })
            })
            .collect();

        Ok(children)
    }

    async fn exists_watch(&self, path: &str) -> CoordinationResult<Option<NodeWatch>> {
        let mut client = self.client.clone();

        let response = client.get(path, None).await.map_err(|e| self.map_err(e))?;
        if response.kvs().is_empty() {
            return Ok(None);
        }
        let revision = response.header().map(|h| h.revision()).unwrap_or_default();

        // Starting after the read revision guarantees a delete in between is still observed
        let (mut watcher, mut stream) = client
            .watch(
                path,
                Some(WatchOptions::new().with_start_revision(revision + 1)),
            )
            .await
            .map_err(|e| self.map_err(e))?;

        let (mut tx, rx) = oneshot::channel();
        let watched = path.to_string();

        tokio::spawn(async move {
            let event = loop {
                tokio::select! {
                    _ = tx.closed() => break None,
                    message = stream.message() => match message {
                        Ok(Some(resp)) if resp.canceled() => break Some(WatchEvent::SessionLost),
                        Ok(Some(resp)) => {
                            if resp
                                .events()
                                .iter()
                                .any(|e| e.event_type() == EventType::Delete)
                            {
                                break Some(WatchEvent::Deleted);
                            }
                        }
                        Ok(None) => break Some(WatchEvent::SessionLost),
                        Err(e) => {
                            warn!(path = %watched, error = %e, "Watch stream failed");
                            break Some(WatchEvent::SessionLost);
                        }
                    }
                }
            };

            if let Some(event) = event {
                let _ = tx.send(event);
            }
            if let Err(e) = watcher.cancel().await {
                debug!(path = %watched, error = %e, "Failed to cancel watch");
            }
        });

        Ok(Some(rx))
    }

    async fn delete(&self, path: &str) -> CoordinationResult<()> {
        let mut client = self.client.clone();
        let response = client.delete(path, None).await.map_err(|e| self.map_err(e))?;

        if response.deleted() == 0 {
            Err(CoordinationError::NoNode(path.to_string()))
        } else {
            Ok(())
        }
    }

    fn session_state(&self) -> SessionState {
        *self.session.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_within_ttl_is_disconnected() {
        let start = Instant::now();
        let clock = LeaseClock::new(Duration::from_secs(10), start);

        assert_eq!(
            clock.state_after_failure(start + Duration::from_secs(9)),
            SessionState::Disconnected
        );
    }

    #[test]
    fn test_failure_past_ttl_is_expired() {
        let start = Instant::now();
        let clock = LeaseClock::new(Duration::from_secs(10), start);

        assert_eq!(
            clock.state_after_failure(start + Duration::from_secs(10)),
            SessionState::Expired
        );
    }

    #[test]
    fn test_renewal_resets_expiry() {
        let start = Instant::now();
        let mut clock = LeaseClock::new(Duration::from_secs(10), start);
        clock.renewed(start + Duration::from_secs(8));

        assert_eq!(
            clock.state_after_failure(start + Duration::from_secs(15)),
            SessionState::Disconnected
        );
        assert_eq!(
            clock.state_after_failure(start + Duration::from_secs(18)),
            SessionState::Expired
        );
    }
}
