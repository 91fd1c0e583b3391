//! Single active forwarder across relay replicas

use coordination::{Coordinator, DistributedLock, LockError, LockResult};
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Queue for the leader lock until it is held or `shutdown` fires.
///
/// Each attempt is bounded by `attempt_timeout`; a timed-out attempt is
/// logged and retried, so replicas keep their FIFO position only within one
/// attempt. Returns `false` when shutdown won the race.
pub async fn acquire_leadership<C>(
    lock: &mut DistributedLock<C>,
    attempt_timeout: Duration,
    shutdown: &watch::Receiver<bool>,
) -> LockResult<bool>
where
    C: Coordinator + ?Sized,
{
    info!(resource = %lock.resource_id(), "Waiting for leadership");

    loop {
        if *shutdown.borrow() {
            return Ok(false);
        }

        match lock.lock_until(attempt_timeout, shutdown.clone()).await {
            Ok(()) => {
                info!(
                    resource = %lock.resource_id(),
                    node = lock.node_path().unwrap_or_default(),
                    "Acquired leadership"
                );
                return Ok(true);
            }
            Err(e) if e.is_timeout() => {
                info!(resource = %lock.resource_id(), "Another relay is leading, still waiting");
            }
            Err(LockError::Cancelled(_)) => return Ok(false),
            Err(e) => return Err(e),
        }
    }
}
