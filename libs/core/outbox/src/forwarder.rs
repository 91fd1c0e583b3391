//! Periodic relay of pending outbox records

use messaging::MessagePublisher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::service::OutboxService;
use crate::store::OutboxStore;

pub struct OutboxForwarder<S, P>
where
    S: OutboxStore + ?Sized,
    P: MessagePublisher + ?Sized,
{
    service: Arc<OutboxService<S, P>>,
    interval: Duration,
}

impl<S, P> OutboxForwarder<S, P>
where
    S: OutboxStore + ?Sized,
    P: MessagePublisher + ?Sized,
{
    /// Forwarder ticking at the service's configured poll interval
    pub fn new(service: Arc<OutboxService<S, P>>) -> Self {
        let interval = service.config().poll_interval;
        Self { service, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run forwarding cycles until `shutdown` turns `true` or its sender is dropped.
    ///
    /// The first cycle starts one interval after the call. A cycle that is
    /// already running completes before the signal is observed.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting transactional message forwarder"
        );

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => self.cycle().await,
            }
        }

        info!("Transactional message forwarder stopped");
    }

    async fn cycle(&self) {
        match self.service.forward_pending_messages().await {
            Ok(report) if report.selected > 0 => info!(
                selected = report.selected,
                sent = report.sent,
                failed = report.failed,
                dead = report.dead,
                "Forwarded pending messages"
            ),
            Ok(_) => debug!("No pending messages"),
            Err(e) => error!(error = %e, "Failed to forward pending messages"),
        }
    }
}
