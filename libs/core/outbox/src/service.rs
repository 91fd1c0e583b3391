use messaging::{BrokerMessage, MessagePublisher, inject_trace_context};
use sea_orm::DatabaseTransaction;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, debug, error, field, info_span, instrument, warn};

use crate::config::OutboxConfig;
use crate::error::OutboxResult;
use crate::metrics;
use crate::models::{ForwardReport, NewOutboxMessage, OutboxMessage, OutboxStatus};
use crate::store::OutboxStore;

enum Forwarded {
    Sent,
    Retrying,
    GaveUp,
}

/// Stages messages inside business transactions and relays them to the broker
pub struct OutboxService<S, P>
where
    S: OutboxStore + ?Sized,
    P: MessagePublisher + ?Sized,
{
    store: Arc<S>,
    publisher: Arc<P>,
    config: OutboxConfig,
}

impl<S, P> OutboxService<S, P>
where
    S: OutboxStore + ?Sized,
    P: MessagePublisher + ?Sized,
{
    pub fn new(store: Arc<S>, publisher: Arc<P>, config: OutboxConfig) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Stage a message on the caller's transaction.
    ///
    /// Nothing is published here; the record becomes visible to the
    /// forwarder only once `tx` commits.
    #[instrument(skip_all, fields(topic = %topic))]
    pub async fn send_in_tx(
        &self,
        tx: &DatabaseTransaction,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> OutboxResult<OutboxMessage> {
        self.store
            .create_in_tx(tx, NewOutboxMessage::new(topic, key, payload))
            .await
    }

    /// Publish one batch of stale PENDING records.
    ///
    /// Only the initial query can fail the call. Publish and status-update
    /// failures are handled per record and counted in the report.
    #[instrument(name = "OutboxService.forward_pending_messages", skip(self))]
    pub async fn forward_pending_messages(&self) -> OutboxResult<ForwardReport> {
        let started = Instant::now();
        let messages = self
            .store
            .find_pending_messages(self.config.batch_size)
            .await?;

        let mut report = ForwardReport {
            selected: messages.len(),
            ..Default::default()
        };

        for message in &messages {
            let span = info_span!(
                "forward_message",
                outbox.id = message.id,
                topic = %message.topic,
                retry_count = message.retry_count,
                otel.kind = "producer",
                otel.status_code = field::Empty,
            );

            match self.forward(message).instrument(span).await {
                Forwarded::Sent => report.sent += 1,
                Forwarded::Retrying => report.failed += 1,
                Forwarded::GaveUp => report.dead += 1,
            }
        }

        metrics::forward_cycle(started.elapsed(), report.selected);
        Ok(report)
    }

    async fn forward(&self, message: &OutboxMessage) -> Forwarded {
        let mut broker_message = BrokerMessage::new(
            message.topic.as_str(),
            message.key.as_bytes(),
            message.payload.clone(),
        );
        inject_trace_context(&mut broker_message.headers);

        match self.publisher.publish(&broker_message).await {
            Ok(entry_id) => {
                debug!(entry_id = %entry_id, "Forwarded outbox message");
                metrics::message_forwarded(&message.topic);
                self.record(message.id, OutboxStatus::Sent, message.retry_count)
                    .await;
                Forwarded::Sent
            }
            Err(e) => {
                tracing::Span::current().record("otel.status_code", "ERROR");

                let retry_count = message.retry_count.saturating_add(1);
                let gave_up = self
                    .config
                    .max_publish_attempts
                    .is_some_and(|max| i64::from(retry_count) >= i64::from(max));
                metrics::publish_failed(&message.topic, gave_up);

                if gave_up {
                    error!(error = %e, retry_count, "Publish failed, giving up on outbox message");
                    self.record(message.id, OutboxStatus::Failed, retry_count)
                        .await;
                    Forwarded::GaveUp
                } else {
                    warn!(error = %e, retry_count, "Publish failed, outbox message stays pending");
                    self.record(message.id, OutboxStatus::Pending, retry_count)
                        .await;
                    Forwarded::Retrying
                }
            }
        }
    }

    async fn record(&self, id: i64, status: OutboxStatus, retry_count: i32) {
        if let Err(e) = self.store.update_status(id, status, retry_count).await {
            error!(
                outbox_id = id,
                status = %status,
                error = %e,
                "Failed to update outbox message status"
            );
        }
    }
}
