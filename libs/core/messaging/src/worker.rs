//! Consumer loop that hands failed messages to the [`FailureHandler`]

use crate::consumer::{Delivery, StreamConsumer};
use crate::error::{MessagingError, MessagingResult, ProcessingError};
use crate::failure::FailureHandler;
use crate::message::BrokerMessage;
use crate::metrics::ConsumerMetrics;
use crate::propagation::set_parent_from_headers;
use crate::publisher::WriterFactory;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};

const MAX_BACKOFF_SECS: u64 = 30;

/// Business logic for one consumed topic
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &BrokerMessage) -> Result<(), ProcessingError>;

    fn name(&self) -> &'static str;
}

pub struct MessageWorker<H, F>
where
    H: MessageHandler,
    F: WriterFactory + ?Sized,
{
    consumer: StreamConsumer,
    handler: Arc<H>,
    failures: Arc<FailureHandler<F>>,
    metrics: ConsumerMetrics,
}

impl<H, F> MessageWorker<H, F>
where
    H: MessageHandler,
    F: WriterFactory + ?Sized,
{
    pub fn new(consumer: StreamConsumer, handler: Arc<H>, failures: Arc<FailureHandler<F>>) -> Self {
        let metrics = ConsumerMetrics::new(consumer.topic(), consumer.group());
        Self {
            consumer,
            handler,
            failures,
            metrics,
        }
    }

    pub fn consumer(&self) -> &StreamConsumer {
        &self.consumer
    }

    /// Consume until `shutdown` turns `true`.
    ///
    /// Messages left pending by a previous run are processed first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> MessagingResult<()> {
        info!(
            topic = %self.consumer.topic(),
            group = %self.consumer.group(),
            consumer_id = %self.consumer.consumer_id(),
            handler = %self.handler.name(),
            resilience = self.failures.is_enabled(),
            "Starting message worker"
        );

        self.consumer.init_consumer_group().await?;

        match self.consumer.read_pending().await {
            Ok(pending) if !pending.is_empty() => {
                info!(count = pending.len(), "Reprocessing pending messages");
                self.process_batch(pending).await;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to read pending messages on startup"),
        }

        let poll_interval = Duration::from_millis(self.consumer.config().poll_interval_ms);
        let mut consecutive_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                info!("Received shutdown signal, stopping worker");
                break;
            }

            let batch = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("Shutdown channel closed, stopping worker");
                        break;
                    }
                    continue;
                }
                batch = self.consumer.read_new() => batch,
            };

            match batch {
                Ok(deliveries) => {
                    if consecutive_errors > 0 {
                        info!(consecutive_errors, "Connection recovered");
                        consecutive_errors = 0;
                    }
                    let idle = deliveries.is_empty();
                    self.process_batch(deliveries).await;

                    if idle && !self.consumer.is_blocking() {
                        tokio::select! {
                            _ = shutdown.changed() => {}
                            _ = tokio::time::sleep(poll_interval) => {}
                        }
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    self.recover(&e, consecutive_errors).await;
                }
            }
        }

        info!("Message worker stopped");
        Ok(())
    }

    async fn recover(&self, err: &MessagingError, consecutive_errors: u32) {
        if err.is_nogroup_error() {
            warn!("Consumer group missing, recreating");
            if let Err(e) = self.consumer.init_consumer_group().await {
                error!(error = %e, "Failed to recreate consumer group");
            }
            return;
        }

        let backoff_secs = if err.is_connection_error() {
            2u64.pow(consecutive_errors.min(5)).min(MAX_BACKOFF_SECS)
        } else {
            1
        };
        warn!(
            error = %err,
            consecutive_errors,
            backoff_secs,
            "Error reading from stream, backing off"
        );
        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
    }

    async fn process_batch(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            self.process(delivery).await;
        }
    }

    async fn process(&self, delivery: Delivery) {
        let message = &delivery.message;
        let span = info_span!(
            "consume",
            topic = %message.topic,
            entry_id = %delivery.entry_id,
            handler = %self.handler.name(),
            otel.kind = "consumer"
        );
        set_parent_from_headers(&span, &message.headers);

        async {
            self.metrics.message_received();
            let started = Instant::now();

            match self.handler.handle(message).await {
                Ok(()) => {
                    self.metrics.message_processed(started.elapsed());
                    debug!("Message processed");
                }
                Err(err) => {
                    self.metrics.message_failed(err.kind.as_ref());
                    warn!(kind = %err.kind, error = %err, "Message handling failed");

                    match self.failures.handle(message, Some(&err)).await {
                        Some(outcome) if !outcome.delivered => error!(
                            target_topic = %outcome.target_topic,
                            "Failed message could not be routed and is dropped"
                        ),
                        Some(_) => {}
                        None => warn!("Resilience disabled, failed message is dropped"),
                    }
                }
            }

            if let Err(e) = self.consumer.ack(&delivery.entry_id).await {
                error!(error = %e, "Failed to acknowledge message");
            }
        }
        .instrument(span)
        .await
    }
}
