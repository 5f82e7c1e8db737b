//! Background consumer that turns queue messages into coordinator passes

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::QueueConfig;
use crate::error::Result;
use crate::storage::DocumentStore;
use crate::types::UploadStatus;

use super::coordinator::{IngestionCoordinator, ProcessOutcome};
use super::job_queue::{Delivery, QueueMessage, QueueSubscriber};

/// What to do with a delivery once handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge; the message will not be seen again
    Finish,
    /// Release for another delivery
    Requeue,
}

/// Long-lived queue consumer
pub struct QueueConsumer {
    worker_id: usize,
    store: Arc<dyn DocumentStore>,
    coordinator: Arc<IngestionCoordinator>,
    subscriber: Arc<dyn QueueSubscriber>,
    poll_interval: Duration,
    requeue_delay: Duration,
}

impl QueueConsumer {
    /// Create a new consumer
    pub fn new(
        worker_id: usize,
        store: Arc<dyn DocumentStore>,
        coordinator: Arc<IngestionCoordinator>,
        subscriber: Arc<dyn QueueSubscriber>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            worker_id,
            store,
            coordinator,
            subscriber,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            requeue_delay: Duration::from_millis(config.requeue_delay_ms),
        }
    }

    /// Spawn `count` consumers sharing one subscriber
    pub fn spawn_pool(
        count: usize,
        store: Arc<dyn DocumentStore>,
        coordinator: Arc<IngestionCoordinator>,
        subscriber: Arc<dyn QueueSubscriber>,
        config: &QueueConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|worker_id| {
                let consumer = Self::new(
                    worker_id,
                    store.clone(),
                    coordinator.clone(),
                    subscriber.clone(),
                    config,
                );
                tokio::spawn(consumer.run(shutdown.clone()))
            })
            .collect()
    }

    /// Consume until `shutdown` turns true or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "Queue consumer {} started (poll every {}ms)",
            self.worker_id,
            self.poll_interval.as_millis()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.poll_once().await {
                Ok(handled) => !handled,
                Err(e) => {
                    tracing::error!("Queue consumer {} poll failed: {}", self.worker_id, e);
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!("Queue consumer {} stopped", self.worker_id);
    }

    /// Handle at most one message. Returns false when the queue was empty.
    pub async fn poll_once(&self) -> Result<bool> {
        let Some(delivery) = self.subscriber.receive().await? else {
            return Ok(false);
        };

        match self.handle(&delivery).await {
            Disposition::Finish => self.subscriber.finish(&delivery).await?,
            Disposition::Requeue => {
                tracing::warn!(
                    "Requeueing message {} (delivery {}) in {}ms",
                    delivery.id,
                    delivery.attempts,
                    self.requeue_delay.as_millis()
                );
                self.subscriber.requeue(&delivery, self.requeue_delay).await?
            }
        }
        Ok(true)
    }

    /// Decide the fate of one delivery
    pub async fn handle(&self, delivery: &Delivery) -> Disposition {
        let message = match QueueMessage::decode(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!("Dropping message {}: {}", delivery.id, e);
                return Disposition::Finish;
            }
        };
        let document_id = message.document_id;

        let document = match self.store.get_document(document_id).await {
            Ok(Some(document)) => document,
            Ok(None) => {
                tracing::warn!("[{}] Document no longer exists, discarding message", document_id);
                return Disposition::Finish;
            }
            Err(e) => {
                tracing::error!("[{}] Failed to load document: {}", document_id, e);
                return if e.is_retryable() {
                    Disposition::Requeue
                } else {
                    Disposition::Finish
                };
            }
        };

        if document.upload_status == UploadStatus::Success {
            tracing::info!("[{}] Already processed, discarding duplicate message", document_id);
            return Disposition::Finish;
        }

        match self.coordinator.process(&document).await {
            Ok(ProcessOutcome::Processed { chunks, .. }) => {
                tracing::debug!("[{}] Worker {} stored {} chunks", document_id, self.worker_id, chunks);
                Disposition::Finish
            }
            Ok(ProcessOutcome::Skipped(reason)) => {
                tracing::info!("[{}] Skipped: {}", document_id, reason);
                Disposition::Finish
            }
            Err(e) if e.is_retryable() => Disposition::Requeue,
            Err(e) => {
                tracing::error!("[{}] Permanent failure, not retrying: {}", document_id, e);
                Disposition::Finish
            }
        }
    }
}
