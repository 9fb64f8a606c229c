//! Queue consumer loop for the Shutter pipeline.
//!
//! This module provides the handler seam ([`EventHandler`]) and the
//! [`QueueConsumer`] that drives a handler from a [`WorkQueue`]: it gathers a
//! batch, handles every message independently under a processing deadline and
//! settles each one (ack, dead-letter, or leave for redelivery).

use crate::config::QueueConfig;
use crate::event::RoutedEvent;
use crate::queue::{ReceivedMessage, WorkQueue};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Failure classes a handler can report
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Temporary condition; the event is retried by redelivery
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Permanently invalid event; retrying cannot succeed
    #[error("Event rejected: {0}")]
    Rejected(String),

    /// Nothing to do (e.g. unknown key); logged and dropped
    #[error("Event discarded: {0}")]
    Discarded(String),
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        HandlerError::Transient(message.into())
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        HandlerError::Rejected(message.into())
    }

    pub fn discarded(message: impl Into<String>) -> Self {
        HandlerError::Discarded(message.into())
    }
}

/// Handler trait for processing routed events
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Process a single event
    async fn handle(&self, event: &RoutedEvent) -> Result<(), HandlerError>;

    /// Called when event processing fails
    async fn on_error(&self, event: &RoutedEvent, error: &HandlerError) {
        warn!(
            event_id = %event.id,
            kind = %event.kind,
            key = %event.object_key,
            error = %error,
            "Event processing failed"
        );
    }
}

/// What happened to one message of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Discarded,
    DeadLettered,
    /// Left unacknowledged; visible again after the visibility timeout
    Retrying,
}

/// Per-batch counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub received: usize,
    pub acked: usize,
    pub discarded: usize,
    pub dead_lettered: usize,
    pub retrying: usize,
}

impl BatchOutcome {
    fn record(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Acked => self.acked += 1,
            Disposition::Discarded => self.discarded += 1,
            Disposition::DeadLettered => self.dead_lettered += 1,
            Disposition::Retrying => self.retrying += 1,
        }
    }
}

/// Drives an [`EventHandler`] from a [`WorkQueue`]
pub struct QueueConsumer {
    queue: Arc<WorkQueue>,
    handler: Arc<dyn EventHandler>,
    batch_size: usize,
    max_batching_window: Duration,
    receive_wait: Duration,
    processing_timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
    flush_tx: watch::Sender<bool>,
}

impl QueueConsumer {
    /// Create a consumer with the default delivery settings
    pub fn new(queue: Arc<WorkQueue>, handler: Arc<dyn EventHandler>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (flush_tx, _) = watch::channel(false);
        let mut consumer = Self {
            queue,
            handler,
            batch_size: 0,
            max_batching_window: Duration::ZERO,
            receive_wait: Duration::ZERO,
            processing_timeout: Duration::ZERO,
            shutdown_tx,
            flush_tx,
        };
        consumer.apply(&QueueConfig::default());
        consumer
    }

    fn apply(&mut self, config: &QueueConfig) {
        self.batch_size = config.batch_size.max(1);
        self.max_batching_window = config.max_batching_window();
        self.receive_wait = config.receive_wait();
        self.processing_timeout = config.processing_timeout();
    }

    /// Take batching and deadline settings from a queue configuration
    pub fn with_config(mut self, config: &QueueConfig) -> Self {
        self.apply(config);
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn max_batching_window(mut self, window: Duration) -> Self {
        self.max_batching_window = window;
        self
    }

    pub fn receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    pub fn processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal shutdown to stop consuming
    pub fn shutdown(&self) {
        info!(queue = %self.queue.name(), "Signaling consumer shutdown");
        let _ = self.shutdown_tx.send(());
    }

    /// Stop holding batches open for the batching window.
    ///
    /// Used while draining: every claimed message is handled right away.
    pub fn flush(&self) {
        debug!(queue = %self.queue.name(), "Flushing partial batches");
        self.flush_tx.send_replace(true);
    }

    /// Consume batches until shutdown is signalled.
    ///
    /// Shutdown only interrupts the wait for new messages. A batch that was
    /// already claimed is always handled and settled first.
    #[instrument(skip(self), fields(queue = %self.queue.name()))]
    pub async fn run(&self) {
        let mut shutdown_rx = self.shutdown_receiver();

        info!("Starting queue consumption loop");

        loop {
            // Cancelling receive is safe: messages are claimed only when it returns.
            let first = tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
                first = self.queue.receive(self.batch_size, self.receive_wait) => first,
            };
            if first.is_empty() {
                continue;
            }

            let outcome = self.settle(self.fill_batch(first).await).await;
            debug!(
                received = outcome.received,
                acked = outcome.acked,
                discarded = outcome.discarded,
                dead_lettered = outcome.dead_lettered,
                retrying = outcome.retrying,
                "Batch settled"
            );
        }
    }

    /// Gather and process one batch
    pub async fn poll_once(&self) -> BatchOutcome {
        let batch = self.queue.receive(self.batch_size, self.receive_wait).await;
        if batch.is_empty() {
            return BatchOutcome::default();
        }
        self.settle(self.fill_batch(batch).await).await
    }

    async fn settle(&self, batch: Vec<ReceivedMessage>) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            received: batch.len(),
            ..Default::default()
        };

        if batch.is_empty() {
            return outcome;
        }

        // Each message is settled on its own; siblings never share a fate.
        let dispositions = join_all(batch.into_iter().map(|message| self.process(message))).await;
        for disposition in dispositions {
            outcome.record(disposition);
        }

        outcome
    }

    /// Top up a started batch until it is full or the window closes
    async fn fill_batch(&self, mut batch: Vec<ReceivedMessage>) -> Vec<ReceivedMessage> {
        let mut flushed = self.flush_tx.subscribe();
        let window_end = Instant::now() + self.max_batching_window;

        while batch.len() < self.batch_size && !*flushed.borrow_and_update() {
            let remaining = window_end.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let more = tokio::select! {
                more = self.queue.receive(self.batch_size - batch.len(), remaining) => more,
                _ = flushed.changed() => continue,
            };
            if more.is_empty() {
                break;
            }
            batch.extend(more);
        }

        batch
    }

    #[instrument(
        skip(self, message),
        fields(
            event_id = %message.event.id,
            key = %message.event.object_key,
            receive_count = message.receive_count
        )
    )]
    async fn process(&self, message: ReceivedMessage) -> Disposition {
        let result = tokio::time::timeout(self.processing_timeout, self.handler.handle(&message.event)).await;

        let error = match result {
            Ok(Ok(())) => {
                self.queue.ack(message.receipt);
                metrics::counter!("pipeline.consumer.succeeded", "queue" => self.queue.name().to_string())
                    .increment(1);
                return Disposition::Acked;
            }
            Ok(Err(error)) => error,
            Err(_) => HandlerError::transient(format!(
                "processing deadline of {:?} exceeded",
                self.processing_timeout
            )),
        };

        self.handler.on_error(&message.event, &error).await;

        match error {
            HandlerError::Discarded(reason) => {
                info!(reason = %reason, "Dropping event");
                self.queue.ack(message.receipt);
                Disposition::Discarded
            }
            HandlerError::Rejected(reason) => match self.queue.dead_letter(message.receipt, &reason) {
                Ok(_) => Disposition::DeadLettered,
                Err(e) => {
                    error!(error = %e, reason = %reason, "Rejected event has nowhere to go, dropping it");
                    self.queue.ack(message.receipt);
                    Disposition::Discarded
                }
            },
            HandlerError::Transient(reason) => {
                debug!(reason = %reason, "Leaving event for redelivery");
                metrics::counter!("pipeline.consumer.retried", "queue" => self.queue.name().to_string())
                    .increment(1);
                Disposition::Retrying
            }
        }
    }
}
