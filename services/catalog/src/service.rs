//! Wiring of the catalog pipeline.
//!
//! ```text
//! ingress ─▶ gate ─▶ topic "image-events"
//!                     ├─ image-process (eventKind=Created) ─▶ queue ─▶ processing ─▶ mailer queue ─▶ accepted mail
//!                     │                                         └─ dead-letter queue ─▶ rejected mail
//!                     ├─ record-delete (eventKind=Deleted) ─▶ deletion worker
//!                     └─ record-update (eventKind=DescriptionUpdated, commentType=Caption) ─▶ update worker
//! record store changes ─▶ watcher ─▶ deleted / description mail
//! ```

use crate::mailer::{MailDispatcher, MailPath, MailQueueHandler};
use crate::notifier::Notifier;
use crate::objects::ObjectStore;
use crate::record_store::RecordStore;
use crate::watcher::ChangeStreamWatcher;
use crate::workers::{DeletionWorker, ProcessingWorker, UpdateWorker};
use shutter_pipeline::{
    FilterPolicy, HandlerSubscriber, IngestionGate, QueueConfig, QueueConsumer, QueueStats, Topic, WorkQueue,
    COMMENT_TYPE_ATTRIBUTE, EVENT_KIND_ATTRIBUTE,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

pub const TOPIC_NAME: &str = "image-events";
pub const PROCESS_QUEUE: &str = "image-process";
pub const DEAD_LETTER_QUEUE: &str = "image-process-dlq";
pub const MAILER_QUEUE: &str = "mailer";

pub const PROCESS_SUBSCRIPTION: &str = "image-process";
pub const DELETE_SUBSCRIPTION: &str = "record-delete";
pub const UPDATE_SUBSCRIPTION: &str = "record-update";

/// Comment type routed to the update worker
pub const CAPTION_COMMENT_TYPE: &str = "Caption";

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Process-wide clients shared by every component
#[derive(Clone)]
pub struct Clients {
    pub store: Arc<dyn RecordStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub notifier: Arc<dyn Notifier>,
}

/// Fully wired catalog pipeline
pub struct Catalog {
    store: Arc<dyn RecordStore>,
    gate: Arc<IngestionGate>,
    process_queue: Arc<WorkQueue>,
    dead_letter_queue: Arc<WorkQueue>,
    mailer_queue: Arc<WorkQueue>,
    consumers: Vec<Arc<QueueConsumer>>,
    watcher: Arc<ChangeStreamWatcher>,
}

impl Catalog {
    pub fn new(clients: Clients, queue: &QueueConfig, allowed_extensions: &[String]) -> Self {
        let dispatcher = Arc::new(MailDispatcher::new(clients.notifier.clone()));
        let watcher = Arc::new(ChangeStreamWatcher::new(clients.store.as_ref(), dispatcher.clone()));

        let dead_letter_queue = Arc::new(WorkQueue::new(DEAD_LETTER_QUEUE, queue.visibility_timeout()));
        let process_queue = Arc::new(
            WorkQueue::new(PROCESS_QUEUE, queue.visibility_timeout())
                .with_dead_letter(dead_letter_queue.clone(), queue.max_receive_count),
        );
        let mailer_queue = Arc::new(WorkQueue::new(MAILER_QUEUE, queue.visibility_timeout()));

        let processing = Arc::new(ProcessingWorker::new(
            clients.store.clone(),
            clients.objects.clone(),
            mailer_queue.clone(),
            allowed_extensions,
        ));

        let topic = Arc::new(Topic::new(TOPIC_NAME));
        topic.subscribe(
            PROCESS_SUBSCRIPTION,
            Some(FilterPolicy::allow(EVENT_KIND_ATTRIBUTE, ["Created"])),
            process_queue.clone(),
        );
        topic.subscribe(
            DELETE_SUBSCRIPTION,
            Some(FilterPolicy::allow(EVENT_KIND_ATTRIBUTE, ["Deleted"])),
            Arc::new(HandlerSubscriber::new(Arc::new(DeletionWorker::new(clients.store.clone())))),
        );
        topic.subscribe(
            UPDATE_SUBSCRIPTION,
            Some(
                FilterPolicy::allow(EVENT_KIND_ATTRIBUTE, ["DescriptionUpdated"])
                    .and_allow(COMMENT_TYPE_ATTRIBUTE, [CAPTION_COMMENT_TYPE]),
            ),
            Arc::new(HandlerSubscriber::new(Arc::new(UpdateWorker::new(clients.store.clone())))),
        );

        let consumers = vec![
            Arc::new(QueueConsumer::new(process_queue.clone(), processing).with_config(queue)),
            Arc::new(
                QueueConsumer::new(
                    mailer_queue.clone(),
                    Arc::new(MailQueueHandler::new(dispatcher.clone(), MailPath::Accepted)),
                )
                .with_config(queue),
            ),
            Arc::new(
                QueueConsumer::new(
                    dead_letter_queue.clone(),
                    Arc::new(MailQueueHandler::new(dispatcher, MailPath::Rejected)),
                )
                .with_config(queue),
            ),
        ];

        Self {
            store: clients.store,
            gate: Arc::new(IngestionGate::new(topic)),
            process_queue,
            dead_letter_queue,
            mailer_queue,
            consumers,
            watcher,
        }
    }

    pub fn gate(&self) -> &Arc<IngestionGate> {
        &self.gate
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn process_queue(&self) -> &Arc<WorkQueue> {
        &self.process_queue
    }

    pub fn dead_letter_queue(&self) -> &Arc<WorkQueue> {
        &self.dead_letter_queue
    }

    /// Stats of every queue
    pub fn queue_stats(&self) -> Vec<QueueStats> {
        [&self.process_queue, &self.dead_letter_queue, &self.mailer_queue]
            .iter()
            .map(|queue| queue.stats())
            .collect()
    }

    /// Spawn the queue consumers and the watcher
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.consumers.len() + 1);

        for consumer in &self.consumers {
            let consumer = consumer.clone();
            handles.push(tokio::spawn(async move { consumer.run().await }));
        }

        let watcher = self.watcher.clone();
        handles.push(tokio::spawn(async move { watcher.run().await }));

        info!(consumers = self.consumers.len(), "Catalog pipeline started");
        handles
    }

    /// Let the consumers work off every queue, waiting at most `grace`.
    ///
    /// Call after ingress has stopped and before [`shutdown`](Self::shutdown).
    /// Returns whether every queue emptied in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        for consumer in &self.consumers {
            consumer.flush();
        }

        let deadline = Instant::now() + grace;
        loop {
            let pending: usize = self.queue_stats().iter().map(|stats| stats.total).sum();
            if pending == 0 {
                info!("Queues drained");
                return true;
            }
            if Instant::now() >= deadline {
                warn!(pending, "Queues not drained within the grace period");
                return false;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Signal every spawned component to stop
    pub fn shutdown(&self) {
        for consumer in &self.consumers {
            consumer.shutdown();
        }
        self.watcher.shutdown();
    }
}
