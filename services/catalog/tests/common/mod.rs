#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use shutter_catalog::{
    Catalog, Clients, MemoryRecordStore, NotificationKind, NotificationMessage, Notifier, NotifyError, ObjectError,
    ObjectInfo, ObjectStore,
};
use shutter_pipeline::QueueConfig;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Notifier that keeps every message it was asked to send
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<NotificationMessage>>,
}

impl RecordingNotifier {
    pub fn count(&self, kind: NotificationKind) -> usize {
        self.sent.lock().iter().filter(|m| m.kind == kind).count()
    }

    pub fn count_for(&self, kind: NotificationKind, key: &str) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.kind == kind && m.key == key)
            .count()
    }

    pub fn messages(&self) -> Vec<NotificationMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: &NotificationMessage) -> Result<(), NotifyError> {
        self.sent.lock().push(message.clone());
        Ok(())
    }
}

/// Object store where every object exists unless told otherwise
#[derive(Default)]
pub struct StubObjectStore {
    missing: Mutex<HashSet<String>>,
    unavailable: Mutex<bool>,
    heads: AtomicUsize,
}

impl StubObjectStore {
    pub fn unavailable() -> Self {
        let store = Self::default();
        *store.unavailable.lock() = true;
        store
    }

    pub fn remove(&self, key: &str) {
        self.missing.lock().insert(key.to_string());
    }

    pub fn head_calls(&self) -> usize {
        self.heads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for StubObjectStore {
    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectInfo, ObjectError> {
        self.heads.fetch_add(1, Ordering::SeqCst);

        if *self.unavailable.lock() {
            return Err(ObjectError::Unavailable("connection refused".to_string()));
        }
        if self.missing.lock().contains(key) {
            return Err(ObjectError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        Ok(ObjectInfo {
            size_bytes: 1024,
            content_type: Some("image/png".to_string()),
            e_tag: None,
        })
    }
}

pub struct Harness {
    pub catalog: Arc<Catalog>,
    pub store: Arc<MemoryRecordStore>,
    pub objects: Arc<StubObjectStore>,
    pub notifier: Arc<RecordingNotifier>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_objects(StubObjectStore::default())
    }

    pub fn with_objects(objects: StubObjectStore) -> Self {
        let queue = QueueConfig {
            max_receive_count: 2,
            visibility_timeout_secs: 30,
            batch_size: 5,
            max_batching_window_secs: 0,
            receive_wait_secs: 1,
            processing_timeout_secs: 15,
        };
        Self::build(objects, &queue)
    }

    /// Harness running the production queue settings
    pub fn with_queue(queue: &QueueConfig) -> Self {
        Self::build(StubObjectStore::default(), queue)
    }

    fn build(objects: StubObjectStore, queue: &QueueConfig) -> Self {
        let store = Arc::new(MemoryRecordStore::default());
        let objects = Arc::new(objects);
        let notifier = Arc::new(RecordingNotifier::default());

        let clients = Clients {
            store: store.clone(),
            objects: objects.clone(),
            notifier: notifier.clone(),
        };
        let catalog = Arc::new(Catalog::new(
            clients,
            queue,
            &["jpeg".to_string(), "png".to_string()],
        ));
        let workers = catalog.start();

        Self {
            catalog,
            store,
            objects,
            notifier,
            workers: Mutex::new(workers),
        }
    }

    /// Drain, then stop every worker; returns whether the queues drained
    pub async fn stop(&self, grace: Duration) -> bool {
        let drained = self.catalog.drain(grace).await;
        self.catalog.shutdown();

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            worker.await.unwrap();
        }
        drained
    }

    pub async fn object_created(&self, key: &str) {
        let payload = format!(
            r#"{{"eventType": "created", "sourceCollection": "images", "objectKeyEncoded": "{key}"}}"#
        );
        self.catalog.gate().ingest(payload.as_bytes()).await.unwrap();
    }

    pub async fn object_removed(&self, key: &str) {
        let payload = format!(
            r#"{{"eventType": "removed", "sourceCollection": "images", "objectKeyEncoded": "{key}"}}"#
        );
        self.catalog.gate().ingest(payload.as_bytes()).await.unwrap();
    }

    pub async fn caption(&self, key: &str, description: &str, comment_type: &str) {
        let payload = serde_json::json!({ "name": key, "description": description }).to_string();
        self.catalog
            .gate()
            .ingest_description_update(payload.as_bytes(), Some(comment_type))
            .await
            .unwrap();
    }

    /// Let consumers, redeliveries and the watcher run
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_secs(120)).await;
    }
}
