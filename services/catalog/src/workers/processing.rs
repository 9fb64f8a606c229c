use super::store_failure;
use crate::objects::{ObjectError, ObjectStore};
use crate::record_store::RecordStore;
use async_trait::async_trait;
use chrono::Utc;
use shutter_pipeline::{EventHandler, EventKind, HandlerError, RoutedEvent, WorkQueue};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Validates uploaded objects and records them.
///
/// Unsupported extensions are rejected outright, so they go to the
/// dead-letter queue without using up the retry budget. Accepted uploads are
/// forwarded to the mailer queue once recorded.
pub struct ProcessingWorker {
    store: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
    mailer: Arc<WorkQueue>,
    allowed_extensions: Vec<String>,
}

impl ProcessingWorker {
    pub fn new(
        store: Arc<dyn RecordStore>,
        objects: Arc<dyn ObjectStore>,
        mailer: Arc<WorkQueue>,
        allowed_extensions: &[String],
    ) -> Self {
        Self {
            store,
            objects,
            mailer,
            allowed_extensions: allowed_extensions.iter().map(|e| e.to_ascii_lowercase()).collect(),
        }
    }

    pub fn accepts_extension(&self, event: &RoutedEvent) -> bool {
        event
            .extension()
            .map(|ext| self.allowed_extensions.iter().any(|allowed| *allowed == ext))
            .unwrap_or(false)
    }
}

#[async_trait]
impl EventHandler for ProcessingWorker {
    #[instrument(skip(self, event), fields(key = %event.object_key, bucket = %event.source_collection))]
    async fn handle(&self, event: &RoutedEvent) -> Result<(), HandlerError> {
        if event.kind != EventKind::Created {
            return Err(HandlerError::discarded(format!("{} event sent to processing", event.kind)));
        }

        if !self.accepts_extension(event) {
            metrics::counter!("catalog.uploads.rejected").increment(1);
            return Err(HandlerError::rejected(format!(
                "unsupported file type: {}",
                event.object_key
            )));
        }

        let info = self
            .objects
            .head(&event.source_collection, &event.object_key)
            .await
            .map_err(|e| match e {
                ObjectError::NotFound { .. } => HandlerError::discarded(e.to_string()),
                ObjectError::Unavailable(_) => HandlerError::transient(e.to_string()),
            })?;
        debug!(size_bytes = info.size_bytes, "Object confirmed");

        self.store
            .upsert(&event.object_key, &event.source_collection, Utc::now())
            .await
            .map_err(store_failure)?;

        self.mailer.enqueue(event.clone());

        info!("Upload recorded");
        metrics::counter!("catalog.records.upserted").increment(1);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{MockObjectStore, ObjectInfo};
    use crate::record_store::MemoryRecordStore;
    use std::time::Duration;

    fn worker(objects: MockObjectStore) -> (ProcessingWorker, Arc<MemoryRecordStore>, Arc<WorkQueue>) {
        let store = Arc::new(MemoryRecordStore::default());
        let mailer = Arc::new(WorkQueue::new("mailer", Duration::from_secs(30)));
        let worker = ProcessingWorker::new(
            store.clone(),
            Arc::new(objects),
            mailer.clone(),
            &["jpeg".to_string(), "png".to_string()],
        );
        (worker, store, mailer)
    }

    #[tokio::test]
    async fn test_valid_upload_is_recorded_and_forwarded() {
        let mut objects = MockObjectStore::new();
        objects
            .expect_head()
            .times(1)
            .returning(|_, _| Ok(ObjectInfo::default()));
        let (worker, store, mailer) = worker(objects);

        worker.handle(&RoutedEvent::created("images", "Beach.PNG")).await.unwrap();

        let record = store.get("Beach.PNG").await.unwrap().unwrap();
        assert_eq!(record.origin, "images");
        assert_eq!(mailer.len(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_extension_is_rejected_without_fetching() {
        let mut objects = MockObjectStore::new();
        objects.expect_head().never();
        let (worker, store, mailer) = worker(objects);

        let result = worker.handle(&RoutedEvent::created("images", "doc.pdf")).await;

        assert!(matches!(result, Err(HandlerError::Rejected(_))));
        assert!(store.is_empty());
        assert!(mailer.is_empty());
    }

    #[tokio::test]
    async fn test_object_errors_are_classified() {
        let mut objects = MockObjectStore::new();
        objects.expect_head().returning(|bucket, key| {
            if key.starts_with("gone") {
                Err(ObjectError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            } else {
                Err(ObjectError::Unavailable("connection reset".to_string()))
            }
        });
        let (worker, store, _mailer) = worker(objects);

        let missing = worker.handle(&RoutedEvent::created("images", "gone.png")).await;
        assert!(matches!(missing, Err(HandlerError::Discarded(_))));

        let flaky = worker.handle(&RoutedEvent::created("images", "a.jpeg")).await;
        assert!(matches!(flaky, Err(HandlerError::Transient(_))));

        assert!(store.is_empty());
    }
}
