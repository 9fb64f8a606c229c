use super::store_failure;
use crate::record_store::{RecordField, RecordStore};
use async_trait::async_trait;
use shutter_pipeline::{EventHandler, HandlerError, RoutedEvent};
use std::sync::Arc;
use tracing::{info, instrument};

/// Applies caption edits to existing records
pub struct UpdateWorker {
    store: Arc<dyn RecordStore>,
}

impl UpdateWorker {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for UpdateWorker {
    #[instrument(skip(self, event), fields(key = %event.object_key))]
    async fn handle(&self, event: &RoutedEvent) -> Result<(), HandlerError> {
        let description = event
            .description
            .as_deref()
            .ok_or_else(|| HandlerError::rejected("description update without a description"))?;

        self.store
            .set_field(&event.object_key, RecordField::Description, description)
            .await
            .map_err(store_failure)?;

        info!("Description updated");
        metrics::counter!("catalog.records.described").increment(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_store::MemoryRecordStore;
    use chrono::Utc;

    #[tokio::test]
    async fn test_update_existing_record() {
        let store = Arc::new(MemoryRecordStore::default());
        store.upsert("a.png", "images", Utc::now()).await.unwrap();
        let worker = UpdateWorker::new(store.clone());

        worker
            .handle(&RoutedEvent::description_updated("images", "a.png", "Sunset"))
            .await
            .unwrap();

        let record = store.get("a.png").await.unwrap().unwrap();
        assert_eq!(record.description.as_deref(), Some("Sunset"));
    }

    #[tokio::test]
    async fn test_unknown_key_is_discarded() {
        let store = Arc::new(MemoryRecordStore::default());
        let worker = UpdateWorker::new(store.clone());

        let result = worker
            .handle(&RoutedEvent::description_updated("images", "ghost.png", "Sunset"))
            .await;

        assert!(matches!(result, Err(HandlerError::Discarded(_))));
        assert!(store.is_empty());
    }
}
