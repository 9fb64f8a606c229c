use super::store_failure;
use crate::record_store::RecordStore;
use async_trait::async_trait;
use shutter_pipeline::{EventHandler, HandlerError, RoutedEvent};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Removes the record of a deleted object.
///
/// The deletion notification is left to the change-stream watcher.
pub struct DeletionWorker {
    store: Arc<dyn RecordStore>,
}

impl DeletionWorker {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for DeletionWorker {
    #[instrument(skip(self, event), fields(key = %event.object_key))]
    async fn handle(&self, event: &RoutedEvent) -> Result<(), HandlerError> {
        match self.store.delete(&event.object_key).await.map_err(store_failure)? {
            Some(_) => {
                info!("Record deleted");
                metrics::counter!("catalog.records.deleted").increment(1);
            }
            None => debug!("No record to delete"),
        }
        Ok(())
    }
}
