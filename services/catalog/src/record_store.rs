//! Record store: one record per object key.
//!
//! [`RecordStore`] is the read/write contract used by the workers and the
//! change-stream watcher. Every mutation is published as a [`RecordChange`]
//! on the store's [`ChangeFeed`], whichever path performed it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

/// Errors that can occur in a record store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("No record for key {0}")]
    NotFound(String),

    #[error("Record store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid table name: {0}")]
    InvalidTableName(String),

    #[error("Failed to decode change notification: {0}")]
    Decode(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Catalog entry for one uploaded object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Object key, immutable
    pub key: String,
    /// Collection the object was uploaded to
    pub origin: String,
    #[serde(alias = "processed_at")]
    pub processed_at: DateTime<Utc>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Mutable record fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordField {
    Description,
    Origin,
}

impl RecordField {
    /// Column name in the record table
    pub fn column(&self) -> &'static str {
        match self {
            RecordField::Description => "description",
            RecordField::Origin => "origin",
        }
    }
}

impl fmt::Display for RecordField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// Mutation observed on the record table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordChange {
    Insert { key: String },
    Modify {
        key: String,
        /// Set when this mutation changed the description
        new_description: Option<String>,
    },
    Remove { key: String },
}

impl RecordChange {
    /// Key of the affected record
    pub fn key(&self) -> &str {
        match self {
            RecordChange::Insert { key } | RecordChange::Modify { key, .. } | RecordChange::Remove { key } => key,
        }
    }
}

/// Lossless fan-out of record changes.
///
/// Every subscriber gets its own unbounded channel, so a slow subscriber
/// delays its own changes but never loses them.
#[derive(Default)]
pub struct ChangeFeed {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<RecordChange>>>,
}

impl ChangeFeed {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RecordChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Send a change to every live subscriber, forgetting dropped ones
    pub fn publish(&self, change: RecordChange) {
        self.subscribers.lock().retain(|tx| tx.send(change.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Read/write contract of the record table
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create or replace the record for `key`, keeping any description
    async fn upsert(&self, key: &str, origin: &str, processed_at: DateTime<Utc>) -> Result<Record, StoreError>;

    /// Set one field of an existing record
    async fn set_field(&self, key: &str, field: RecordField, value: &str) -> Result<Record, StoreError>;

    /// Remove the record; `None` when there was nothing to remove
    async fn delete(&self, key: &str) -> Result<Option<Record>, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Record>, StoreError>;

    /// Subscribe to the change stream
    fn subscribe(&self) -> mpsc::UnboundedReceiver<RecordChange>;

    /// Check that the store is reachable
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-process record store
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<String, Record>>,
    changes: ChangeFeed,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    #[instrument(skip(self))]
    async fn upsert(&self, key: &str, origin: &str, processed_at: DateTime<Utc>) -> Result<Record, StoreError> {
        let (previous, record) = {
            let mut records = self.records.write();
            let previous = records.get(key).cloned();
            let record = Record {
                key: key.to_string(),
                origin: origin.to_string(),
                processed_at,
                description: previous.as_ref().and_then(|r| r.description.clone()),
            };
            records.insert(key.to_string(), record.clone());
            (previous, record)
        };

        debug!(key, replaced = previous.is_some(), "Record upserted");
        self.changes.publish(match previous {
            Some(_) => RecordChange::Modify {
                key: key.to_string(),
                new_description: None,
            },
            None => RecordChange::Insert { key: key.to_string() },
        });
        Ok(record)
    }

    #[instrument(skip(self, value))]
    async fn set_field(&self, key: &str, field: RecordField, value: &str) -> Result<Record, StoreError> {
        let (old, new) = {
            let mut records = self.records.write();
            let record = records
                .get_mut(key)
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            let old = record.clone();

            match field {
                RecordField::Description => record.description = Some(value.to_string()),
                RecordField::Origin => record.origin = value.to_string(),
            }
            (old, record.clone())
        };

        let new_description = if old.description != new.description {
            new.description.clone()
        } else {
            None
        };
        self.changes.publish(RecordChange::Modify {
            key: key.to_string(),
            new_description,
        });
        Ok(new)
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<Option<Record>, StoreError> {
        let removed = self.records.write().remove(key);

        if removed.is_some() {
            self.changes.publish(RecordChange::Remove { key: key.to_string() });
        }
        Ok(removed)
    }

    async fn get(&self, key: &str) -> Result<Option<Record>, StoreError> {
        Ok(self.records.read().get(key).cloned())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<RecordChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_is_idempotent_and_keeps_description() {
        let store = MemoryRecordStore::default();

        store.upsert("a.png", "images", Utc::now()).await.unwrap();
        store
            .set_field("a.png", RecordField::Description, "Sunset")
            .await
            .unwrap();
        let record = store.upsert("a.png", "images", Utc::now()).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(record.description.as_deref(), Some("Sunset"));
    }

    #[tokio::test]
    async fn test_set_field_on_unknown_key() {
        let store = MemoryRecordStore::default();

        let result = store.set_field("ghost.png", RecordField::Description, "x").await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_change_stream() {
        let store = MemoryRecordStore::default();
        let mut changes = store.subscribe();

        store.upsert("a.png", "images", Utc::now()).await.unwrap();
        store.upsert("a.png", "images", Utc::now()).await.unwrap();
        assert!(store.delete("a.png").await.unwrap().is_some());
        assert!(store.delete("a.png").await.unwrap().is_none());

        assert!(matches!(changes.recv().await.unwrap(), RecordChange::Insert { .. }));
        assert!(matches!(
            changes.recv().await.unwrap(),
            RecordChange::Modify { new_description: None, .. }
        ));
        assert_eq!(changes.recv().await.unwrap(), RecordChange::Remove { key: "a.png".to_string() });
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_description_changes_are_flagged() {
        let store = MemoryRecordStore::new();
        store.upsert("a.png", "images", Utc::now()).await.unwrap();
        let mut changes = store.subscribe();

        store.set_field("a.png", RecordField::Description, "Sunset").await.unwrap();
        store.set_field("a.png", RecordField::Description, "Sunset").await.unwrap();

        assert_eq!(
            changes.recv().await.unwrap(),
            RecordChange::Modify {
                key: "a.png".to_string(),
                new_description: Some("Sunset".to_string()),
            }
        );
        assert!(matches!(
            changes.recv().await.unwrap(),
            RecordChange::Modify { new_description: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_change_feed_keeps_every_change_and_forgets_dropped_subscribers() {
        let store = MemoryRecordStore::new();
        let mut kept = store.subscribe();
        drop(store.subscribe());

        for i in 0..5000 {
            let key = format!("{i}.png");
            store.upsert(&key, "images", Utc::now()).await.unwrap();
            store.delete(&key).await.unwrap();
        }

        let mut received = 0;
        while kept.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 10_000);
        assert_eq!(store.changes.subscriber_count(), 1);
    }

    #[test]
    fn test_record_json_shape() {
        let record: Record = serde_json::from_str(
            r#"{"key": "a.png", "origin": "images", "processed_at": "2024-05-01T10:00:00Z", "description": null}"#,
        )
        .unwrap();
        assert_eq!(record.origin, "images");

        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("processedAt").is_some());
    }
}
