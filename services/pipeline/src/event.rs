//! Routed event model for the Shutter pipeline.
//!
//! A [`RoutedEvent`] is the unit carried by topics and work queues. Raw change
//! notifications from the object store are decoded here, at the ingestion
//! boundary, so handlers only ever see typed, validated events.

use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Attribute stamped on every routed event by the ingestion gate.
pub const EVENT_KIND_ATTRIBUTE: &str = "eventKind";

/// Attribute carrying the comment type of a description update.
pub const COMMENT_TYPE_ATTRIBUTE: &str = "commentType";

/// Attribute mapping used by subscription filter policies
pub type Attributes = BTreeMap<String, String>;

/// Errors raised while decoding or validating events
#[derive(Error, Debug)]
pub enum EventError {
    #[error("Malformed event payload: {0}")]
    Malformed(String),

    #[error("Invalid event: {0}")]
    Invalid(String),

    #[error("Object key is not valid UTF-8 after decoding: {0}")]
    KeyEncoding(String),
}

/// Kind of change a routed event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Created,
    Deleted,
    DescriptionUpdated,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "Created",
            EventKind::Deleted => "Deleted",
            EventKind::DescriptionUpdated => "DescriptionUpdated",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event delivered through topics and queues
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutedEvent {
    /// Unique event ID, assigned when the change is observed
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// What happened to the object
    pub kind: EventKind,
    /// Collection (bucket) the object lives in
    #[serde(default)]
    pub source_collection: String,
    /// Decoded object key
    pub object_key: String,
    /// Attributes evaluated by subscription filters
    #[serde(default)]
    pub attributes: Attributes,
    /// New description, only present on description updates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// When the underlying change happened
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

impl RoutedEvent {
    fn new(kind: EventKind, source_collection: impl Into<String>, object_key: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            source_collection: source_collection.into(),
            object_key: object_key.into(),
            attributes: Attributes::new(),
            description: None,
            occurred_at: Utc::now(),
        }
    }

    /// Event for a newly created object
    pub fn created(source_collection: impl Into<String>, object_key: impl Into<String>) -> Self {
        Self::new(EventKind::Created, source_collection, object_key)
    }

    /// Event for a removed object
    pub fn deleted(source_collection: impl Into<String>, object_key: impl Into<String>) -> Self {
        Self::new(EventKind::Deleted, source_collection, object_key)
    }

    /// Event carrying a new description for an existing object
    pub fn description_updated(
        source_collection: impl Into<String>,
        object_key: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let mut event = Self::new(EventKind::DescriptionUpdated, source_collection, object_key);
        event.description = Some(description.into());
        event
    }

    /// Add an attribute
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Get an attribute value
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(|s| s.as_str())
    }

    /// Lowercased extension of the object key, if it has one
    pub fn extension(&self) -> Option<String> {
        let file_name = self.object_key.rsplit('/').next().unwrap_or(&self.object_key);
        match file_name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext.to_ascii_lowercase()),
            _ => None,
        }
    }

    /// Check structural invariants
    pub fn validate(&self) -> Result<(), EventError> {
        if self.object_key.is_empty() {
            return Err(EventError::Invalid("object key is empty".to_string()));
        }

        match (self.kind, &self.description) {
            (EventKind::DescriptionUpdated, None) => Err(EventError::Invalid(format!(
                "description update for {} carries no description",
                self.object_key
            ))),
            (EventKind::Created | EventKind::Deleted, Some(_)) => Err(EventError::Invalid(format!(
                "{} event for {} must not carry a description",
                self.kind, self.object_key
            ))),
            _ => Ok(()),
        }
    }

    /// Decode and validate an event envelope
    pub fn from_json(payload: &[u8]) -> Result<Self, EventError> {
        let event: RoutedEvent =
            serde_json::from_slice(payload).map_err(|e| EventError::Malformed(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    /// Encode the event envelope
    pub fn to_json(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(|e| EventError::Malformed(e.to_string()))
    }
}

/// Decode an object key as delivered by the object store.
///
/// `+` is translated to a literal space before percent-decoding, so an
/// encoded `%2B` still yields `+`.
pub fn decode_object_key(encoded: &str) -> Result<String, EventError> {
    let spaced = encoded.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|key| key.into_owned())
        .map_err(|e| EventError::KeyEncoding(format!("{encoded}: {e}")))
}

/// Change type reported by the object store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Created,
    Removed,
}

/// Flat ingress event: `{eventType, sourceCollection, objectKeyEncoded}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressEvent {
    pub event_type: ChangeType,
    pub source_collection: String,
    pub object_key_encoded: String,
}

impl IngressEvent {
    /// Convert into a routed event, decoding the object key
    pub fn into_routed(self) -> Result<RoutedEvent, EventError> {
        let key = decode_object_key(&self.object_key_encoded)?;
        let event = match self.event_type {
            ChangeType::Created => RoutedEvent::created(self.source_collection, key),
            ChangeType::Removed => RoutedEvent::deleted(self.source_collection, key),
        };
        event.validate()?;
        Ok(event)
    }
}

/// Object store notification in the `{"Records": [...]}` shape
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ObjectNotification {
    #[serde(default)]
    pub records: Vec<NotificationRecord>,
}

/// One record of an object store notification
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub event_name: String,
    pub s3: ObjectEntity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectEntity {
    pub bucket: BucketRef,
    pub object: ObjectRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BucketRef {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectRef {
    pub key: String,
}

impl NotificationRecord {
    /// Map the record onto a flat ingress event
    pub fn to_ingress(&self) -> Result<IngressEvent, EventError> {
        let event_type = if self.event_name.starts_with("ObjectCreated") {
            ChangeType::Created
        } else if self.event_name.starts_with("ObjectRemoved") {
            ChangeType::Removed
        } else {
            return Err(EventError::Invalid(format!(
                "unsupported object store event {}",
                self.event_name
            )));
        };

        Ok(IngressEvent {
            event_type,
            source_collection: self.s3.bucket.name.clone(),
            object_key_encoded: self.s3.object.key.clone(),
        })
    }
}

/// Any payload accepted at the ingestion boundary
#[derive(Debug, Clone)]
pub enum IngressPayload {
    Single(IngressEvent),
    Notification(ObjectNotification),
}

impl IngressPayload {
    /// Decode a payload, picking the shape by its top-level fields.
    ///
    /// `Records` selects the notification shape and `eventType` the flat one.
    /// An object with neither decodes as an empty notification.
    pub fn from_json(payload: &[u8]) -> Result<Self, EventError> {
        let value: serde_json::Value = serde_json::from_slice(payload).map_err(malformed)?;
        let fields = value
            .as_object()
            .ok_or_else(|| EventError::Malformed("payload is not a JSON object".to_string()))?;

        if fields.contains_key("Records") {
            serde_json::from_value(value).map(IngressPayload::Notification).map_err(malformed)
        } else if fields.contains_key("eventType") {
            serde_json::from_value(value).map(IngressPayload::Single).map_err(malformed)
        } else {
            Ok(IngressPayload::Notification(ObjectNotification::default()))
        }
    }
}

fn malformed(e: serde_json::Error) -> EventError {
    EventError::Malformed(e.to_string())
}

/// Description update message: `{name, description}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptionUpdate {
    /// Object key the description applies to
    pub name: String,
    pub description: String,
    /// Collection of the object, when the producer knows it
    #[serde(default, alias = "sourceCollection")]
    pub bucket: Option<String>,
}

impl DescriptionUpdate {
    pub fn from_json(payload: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(payload).map_err(|e| EventError::Malformed(e.to_string()))
    }

    /// Convert into a routed event tagged with the comment type
    pub fn into_routed(self, comment_type: Option<&str>) -> Result<RoutedEvent, EventError> {
        let mut event =
            RoutedEvent::description_updated(self.bucket.unwrap_or_default(), self.name, self.description);
        if let Some(comment_type) = comment_type {
            event = event.with_attribute(COMMENT_TYPE_ATTRIBUTE, comment_type);
        }
        event.validate()?;
        Ok(event)
    }
}
