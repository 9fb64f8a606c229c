//! Ingestion gate: the boundary between raw change notifications and the
//! routed event world.
//!
//! Payloads are decoded and validated here. Every accepted event is stamped
//! with the `eventKind` attribute before being published to the topic.

use crate::event::{DescriptionUpdate, EventError, IngressPayload, RoutedEvent, EVENT_KIND_ATTRIBUTE};
use crate::router::{PublishReport, Topic};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Errors raised at the ingestion boundary
#[derive(Error, Debug)]
pub enum IngressError {
    #[error(transparent)]
    Event(#[from] EventError),

    #[error("Payload contains no recognizable records")]
    Empty,
}

/// Decodes ingress payloads and publishes them as routed events
pub struct IngestionGate {
    topic: Arc<Topic>,
}

impl IngestionGate {
    pub fn new(topic: Arc<Topic>) -> Self {
        Self { topic }
    }

    pub fn topic(&self) -> &Arc<Topic> {
        &self.topic
    }

    /// Ingest an object store change payload.
    ///
    /// Accepts both the flat ingress shape and the `Records` notification
    /// shape. Records of unsupported event types are skipped; a payload with
    /// nothing routable is reported as [`IngressError::Empty`].
    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    pub async fn ingest(&self, payload: &[u8]) -> Result<Vec<PublishReport>, IngressError> {
        let events = match IngressPayload::from_json(payload)? {
            IngressPayload::Single(ingress) => vec![ingress.into_routed()?],
            IngressPayload::Notification(notification) => {
                let mut events = Vec::with_capacity(notification.records.len());
                for record in &notification.records {
                    match record.to_ingress().and_then(|ingress| ingress.into_routed()) {
                        Ok(event) => events.push(event),
                        Err(e) => {
                            warn!(event_name = %record.event_name, error = %e, "Skipping notification record");
                        }
                    }
                }
                events
            }
        };

        if events.is_empty() {
            metrics::counter!("pipeline.gate.empty_payloads").increment(1);
            return Err(IngressError::Empty);
        }

        let mut reports = Vec::with_capacity(events.len());
        for event in events {
            reports.push(self.submit(event).await?);
        }
        Ok(reports)
    }

    /// Ingest a description update, tagged with its comment type
    #[instrument(skip(self, payload), fields(comment_type = comment_type.unwrap_or("")))]
    pub async fn ingest_description_update(
        &self,
        payload: &[u8],
        comment_type: Option<&str>,
    ) -> Result<PublishReport, IngressError> {
        let event = DescriptionUpdate::from_json(payload)?.into_routed(comment_type)?;
        self.submit(event).await
    }

    /// Validate, stamp and publish an already-typed event
    pub async fn submit(&self, event: RoutedEvent) -> Result<PublishReport, IngressError> {
        event.validate()?;

        let kind = event.kind;
        let event = event.with_attribute(EVENT_KIND_ATTRIBUTE, kind.as_str());

        debug!(event_id = %event.id, kind = %kind, key = %event.object_key, "Publishing event");
        metrics::counter!("pipeline.gate.events", "kind" => kind.as_str()).increment(1);

        Ok(self.topic.publish(&event).await)
    }
}
