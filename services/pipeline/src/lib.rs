//! Shutter Pipeline - event routing and delivery for the Shutter image catalog
//!
//! This library provides the transport side of the catalog: object store
//! change notifications come in through the [`IngestionGate`], fan out over a
//! [`Topic`] to filtered subscriptions and are delivered either directly to a
//! handler or through a [`WorkQueue`] with a dead-letter queue.
//!
//! - Typed routed events, decoded and validated at the boundary
//! - Attribute filter policies evaluated per subscription
//! - At-least-once work queues with visibility timeout and redrive
//! - A batching queue consumer with per-message settlement
//! - A Kafka ingress source
//!
//! # Example
//!
//! ```rust,no_run
//! use shutter_pipeline::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let topic = Arc::new(Topic::new("image-events"));
//!     let queue = Arc::new(WorkQueue::new("image-process", Duration::from_secs(30)));
//!     topic.subscribe(
//!         "image-process",
//!         Some(FilterPolicy::allow(EVENT_KIND_ATTRIBUTE, ["Created"])),
//!         queue.clone(),
//!     );
//!
//!     let gate = IngestionGate::new(topic);
//!     gate.ingest(br#"{"eventType":"created","sourceCollection":"images","objectKeyEncoded":"a.png"}"#)
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod event;
pub mod gate;
pub mod kafka_source;
pub mod queue;
pub mod router;

// Re-export main types
pub use config::{
    ConfigError, ConsumerConfig, KafkaConfig, QueueConfig, SaslConfig, SaslMechanism, SecurityProtocol,
    SslConfig, TopicConfig,
};
pub use consumer::{BatchOutcome, Disposition, EventHandler, HandlerError, QueueConsumer};
pub use event::{
    decode_object_key, Attributes, DescriptionUpdate, EventError, EventKind, IngressEvent, IngressPayload,
    RoutedEvent, COMMENT_TYPE_ATTRIBUTE, EVENT_KIND_ATTRIBUTE,
};
pub use gate::{IngestionGate, IngressError};
pub use kafka_source::{IngressMessage, KafkaIngressSource, SourceError};
pub use queue::{QueueError, QueueStats, Receipt, ReceivedMessage, WorkQueue};
pub use router::{
    AttributeFilter, DeliveryError, FilterPolicy, HandlerSubscriber, PublishReport, RetryPolicy, Subscriber, Topic,
};

/// Async trait for handlers (re-export for convenience)
pub use async_trait::async_trait;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::consumer::{EventHandler, HandlerError, QueueConsumer};
    pub use crate::event::{EventKind, RoutedEvent, COMMENT_TYPE_ATTRIBUTE, EVENT_KIND_ATTRIBUTE};
    pub use crate::gate::IngestionGate;
    pub use crate::queue::WorkQueue;
    pub use crate::router::{FilterPolicy, HandlerSubscriber, Topic};
    pub use async_trait::async_trait;
}
