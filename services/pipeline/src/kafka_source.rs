//! Kafka ingress source.
//!
//! Reads raw object change notifications and description updates from the
//! object events topic and hands them to the [`IngestionGate`]. Offsets are
//! committed only after the gate has published the message.

use crate::config::KafkaConfig;
use crate::gate::{IngestionGate, IngressError};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message as KafkaMessage};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

/// Header naming the kind of message on the object events topic
pub const MESSAGE_TYPE_HEADER: &str = "message-type";

/// Header carrying the comment type of a description update
pub const COMMENT_TYPE_HEADER: &str = "comment-type";

/// `message-type` value marking description updates
pub const DESCRIPTION_UPDATE_MESSAGE: &str = "description_update";

/// Errors raised by the Kafka ingress source
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Failed to commit offset: {0}")]
    CommitError(String),
}

/// Raw message as read from the topic
#[derive(Debug, Clone)]
pub struct IngressMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl IngressMessage {
    /// Get a header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|s| s.as_str())
    }

    pub fn is_description_update(&self) -> bool {
        self.header(MESSAGE_TYPE_HEADER) == Some(DESCRIPTION_UPDATE_MESSAGE)
    }
}

/// Hand one ingress message to the gate.
///
/// Returns the number of routed events published.
pub async fn forward(gate: &IngestionGate, message: &IngressMessage) -> Result<usize, IngressError> {
    if message.is_description_update() {
        gate.ingest_description_update(&message.payload, message.header(COMMENT_TYPE_HEADER))
            .await
            .map(|_| 1)
    } else {
        gate.ingest(&message.payload).await.map(|reports| reports.len())
    }
}

/// Kafka consumer feeding the ingestion gate
pub struct KafkaIngressSource {
    consumer: StreamConsumer,
    config: Arc<KafkaConfig>,
    gate: Arc<IngestionGate>,
    shutdown_tx: broadcast::Sender<()>,
}

impl KafkaIngressSource {
    /// Create a new source with the given configuration
    pub fn new(config: KafkaConfig, gate: Arc<IngestionGate>) -> Result<Self, SourceError> {
        info!(
            brokers = %config.bootstrap_servers,
            group_id = %config.consumer.group_id,
            "Creating Kafka ingress consumer"
        );

        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| SourceError::CreationError(e.to_string()))?;

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            consumer,
            config: Arc::new(config),
            gate,
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    /// Subscribe to the object events topic
    pub fn subscribe(&self) -> Result<(), SourceError> {
        let topic = self.config.topics.object_events.as_str();
        info!(topic, "Subscribing to object events");
        self.consumer
            .subscribe(&[topic])
            .map_err(|e| SourceError::SubscriptionError(e.to_string()))
    }

    /// Commit the current offsets synchronously
    pub fn commit(&self) -> Result<(), SourceError> {
        self.consumer
            .commit_consumer_state(CommitMode::Sync)
            .map_err(|e| SourceError::CommitError(e.to_string()))
    }

    fn commit_async(&self) {
        if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Async) {
            warn!(error = %e, "Failed to commit offsets asynchronously");
        }
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal shutdown to stop consuming
    pub fn shutdown(&self) {
        info!("Signaling ingress shutdown");
        let _ = self.shutdown_tx.send(());
    }

    /// Consume until shutdown, forwarding every message to the gate
    #[instrument(skip(self), fields(topic = %self.config.topics.object_events))]
    pub async fn run(&self) -> Result<(), SourceError> {
        use tokio_stream::StreamExt;

        let mut shutdown_rx = self.shutdown_receiver();
        let stream = self.consumer.stream();
        tokio::pin!(stream);

        info!("Starting ingress consumption loop");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
                message_result = stream.next() => {
                    match message_result {
                        Some(Ok(borrowed_message)) => {
                            let message = convert_message(&borrowed_message);
                            debug!(
                                partition = message.partition,
                                offset = message.offset,
                                "Received ingress message"
                            );

                            match forward(&self.gate, &message).await {
                                Ok(published) => {
                                    debug!(published, "Ingress message published");
                                }
                                Err(IngressError::Empty) => {
                                    warn!(offset = message.offset, "Payload contains no recognizable records, dropping");
                                }
                                Err(e) => {
                                    // Redelivery cannot fix a malformed payload.
                                    error!(offset = message.offset, error = %e, "Rejecting ingress message");
                                    metrics::counter!("pipeline.ingress.rejected").increment(1);
                                }
                            }

                            self.commit_async();
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Kafka error");
                        }
                        None => {
                            debug!("Stream ended");
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = self.commit() {
            warn!(error = %e, "Failed to commit on shutdown");
        }

        Ok(())
    }
}

fn convert_message<M: KafkaMessage>(msg: &M) -> IngressMessage {
    let mut headers = HashMap::new();
    if let Some(h) = msg.headers() {
        for header in h.iter() {
            if let Some(value) = header.value {
                if let Ok(v) = String::from_utf8(value.to_vec()) {
                    headers.insert(header.key.to_string(), v);
                }
            }
        }
    }

    IngressMessage {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
        payload: msg.payload().unwrap_or(&[]).to_vec(),
        headers,
    }
}
