//! Transport configuration for the Shutter pipeline.
//!
//! This module provides configuration structures for the Kafka ingress
//! source (with SSL/SASL support) and for work queue delivery: visibility
//! timeout, redrive threshold and batching windows.

use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Security protocol for Kafka connections
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }
}

/// SASL mechanism for authentication
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaslMechanism {
    #[default]
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// SSL/TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SslConfig {
    /// Path to CA certificate file
    pub ca_location: Option<String>,
    /// Path to client certificate file
    pub certificate_location: Option<String>,
    /// Path to client private key file
    pub key_location: Option<String>,
}

/// SASL authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SaslConfig {
    #[serde(default)]
    pub mechanism: SaslMechanism,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Consumer group settings for the ingress source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Consumer group ID
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Auto offset reset: earliest, latest, none
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,
    /// Maximum poll interval in milliseconds
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval_ms: u64,
}

fn default_group_id() -> String {
    "shutter-catalog".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout() -> u64 {
    30000
}

fn default_max_poll_interval() -> u64 {
    300000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout(),
            max_poll_interval_ms: default_max_poll_interval(),
        }
    }
}

/// Topic names used by the ingress source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Raw object store change notifications and description updates
    #[serde(default = "default_object_events_topic")]
    pub object_events: String,
}

fn default_object_events_topic() -> String {
    "shutter.object-events".to_string()
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            object_events: default_object_events_topic(),
        }
    }
}

/// Kafka configuration for the ingress source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    /// Client ID for this connection
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
    #[serde(default)]
    pub ssl: SslConfig,
    #[serde(default)]
    pub sasl: SaslConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub topics: TopicConfig,
    /// Additional Kafka properties
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_client_id() -> String {
    "shutter-catalog".to_string()
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            client_id: default_client_id(),
            security_protocol: SecurityProtocol::default(),
            ssl: SslConfig::default(),
            sasl: SaslConfig::default(),
            consumer: ConsumerConfig::default(),
            topics: TopicConfig::default(),
            extra_properties: HashMap::new(),
        }
    }
}

impl KafkaConfig {
    /// Create a new KafkaConfig with the specified bootstrap servers
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let bootstrap_servers = std::env::var("KAFKA_BOOTSTRAP_SERVERS")
            .unwrap_or_else(|_| default_bootstrap_servers());

        let mut config = Self::new(bootstrap_servers);

        if let Ok(client_id) = std::env::var("KAFKA_CLIENT_ID") {
            config.client_id = client_id;
        }

        if let Ok(group_id) = std::env::var("KAFKA_GROUP_ID") {
            config.consumer.group_id = group_id;
        }

        if let Ok(topic) = std::env::var("KAFKA_OBJECT_EVENTS_TOPIC") {
            config.topics.object_events = topic;
        }

        if let Ok(protocol) = std::env::var("KAFKA_SECURITY_PROTOCOL") {
            config.security_protocol = match protocol.to_lowercase().as_str() {
                "ssl" => SecurityProtocol::Ssl,
                "sasl_plaintext" => SecurityProtocol::SaslPlaintext,
                "sasl_ssl" => SecurityProtocol::SaslSsl,
                _ => SecurityProtocol::Plaintext,
            };
        }

        if let Ok(username) = std::env::var("KAFKA_SASL_USERNAME") {
            config.sasl.username = Some(username);
        }
        if let Ok(password) = std::env::var("KAFKA_SASL_PASSWORD") {
            config.sasl.password = Some(password);
        }

        if let Ok(ca) = std::env::var("KAFKA_SSL_CA_LOCATION") {
            config.ssl.ca_location = Some(ca);
        }

        Ok(config)
    }

    /// Build a consumer ClientConfig
    pub fn build_consumer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("client.id", &self.client_id);
        config.set("security.protocol", self.security_protocol.as_str());

        if let Some(ref ca) = self.ssl.ca_location {
            config.set("ssl.ca.location", ca);
        }
        if let Some(ref cert) = self.ssl.certificate_location {
            config.set("ssl.certificate.location", cert);
        }
        if let Some(ref key) = self.ssl.key_location {
            config.set("ssl.key.location", key);
        }

        if let (Some(ref username), Some(ref password)) = (&self.sasl.username, &self.sasl.password) {
            config
                .set("sasl.mechanism", self.sasl.mechanism.as_str())
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        // Offsets are committed only after the gate has published
        config.set("group.id", &self.consumer.group_id);
        config.set("auto.offset.reset", &self.consumer.auto_offset_reset);
        config.set("enable.auto.commit", "false");
        config.set("session.timeout.ms", self.consumer.session_timeout_ms.to_string());
        config.set("max.poll.interval.ms", self.consumer.max_poll_interval_ms.to_string());

        for (key, value) in &self.extra_properties {
            config.set(key, value);
        }

        config
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.is_empty() {
            return Err(ConfigError::MissingRequired("bootstrap_servers".to_string()));
        }

        if self.consumer.group_id.is_empty() {
            return Err(ConfigError::MissingRequired("consumer.group_id".to_string()));
        }

        match self.security_protocol {
            SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl => {
                if self.sasl.username.is_none() {
                    return Err(ConfigError::MissingRequired(
                        "sasl.username (required for SASL)".to_string(),
                    ));
                }
            }
            _ => {}
        }

        Ok(())
    }
}

/// Delivery settings shared by work queues and their consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Deliveries allowed before a message is moved to the dead-letter queue
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,
    /// How long a received message stays hidden from other consumers
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// Maximum messages handed to a handler invocation
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long a consumer keeps filling a partial batch
    #[serde(default = "default_max_batching_window_secs")]
    pub max_batching_window_secs: u64,
    /// Long-poll wait for the first message of a batch
    #[serde(default = "default_receive_wait_secs")]
    pub receive_wait_secs: u64,
    /// Deadline for handling one message
    #[serde(default = "default_processing_timeout_secs")]
    pub processing_timeout_secs: u64,
}

fn default_max_receive_count() -> u32 {
    2
}

fn default_visibility_timeout_secs() -> u64 {
    30
}

fn default_batch_size() -> usize {
    5
}

fn default_max_batching_window_secs() -> u64 {
    10
}

fn default_receive_wait_secs() -> u64 {
    10
}

fn default_processing_timeout_secs() -> u64 {
    15
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_receive_count: default_max_receive_count(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            batch_size: default_batch_size(),
            max_batching_window_secs: default_max_batching_window_secs(),
            receive_wait_secs: default_receive_wait_secs(),
            processing_timeout_secs: default_processing_timeout_secs(),
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn max_batching_window(&self) -> Duration {
        Duration::from_secs(self.max_batching_window_secs)
    }

    pub fn receive_wait(&self) -> Duration {
        Duration::from_secs(self.receive_wait_secs)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_receive_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_receive_count".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "batch_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        // A message waits out the batching window before its handler starts,
        // and must not reappear while that handler may still be running.
        let settle_secs = self.processing_timeout_secs.saturating_add(self.max_batching_window_secs);
        if settle_secs > self.visibility_timeout_secs {
            return Err(ConfigError::InvalidValue {
                key: "processing_timeout_secs".to_string(),
                message: format!(
                    "{}s processing plus {}s batching window exceeds the visibility timeout of {}s",
                    self.processing_timeout_secs, self.max_batching_window_secs, self.visibility_timeout_secs
                ),
            });
        }

        Ok(())
    }
}
