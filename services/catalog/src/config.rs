use serde::Deserialize;
use shutter_pipeline::{KafkaConfig, QueueConfig};
use std::time::Duration;

/// Flat environment variables honoured on top of the layered configuration
const FLAT_OVERRIDES: &[(&str, &str)] = &[
    ("RECORD_TABLE_NAME", "store.table_name"),
    ("NOTIFY_FROM", "notify.from"),
    ("NOTIFY_TO", "notify.to"),
    ("REGION", "aws.region"),
    ("MAX_RECEIVE_COUNT", "queue.max_receive_count"),
    ("VISIBILITY_TIMEOUT_SECS", "queue.visibility_timeout_secs"),
    ("BATCH_SIZE", "queue.batch_size"),
    ("MAX_BATCHING_WINDOW_SECS", "queue.max_batching_window_secs"),
];

/// Main configuration for the catalog service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka ingress; the service runs without ingress when absent
    #[serde(default)]
    pub kafka: Option<KafkaConfig>,
    /// Work queue delivery settings
    #[serde(default)]
    pub queue: QueueConfig,
    /// Record store configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// AWS client configuration
    #[serde(default)]
    pub aws: AwsConfig,
    /// Notification configuration
    #[serde(default)]
    pub notify: NotifyConfig,
    /// Processing worker configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
    /// Admin API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Record store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

/// Record store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Table holding one row per object key
    #[serde(default = "default_table_name")]
    pub table_name: String,
    /// PostgreSQL connection URL, required for the postgres backend
    pub database_url: Option<String>,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Create the table and change trigger on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// AWS client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AwsConfig {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom S3 endpoint URL (for MinIO, LocalStack, etc.)
    pub s3_endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Notification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    /// Sender address
    #[serde(default)]
    pub from: String,
    /// Fixed recipient address
    #[serde(default)]
    pub to: String,
    /// Log notifications instead of sending them
    #[serde(default)]
    pub dry_run: bool,
}

/// Processing worker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    /// Accepted file extensions, compared case-insensitively
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

/// Admin API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Serve the admin API
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

// Default value functions
fn default_service_name() -> String {
    "catalog".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_table_name() -> String {
    "images".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_allowed_extensions() -> Vec<String> {
    vec!["jpeg".to_string(), "png".to_string()]
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from config files and the environment
    pub fn load() -> anyhow::Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/catalog").required(false))
            .add_source(config::File::with_name("/etc/shutter/catalog").required(false))
            // CATALOG__STORE__TABLE_NAME -> store.table_name
            .add_source(
                config::Environment::with_prefix("CATALOG")
                    .separator("__")
                    .try_parsing(true),
            );

        Self::from_builder(builder, |name| std::env::var(name).ok())
    }

    /// Apply the flat overrides and deserialize
    pub fn from_builder<F>(
        mut builder: config::ConfigBuilder<config::builder::DefaultState>,
        lookup: F,
    ) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        for (variable, key) in FLAT_OVERRIDES {
            builder = builder.set_override_option(*key, lookup(variable))?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> anyhow::Result<()> {
        self.queue.validate()?;

        if let Some(ref kafka) = self.kafka {
            kafka.validate()?;
        }

        if self.store.backend == StoreBackend::Postgres && self.store.database_url.is_none() {
            anyhow::bail!("store.database_url is required for the postgres backend");
        }

        if !self.notify.dry_run && (self.notify.from.is_empty() || self.notify.to.is_empty()) {
            anyhow::bail!("notify.from and notify.to are required unless notify.dry_run is set");
        }

        if self.processing.allowed_extensions.is_empty() {
            anyhow::bail!("processing.allowed_extensions must not be empty");
        }

        Ok(())
    }
}

impl StoreConfig {
    /// Get database connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get database idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            table_name: default_table_name(),
            database_url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: true,
        }
    }
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            s3_endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            from: String::new(),
            to: String::new(),
            dry_run: false,
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: false,
        }
    }
}
