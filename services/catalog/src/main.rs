use anyhow::{Context, Result};
use shutter_catalog::api::{start_api_server, AppState};
use shutter_catalog::{
    Catalog, Clients, Config, LogNotifier, MemoryRecordStore, Notifier, PgRecordStore, RecordStore, S3ObjectStore,
    SesNotifier, StoreBackend,
};
use shutter_pipeline::KafkaIngressSource;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(service = %config.service.name, "Starting Shutter catalog service");

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let mut background = Vec::new();

    let store: Arc<dyn RecordStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(MemoryRecordStore::new()),
        StoreBackend::Postgres => {
            let store = PgRecordStore::connect(&config.store)
                .await
                .context("Failed to initialize record store")?;

            if config.store.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }

            background.push(store.listen().await.context("Failed to listen for record changes")?);
            Arc::new(store)
        }
    };

    let notifier: Arc<dyn Notifier> = if config.notify.dry_run {
        warn!("Notifications are logged only (dry run)");
        Arc::new(LogNotifier)
    } else {
        Arc::new(SesNotifier::new(&config.aws, &config.notify).await)
    };

    let clients = Clients {
        store,
        objects: Arc::new(S3ObjectStore::new(&config.aws).await),
        notifier,
    };

    let catalog = Arc::new(Catalog::new(
        clients,
        &config.queue,
        &config.processing.allowed_extensions,
    ));
    let workers = catalog.start();

    // Kafka ingress
    let ingress = match config.kafka.clone() {
        Some(kafka) => {
            let source = Arc::new(
                KafkaIngressSource::new(kafka, catalog.gate().clone())
                    .context("Failed to initialize Kafka ingress")?,
            );
            source.subscribe().context("Failed to subscribe to object events")?;

            let runner = source.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = runner.run().await {
                    error!(error = %e, "Kafka ingress error");
                }
            });
            Some((source, handle))
        }
        None => {
            warn!("No Kafka configuration, ingress disabled");
            None
        }
    };

    // Admin API
    if config.api.enabled {
        let api_state = AppState {
            catalog: catalog.clone(),
        };
        let api_config = config.api.clone();
        background.push(tokio::spawn(async move {
            if let Err(e) = start_api_server(api_state, &api_config).await {
                error!(error = %e, "API server error");
            }
        }));
    }

    info!("Catalog service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down catalog service");

    // Offsets are committed once an event is queued, so the queues must be
    // worked off before the process exits.
    if let Some((source, handle)) = ingress {
        source.shutdown();
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            warn!("Kafka ingress did not stop within the grace period");
        }
    }

    if !catalog.drain(SHUTDOWN_GRACE).await {
        warn!(queues = ?catalog.queue_stats(), "Exiting with undelivered messages");
    }
    catalog.shutdown();

    let stopped = futures::future::join_all(workers);
    if tokio::time::timeout(SHUTDOWN_GRACE, stopped).await.is_err() {
        warn!("Workers did not stop within the grace period");
    }

    for handle in background {
        handle.abort();
    }

    info!("Catalog service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
