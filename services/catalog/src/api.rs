use crate::config::ApiConfig;
use crate::record_store::Record;
use crate::service::Catalog;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use shutter_pipeline::QueueStats;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<Catalog>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Queue overview response
#[derive(Debug, Serialize)]
pub struct QueuesResponse {
    pub queues: Vec<QueueStats>,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/records/:key", get(get_record))
        .route("/queues", get(list_queues))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint, including record store connectivity
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.catalog.store().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "healthy",
                "service": "catalog",
                "store": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "unhealthy",
                "service": "catalog",
                "store": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Get the record for an object key
#[instrument(skip(state))]
async fn get_record(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Record>, (StatusCode, Json<ErrorResponse>)> {
    let record = state.catalog.store().get(&key).await.map_err(|e| {
        error!(error = %e, "Failed to read record");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "Failed to read record".to_string(),
                code: "STORE_ERROR".to_string(),
            }),
        )
    })?;

    record.map(Json).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("No record for key {key}"),
                code: "NOT_FOUND".to_string(),
            }),
        )
    })
}

/// Queue depths
async fn list_queues(State(state): State<AppState>) -> Json<QueuesResponse> {
    Json(QueuesResponse {
        queues: state.catalog.queue_stats(),
    })
}

/// Start the API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting admin API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router).await.context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::LogNotifier;
    use crate::objects::MockObjectStore;
    use crate::record_store::{MemoryRecordStore, RecordStore};
    use crate::service::Clients;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use shutter_pipeline::QueueConfig;
    use tower::ServiceExt;

    async fn test_app() -> Router {
        let store = Arc::new(MemoryRecordStore::default());
        store.upsert("a b.png", "images", Utc::now()).await.unwrap();

        let clients = Clients {
            store,
            objects: Arc::new(MockObjectStore::new()),
            notifier: Arc::new(LogNotifier),
        };
        let catalog = Arc::new(Catalog::new(clients, &QueueConfig::default(), &["png".to_string()]));

        create_router(AppState { catalog }, &ApiConfig::default())
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app().await;

        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_get_record() {
        let app = test_app().await;

        let req = Request::builder().uri("/records/a%20b.png").body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let record: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(record["key"], "a b.png");
        assert_eq!(record["origin"], "images");

        let req = Request::builder().uri("/records/missing.png").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_queues() {
        let app = test_app().await;

        let req = Request::builder().uri("/queues").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["queues"].as_array().map(|q| q.len()), Some(3));
        assert_eq!(stats["queues"][0]["name"], "image-process");
    }
}
