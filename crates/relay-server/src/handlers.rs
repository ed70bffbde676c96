//! HTTP handlers for the Relay server.
//!
//! This module exposes the broker's request/response contract over axum:
//! health, consumer registration, publish, poll, and topic administration.

use crate::config::Config;
use crate::metrics;
use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use relay_core::{message::now_millis, Broker, BrokerError, Message, MessageId};
use relay_store::DurableStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Shared server state.
pub struct AppState {
    /// The broker core.
    pub broker: Arc<Broker>,
}

/// Errors surfaced to HTTP clients.
#[derive(Debug)]
pub enum ApiError {
    /// Broker-core error.
    Broker(BrokerError),
    /// Expected race: the entity already exists.
    Duplicate(&'static str),
    /// The entity does not exist.
    NotFound(&'static str),
}

impl From<BrokerError> for ApiError {
    fn from(e: BrokerError) -> Self {
        Self::Broker(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Broker(BrokerError::NotRunning) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Broker(BrokerError::Storage(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Broker(_) => StatusCode::BAD_REQUEST,
            Self::Duplicate(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Broker(e) => e.to_string(),
            Self::Duplicate(m) | Self::NotFound(m) => (*m).to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            ApiError::Broker(BrokerError::Storage(e)) => {
                metrics::record_error("storage");
                error!(error = %e, "Storage error");
            }
            ApiError::Broker(BrokerError::NotRunning) => metrics::record_error("not_running"),
            ApiError::Broker(_) => metrics::record_error("validation"),
            ApiError::Duplicate(_) | ApiError::NotFound(_) => {}
        }
        let body = Json(serde_json::json!({ "error": self.message() }));
        (status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    timestamp: u64,
    version: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    topic: String,
    consumer_group: String,
    consumer_id: String,
    /// Opaque metadata, not interpreted by the core.
    #[serde(default)]
    #[allow(dead_code)]
    properties: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponse {
    status: &'static str,
    consumer_id: String,
    timestamp: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    #[serde(default)]
    id: Option<MessageId>,
    topic: String,
    #[serde(default)]
    consumer_group: Option<String>,
    #[serde(default)]
    priority: Option<i32>,
    #[serde(default)]
    timestamp: Option<u64>,
    content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    id: MessageId,
    status: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageDto {
    id: MessageId,
    topic: String,
    consumer_group: Option<String>,
    priority: i32,
    timestamp: u64,
    content: String,
}

impl From<Message> for MessageDto {
    fn from(m: Message) -> Self {
        Self {
            id: m.id,
            topic: m.topic.clone(),
            consumer_group: m.group.clone(),
            priority: m.priority,
            timestamp: m.timestamp,
            content: String::from_utf8_lossy(&m.payload).into_owned(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollQuery {
    topic: String,
    #[serde(default)]
    consumer_group: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    topic: String,
    consumer_group: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    consumers: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    topics: usize,
    messages: usize,
    groups: usize,
    consumers: usize,
}

/// Build the API router.
#[must_use]
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/consumers", post(register_handler).get(list_handler))
        .route("/consumers/:id", delete(unregister_handler))
        .route("/messages", post(publish_handler).get(poll_handler))
        .route("/topics/:topic", delete(clear_handler))
        .with_state(state)
}

/// Run the HTTP server.
///
/// Opens the durable store, starts (replays) the broker, serves until
/// interrupted, then stops the broker so cursors are flushed.
///
/// # Errors
///
/// Returns an error if the store cannot be opened, replay fails, or the
/// listener cannot bind.
pub async fn run_server(config: Config) -> Result<()> {
    let store = Arc::new(DurableStore::open(config.storage.root.clone())?);
    let broker = Arc::new(Broker::with_config(store, config.broker_config()));
    broker.start()?;

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState {
        broker: broker.clone(),
    });
    let app = router(state);

    let listener = TcpListener::bind(addr).await?;
    info!("Relay server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    broker.stop();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: now_millis(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Broker statistics handler.
async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let stats = state.broker.stats();
    metrics::set_active_topics(stats.topic_count);
    metrics::set_active_consumers(stats.consumer_count);
    Json(StatsResponse {
        topics: stats.topic_count,
        messages: stats.message_count,
        groups: stats.group_count,
        consumers: stats.consumer_count,
    })
}

/// Consumer registration handler.
async fn register_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let registered =
        state
            .broker
            .register_consumer(&req.topic, &req.consumer_group, &req.consumer_id)?;
    if !registered {
        return Err(ApiError::Duplicate("consumer already registered"));
    }

    metrics::set_active_consumers(state.broker.stats().consumer_count);
    Ok(Json(RegisterResponse {
        status: "registered",
        consumer_id: req.consumer_id,
        timestamp: now_millis(),
    }))
}

/// Consumer unregistration handler.
async fn unregister_handler(
    State(state): State<Arc<AppState>>,
    Path(consumer_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.broker.unregister_consumer(&consumer_id)? {
        return Err(ApiError::NotFound("consumer not registered"));
    }
    metrics::set_active_consumers(state.broker.stats().consumer_count);
    Ok(Json(serde_json::json!({ "status": "unregistered" })))
}

/// Consumer listing handler.
async fn list_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let consumers = state
        .broker
        .list_consumers(&query.topic, &query.consumer_group)?;
    Ok(Json(ListResponse { consumers }))
}

/// Publish handler.
async fn publish_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PublishRequest>,
) -> Result<Json<PublishResponse>, ApiError> {
    let started = std::time::Instant::now();
    let payload_len = req.content.len();
    let mut message = Message::new(&req.topic, req.content.into_bytes());
    if let Some(id) = req.id {
        message = message.with_id(id);
    }
    if let Some(group) = req.consumer_group {
        message = message.with_group(group);
    }
    if let Some(priority) = req.priority {
        message = message.with_priority(priority);
    }
    if let Some(timestamp) = req.timestamp {
        message = message.with_timestamp(timestamp);
    }
    let id = message.id;

    if !state.broker.publish(&req.topic, message)? {
        metrics::record_duplicate();
        return Err(ApiError::Duplicate("message id already published"));
    }

    metrics::record_publish(payload_len);
    metrics::record_latency("publish", started.elapsed().as_secs_f64());
    debug!(topic = %req.topic, id = %id, "Published");
    Ok(Json(PublishResponse {
        id,
        status: "published",
    }))
}

/// Poll handler.
async fn poll_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PollQuery>,
) -> Result<Json<Vec<MessageDto>>, ApiError> {
    let started = std::time::Instant::now();
    let group = query.consumer_group.as_deref().unwrap_or("default");
    let batch = state.broker.poll(&query.topic, group)?;
    metrics::record_poll(batch.len());
    metrics::record_latency("poll", started.elapsed().as_secs_f64());
    Ok(Json(batch.into_iter().map(MessageDto::from).collect()))
}

/// Topic clear handler (administrative).
async fn clear_handler(
    State(state): State<Arc<AppState>>,
    Path(topic): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.broker.clear_topic(&topic)?;
    metrics::set_active_topics(state.broker.stats().topic_count);
    Ok(Json(serde_json::json!({ "status": "cleared" })))
}
