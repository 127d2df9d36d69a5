// src/api.rs
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::app::Services;
use crate::error::IngestError;
use crate::ingest::queue::{JobQueue, JobResult};
use crate::ingest::types::{JobId, Story};
use crate::notify::{self, RegisterRequest};
use crate::store::{FeedStore, RegistrationStore};

const FEED_DEFAULT_LIMIT: usize = 50;
const FEED_MAX_LIMIT: usize = 500;

#[derive(Clone)]
pub struct ApiState {
    feed: Arc<dyn FeedStore>,
    registrations: Arc<dyn RegistrationStore>,
    queue: Arc<dyn JobQueue>,
    default_topic: String,
}

/// Full HTTP surface minus `/metrics` (the recorder is process-global and
/// installed by the binary).
pub fn create_router(services: &Services) -> Router {
    let state = ApiState {
        feed: services.stores.feed.clone(),
        registrations: services.stores.registrations.clone(),
        queue: services.stores.queue.clone(),
        default_topic: services.config.push.default_topic.clone(),
    };

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/feed", get(feed))
        .route("/push/register", post(push_register))
        .route("/debug/jobs/{job_id}", get(debug_job))
        .with_state(state)
        .merge(crate::webhook::router(services.webhook.clone()))
        .merge(crate::realtime::router(services.realtime.clone()))
        .layer(CorsLayer::very_permissive())
}

#[derive(Debug, Default, Deserialize)]
struct FeedQuery {
    limit: Option<usize>,
}

/// Newest-first snapshot of the canonical feed.
async fn feed(State(state): State<ApiState>, Query(q): Query<FeedQuery>) -> Result<Json<Vec<Story>>, IngestError> {
    let limit = q.limit.unwrap_or(FEED_DEFAULT_LIMIT).clamp(1, FEED_MAX_LIMIT);
    Ok(Json(state.feed.snapshot(limit).await?))
}

#[derive(Serialize)]
struct RegisterOut {
    topics: Vec<String>,
}

async fn push_register(
    State(state): State<ApiState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterOut>), IngestError> {
    let reg = notify::register(state.registrations.as_ref(), &state.default_topic, req).await?;
    Ok((StatusCode::CREATED, Json(RegisterOut { topics: reg.topics })))
}

async fn debug_job(State(state): State<ApiState>, Path(job_id): Path<String>) -> Result<Json<JobResult>, IngestError> {
    let id = JobId::from_raw(&job_id);
    state
        .queue
        .result(&id)
        .await?
        .map(Json)
        .ok_or_else(|| IngestError::NotFound(format!("job {id}")))
}
