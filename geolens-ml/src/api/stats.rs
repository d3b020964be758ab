//! Service status surfaces
//!
//! - GET /stats: index and pipeline summary
//! - GET /training_queue: trainable sample snapshot
//! - GET /training_status: retraining state and registered models
//! - GET /metrics: windowed prediction accuracy from the monitor log

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ApiResult;
use crate::learning::FeedbackSample;
use crate::monitor::{ModelEntry, MonitorMetrics};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    /// Entries in the vector index
    pub index_size: usize,
    /// Total samples queued (valid or not)
    pub queue_size: usize,
    pub should_retrain: bool,
    pub last_training: Option<DateTime<Utc>>,
    /// Which collaborators are wired up
    pub embedder: &'static str,
    pub ocr_available: bool,
    pub landmark_available: bool,
    pub models_registered: usize,
    pub active_model: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TrainingQueueResponse {
    pub total_samples: usize,
    /// Samples with usable ground truth, high priority first
    pub valid_samples: Vec<FeedbackSample>,
    pub last_training: Option<DateTime<Utc>>,
    pub should_retrain: bool,
}

#[derive(Debug, Serialize)]
pub struct TrainingStatusResponse {
    pub status: &'static str,
    pub queue_size: usize,
    pub should_retrain: bool,
    pub last_training: Option<DateTime<Utc>>,
    pub active_model: Option<String>,
    pub models: Vec<ModelEntry>,
}

/// GET /stats
pub async fn stats(State(state): State<AppState>) -> ApiResult<Json<StatsResponse>> {
    let models = state.registry.list_models().await;
    Ok(Json(StatsResponse {
        index_size: state.engine.index_size().await,
        queue_size: state.queue.queue_size().await,
        should_retrain: state.queue.should_retrain().await,
        last_training: state.queue.last_training().await,
        embedder: state.engine.embedder_name(),
        ocr_available: state.engine.ocr_available(),
        landmark_available: state.engine.landmark_available(),
        models_registered: models.len(),
        active_model: state
            .registry
            .get_active_model()
            .await
            .map(|m| m.version),
    }))
}

/// GET /training_queue
pub async fn training_queue(
    State(state): State<AppState>,
) -> ApiResult<Json<TrainingQueueResponse>> {
    let mut valid = state.queue.valid_samples().await;
    valid.sort_by_key(|s| match s.priority {
        crate::learning::Priority::High => 0,
        crate::learning::Priority::Normal => 1,
    });
    Ok(Json(TrainingQueueResponse {
        total_samples: state.queue.queue_size().await,
        valid_samples: valid,
        last_training: state.queue.last_training().await,
        should_retrain: state.queue.should_retrain().await,
    }))
}

/// GET /training_status
pub async fn training_status(
    State(state): State<AppState>,
) -> ApiResult<Json<TrainingStatusResponse>> {
    Ok(Json(TrainingStatusResponse {
        status: "ok",
        queue_size: state.queue.queue_size().await,
        should_retrain: state.queue.should_retrain().await,
        last_training: state.queue.last_training().await,
        active_model: state
            .registry
            .get_active_model()
            .await
            .map(|m| m.version),
        models: state.registry.list_models().await,
    }))
}

/// GET /metrics
pub async fn metrics(State(state): State<AppState>) -> ApiResult<Json<MonitorMetrics>> {
    let metrics = state
        .monitor
        .calculate_metrics(state.config.metrics_window_hours)
        .await?;
    Ok(Json(metrics))
}

/// Build status routes
pub fn stats_routes() -> Router<AppState> {
    Router::new()
        .route("/stats", get(stats))
        .route("/training_queue", get(training_queue))
        .route("/training_status", get(training_status))
        .route("/metrics", get(metrics))
}
