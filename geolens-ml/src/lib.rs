//! geolens-ml library interface
//!
//! Image geolocation service: a fallback chain of recognition strategies
//! (exact hash, vector similarity, OCR geocoding, landmark classification,
//! learned regression) with an active-learning loop that retrains the
//! regressor from user feedback.

pub mod api;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extractors;
pub mod fusion;
pub mod index;
pub mod learning;
pub mod monitor;
pub mod regressor;
pub mod types;

pub use crate::error::{ApiError, ApiResult};

use crate::config::MlConfig;
use crate::fusion::FusionEngine;
use crate::learning::{ActiveLearningQueue, ContinuousTrainer};
use crate::monitor::{ModelRegistry, PredictionMonitor};
use crate::types::PredictionResult;
use axum::Router;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Upper bound on cached predictions awaiting feedback
const PREDICTION_CACHE_CAP: usize = 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<MlConfig>,
    pub engine: Arc<FusionEngine>,
    pub queue: Arc<ActiveLearningQueue>,
    pub trainer: Arc<ContinuousTrainer>,
    pub monitor: Arc<PredictionMonitor>,
    pub registry: Arc<ModelRegistry>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last error for diagnostic purposes
    pub last_error: Arc<RwLock<Option<String>>>,
    /// Recent predictions keyed by caller image id, so feedback can be
    /// scored against the prediction it corrects
    recent_predictions: Arc<RwLock<HashMap<String, PredictionResult>>>,
}

impl AppState {
    pub fn new(
        config: Arc<MlConfig>,
        engine: Arc<FusionEngine>,
        queue: Arc<ActiveLearningQueue>,
        trainer: Arc<ContinuousTrainer>,
        monitor: Arc<PredictionMonitor>,
        registry: Arc<ModelRegistry>,
    ) -> Self {
        Self {
            config,
            engine,
            queue,
            trainer,
            monitor,
            registry,
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
            recent_predictions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn record_error(&self, message: String) {
        *self.last_error.write().await = Some(message);
    }

    /// Cache a prediction for later feedback scoring. The cache resets when
    /// full; feedback for evicted predictions simply skips the scoring step.
    pub async fn remember_prediction(&self, image_id: String, result: PredictionResult) {
        let mut cache = self.recent_predictions.write().await;
        if cache.len() >= PREDICTION_CACHE_CAP {
            cache.clear();
        }
        cache.insert(image_id, result);
    }

    pub async fn recall_prediction(&self, image_id: &str) -> Option<PredictionResult> {
        self.recent_predictions.read().await.get(image_id).cloned()
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::predict_routes())
        .merge(api::feedback_routes())
        .merge(api::stats_routes())
        .merge(api::health_routes())
        .with_state(state)
}
