//! Feedback, training-data submission, and training triggers
//!
//! - POST /feedback: user correction of a prediction (image + true
//!   coordinates). Enqueued at high priority; if the caller references a
//!   prior prediction by image id, the correction is also scored against it
//!   in the monitor log.
//! - POST /train: supervised sample with known coordinates. Indexed
//!   immediately (so re-submitting the same image becomes an exact match)
//!   and enqueued for the next regressor training cycle.
//! - POST /trigger_training (alias /retrain): run a training cycle now.

use axum::{
    extract::{Multipart, State},
    routing::post,
    Json, Router,
};
use geolens_common::geo::{is_valid_coordinate, GeoPoint};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};
use crate::learning::SampleMetadata;
use crate::types::{LocationRecord, RecordSource};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct FeedbackResponse {
    pub success: bool,
    pub message: String,
    pub queue_size: usize,
    pub should_retrain: bool,
}

#[derive(Debug, Serialize)]
pub struct TrainResponse {
    pub success: bool,
    /// Deterministic index id of the submitted image
    pub image_id: String,
    pub queue_size: usize,
    pub should_retrain: bool,
}

#[derive(Debug, Serialize)]
pub struct TriggerTrainingResponse {
    pub success: bool,
    pub trained: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub samples_processed: Option<usize>,
    pub message: String,
}

/// Common multipart fields for /feedback and /train
struct LabeledUpload {
    image_bytes: Vec<u8>,
    latitude: f64,
    longitude: f64,
    address: Option<String>,
    business_name: Option<String>,
    user_id: Option<String>,
    image_id: Option<String>,
    feedback: Option<String>,
}

async fn parse_labeled_upload(mut multipart: Multipart) -> ApiResult<LabeledUpload> {
    let mut image_bytes: Option<Vec<u8>> = None;
    let mut latitude: Option<f64> = None;
    let mut longitude: Option<f64> = None;
    let mut address = None;
    let mut business_name = None;
    let mut user_id = None;
    let mut image_id = None;
    let mut feedback = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed multipart body: {}", e)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read file field: {}", e)))?;
                image_bytes = Some(bytes.to_vec());
            }
            Some(other) => {
                let text = field.text().await.map_err(|e| {
                    ApiError::BadRequest(format!("Failed to read field {}: {}", other, e))
                })?;
                let text = text.trim().to_string();
                if text.is_empty() {
                    continue;
                }
                match other {
                    "latitude" => {
                        latitude = Some(text.parse().map_err(|_| {
                            ApiError::BadRequest(format!("Unparseable latitude: {}", text))
                        })?);
                    }
                    "longitude" => {
                        longitude = Some(text.parse().map_err(|_| {
                            ApiError::BadRequest(format!("Unparseable longitude: {}", text))
                        })?);
                    }
                    "address" => address = Some(text),
                    "businessName" => business_name = Some(text),
                    "userId" => user_id = Some(text),
                    "image_id" => image_id = Some(text),
                    "feedback" => feedback = Some(text),
                    _ => {}
                }
            }
            None => {}
        }
    }

    let image_bytes =
        image_bytes.ok_or_else(|| ApiError::BadRequest("Missing 'file' field".to_string()))?;
    if image_bytes.is_empty() {
        return Err(ApiError::BadRequest("Empty image upload".to_string()));
    }
    let latitude =
        latitude.ok_or_else(|| ApiError::BadRequest("Missing 'latitude' field".to_string()))?;
    let longitude =
        longitude.ok_or_else(|| ApiError::BadRequest("Missing 'longitude' field".to_string()))?;
    if !is_valid_coordinate(latitude, longitude) {
        return Err(ApiError::BadRequest(format!(
            "Coordinates out of range: {}, {}",
            latitude, longitude
        )));
    }

    Ok(LabeledUpload {
        image_bytes,
        latitude,
        longitude,
        address,
        business_name,
        user_id,
        image_id,
        feedback,
    })
}

fn save_image(state: &AppState, subdir: &str, image_bytes: &[u8]) -> ApiResult<String> {
    let dir = state.config.data_dir.join(subdir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{}.jpg", uuid::Uuid::new_v4()));
    std::fs::write(&path, image_bytes)?;
    Ok(path.to_string_lossy().into_owned())
}

/// POST /feedback
pub async fn submit_feedback(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Json<FeedbackResponse>> {
    let upload = parse_labeled_upload(multipart).await?;

    image::load_from_memory(&upload.image_bytes)
        .map_err(|e| ApiError::BadRequest(format!("Not a valid image: {}", e)))?;

    // Score the original prediction against the corrected coordinates
    if let Some(image_id) = &upload.image_id {
        if let Some(original) = state.recall_prediction(image_id).await {
            let truth = GeoPoint::new(upload.latitude, upload.longitude);
            if let Err(e) = state
                .monitor
                .log_prediction(image_id, &original, truth, upload.feedback.clone())
                .await
            {
                warn!(error = %e, "Failed to log feedback against prediction");
            }
        }
    }

    let image_path = save_image(&state, "feedback", &upload.image_bytes)?;
    let queue_size = state
        .queue
        .add_user_correction(
            image_path,
            SampleMetadata {
                latitude: Some(upload.latitude),
                longitude: Some(upload.longitude),
                address: upload.address,
                business_name: upload.business_name,
                user_id: upload.user_id,
                correction: false, // set by add_user_correction
            },
        )
        .await?;
    let should_retrain = state.queue.should_retrain().await;

    info!(queue_size = queue_size, should_retrain = should_retrain, "Feedback accepted");
    Ok(Json(FeedbackResponse {
        success: true,
        message: "Feedback queued for training".to_string(),
        queue_size,
        should_retrain,
    }))
}

/// POST /train
pub async fn submit_training_sample(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Json<TrainResponse>> {
    let upload = parse_labeled_upload(multipart).await?;

    image::load_from_memory(&upload.image_bytes)
        .map_err(|e| ApiError::BadRequest(format!("Not a valid image: {}", e)))?;

    // Index now: identical bytes become an exact match immediately, and
    // re-submission overwrites the same entry instead of duplicating it
    let image_id = state
        .engine
        .add_building_to_index(
            &upload.image_bytes,
            LocationRecord {
                latitude: upload.latitude,
                longitude: upload.longitude,
                address: upload.address.clone(),
                business_name: upload.business_name.clone(),
                source: RecordSource::UserFeedback,
            },
        )
        .await
        .map_err(|e| ApiError::Internal(format!("Indexing failed: {}", e)))?;

    let image_path = save_image(&state, "training", &upload.image_bytes)?;
    let queue_size = state
        .queue
        .add_sample(
            image_path,
            SampleMetadata {
                latitude: Some(upload.latitude),
                longitude: Some(upload.longitude),
                address: upload.address,
                business_name: upload.business_name,
                user_id: upload.user_id,
                correction: false,
            },
            crate::learning::Priority::High,
        )
        .await?;
    let should_retrain = state.queue.should_retrain().await;

    Ok(Json(TrainResponse {
        success: true,
        image_id,
        queue_size,
        should_retrain,
    }))
}

/// POST /trigger_training
pub async fn trigger_training(
    State(state): State<AppState>,
) -> ApiResult<Json<TriggerTrainingResponse>> {
    match state.trainer.run_training_cycle().await {
        Ok(Some(outcome)) => Ok(Json(TriggerTrainingResponse {
            success: true,
            trained: true,
            version: Some(outcome.version),
            samples_processed: Some(outcome.samples_processed),
            message: "Training cycle complete".to_string(),
        })),
        Ok(None) => Ok(Json(TriggerTrainingResponse {
            success: true,
            trained: false,
            version: None,
            samples_processed: None,
            message: "No training performed: queue below retraining thresholds".to_string(),
        })),
        Err(e) => {
            state.record_error(format!("Training cycle failed: {}", e)).await;
            Err(ApiError::Internal(format!("Training cycle failed: {}", e)))
        }
    }
}

/// Build feedback and training routes
pub fn feedback_routes() -> Router<AppState> {
    Router::new()
        .route("/feedback", post(submit_feedback))
        .route("/train", post(submit_training_sample))
        .route("/trigger_training", post(trigger_training))
        .route("/retrain", post(trigger_training))
}
