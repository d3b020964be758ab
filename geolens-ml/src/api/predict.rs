//! Prediction endpoint
//!
//! POST /predict accepts a multipart upload (`file` required, `image_id`
//! optional) and runs the full fusion chain. When the caller supplies an
//! image id, the prediction is logged to the monitor and cached so later
//! feedback for the same id can be scored against it.
//!
//! Confident predictions (at or above `capture_threshold`) are auto-captured
//! into the training queue as pseudo-labeled samples; exact matches are
//! excluded since the index already knows them.

use axum::{
    extract::{Multipart, State},
    routing::post,
    Json, Router,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};
use crate::types::{PredictionMethod, PredictionResult};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub confidence: f32,
    pub method: PredictionMethod,
    pub details: serde_json::Value,
    /// Whether this prediction was auto-captured for retraining
    pub captured: bool,
}

/// Parsed multipart body for /predict
struct PredictUpload {
    image_bytes: Vec<u8>,
    image_id: Option<String>,
}

async fn parse_upload(mut multipart: Multipart) -> ApiResult<PredictUpload> {
    let mut image_bytes: Option<Vec<u8>> = None;
    let mut image_id: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed multipart body: {}", e)))?
    {
        match field.name() {
            Some("file") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read file field: {}", e)))?;
                image_bytes = Some(bytes.to_vec());
            }
            Some("image_id") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read image_id: {}", e)))?;
                if !text.trim().is_empty() {
                    image_id = Some(text.trim().to_string());
                }
            }
            _ => {}
        }
    }

    let image_bytes =
        image_bytes.ok_or_else(|| ApiError::BadRequest("Missing 'file' field".to_string()))?;
    if image_bytes.is_empty() {
        return Err(ApiError::BadRequest("Empty image upload".to_string()));
    }
    Ok(PredictUpload {
        image_bytes,
        image_id,
    })
}

/// POST /predict
pub async fn predict(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Json<PredictResponse>> {
    let upload = parse_upload(multipart).await?;

    // Reject uploads that are not decodable images before spending any
    // pipeline budget on them
    image::load_from_memory(&upload.image_bytes)
        .map_err(|e| ApiError::BadRequest(format!("Not a valid image: {}", e)))?;

    let result = state.engine.predict_location(&upload.image_bytes).await;
    info!(
        method = result.method.as_str(),
        confidence = result.confidence,
        "Prediction complete"
    );

    if let Some(image_id) = &upload.image_id {
        if let Err(e) = state.monitor.log_prediction(image_id, &result, None, None).await {
            warn!(error = %e, "Failed to log prediction");
        }
        state.remember_prediction(image_id.clone(), result.clone()).await;
    }

    let captured = maybe_capture(&state, &upload.image_bytes, &result).await;

    Ok(Json(PredictResponse {
        image_id: upload.image_id,
        latitude: result.latitude,
        longitude: result.longitude,
        confidence: result.confidence,
        method: result.method,
        details: result.details,
        captured,
    }))
}

/// Save and enqueue a confident non-exact prediction as a training sample
async fn maybe_capture(state: &AppState, image_bytes: &[u8], result: &PredictionResult) -> bool {
    let (Some(latitude), Some(longitude)) = (result.latitude, result.longitude) else {
        return false;
    };
    if result.method == PredictionMethod::ExactMatch
        || result.confidence < state.config.capture_threshold
    {
        return false;
    }

    let capture_dir = state.config.data_dir.join("captured");
    if let Err(e) = std::fs::create_dir_all(&capture_dir) {
        warn!(error = %e, "Failed to create capture directory");
        return false;
    }
    let path = capture_dir.join(format!("{}.jpg", uuid::Uuid::new_v4()));
    if let Err(e) = std::fs::write(&path, image_bytes) {
        warn!(error = %e, "Failed to save captured image");
        return false;
    }

    match state
        .queue
        .add_high_confidence_prediction(
            path.to_string_lossy().into_owned(),
            latitude,
            longitude,
            result.confidence,
            state.config.capture_threshold,
        )
        .await
    {
        Ok(captured) => {
            if captured {
                info!(path = %path.display(), confidence = result.confidence, "Auto-captured prediction");
            }
            captured
        }
        Err(e) => {
            warn!(error = %e, "Failed to queue captured prediction");
            false
        }
    }
}

/// Build prediction routes
pub fn predict_routes() -> Router<AppState> {
    Router::new().route("/predict", post(predict))
}
