//! Core types and trait definitions for geolens-ml
//!
//! Defines the collaborator seams of the recognition pipeline:
//! - **Signal sources:** EmbeddingProvider, TextExtractor, Geocoder,
//!   LandmarkClassifier, CoordinateRegressor
//! - **Storage:** VectorIndex
//!
//! The fusion engine orchestrates these through trait objects, so every
//! collaborator can be swapped for a remote service, a local model, or a
//! test double without touching the decision logic.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

// ============================================================================
// Embeddings
// ============================================================================

/// Fixed-length image embedding, L2-normalized before storage or comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    /// Wrap a raw vector, normalizing it to unit length.
    ///
    /// A zero vector is left as-is (normalizing it would divide by zero);
    /// its similarity against anything is then 0.
    pub fn new(values: Vec<f32>) -> Self {
        let mut e = Self(values);
        e.l2_normalize();
        e
    }

    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    fn l2_normalize(&mut self) {
        let norm: f32 = self.0.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut self.0 {
                *x /= norm;
            }
        }
    }

    /// Cosine similarity. Both embeddings are unit-length, so this is the
    /// plain inner product.
    pub fn cosine(&self, other: &Embedding) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| a * b)
            .sum()
    }
}

// ============================================================================
// Location records and index results
// ============================================================================

/// How a location record entered the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSource {
    UserFeedback,
    Scrape,
    Correction,
}

/// Location metadata stored alongside an embedding in the vector index.
///
/// Immutable once stored except for address backfill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(rename = "businessName", skip_serializing_if = "Option::is_none")]
    pub business_name: Option<String>,
    pub source: RecordSource,
}

/// One nearest-neighbor result from a vector index query.
///
/// Score semantics: cosine similarity, higher is more similar.
#[derive(Debug, Clone, Serialize)]
pub struct IndexMatch {
    pub id: String,
    pub score: f32,
    pub record: LocationRecord,
}

/// Entry returned by `VectorIndex::fetch`
#[derive(Debug, Clone)]
pub struct IndexedLocation {
    pub embedding: Option<Embedding>,
    pub record: LocationRecord,
}

// ============================================================================
// Signal source outputs
// ============================================================================

/// One text fragment extracted from an image by OCR
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextFragment {
    pub text: String,
    /// OCR confidence (0.0-1.0)
    pub confidence: f32,
    /// Bounding box as [x, y, width, height] in pixels, when the backend
    /// reports one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f32; 4]>,
}

/// Successful geocode of a text fragment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeocodeResult {
    pub latitude: f64,
    pub longitude: f64,
    pub formatted_address: String,
    pub confidence: f32,
}

/// One ranked landmark classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LandmarkPrediction {
    pub class_id: u32,
    pub class_name: String,
    pub confidence: f32,
}

/// Output of the coordinate regressor
#[derive(Debug, Clone, Copy)]
pub struct RegressedCoordinate {
    pub latitude: f64,
    pub longitude: f64,
    /// Model's own confidence estimate; the fusion engine substitutes its
    /// configured values when building the response
    pub confidence: f32,
}

// ============================================================================
// Prediction results
// ============================================================================

/// Which strategy produced the final prediction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionMethod {
    ExactMatch,
    Similarity,
    OcrGeocoding,
    LandmarkRecognition,
    GeolocationModel,
    Failed,
}

impl PredictionMethod {
    /// Stable name used in logs and metric histograms
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionMethod::ExactMatch => "exact_match",
            PredictionMethod::Similarity => "similarity",
            PredictionMethod::OcrGeocoding => "ocr_geocoding",
            PredictionMethod::LandmarkRecognition => "landmark_recognition",
            PredictionMethod::GeolocationModel => "geolocation_model",
            PredictionMethod::Failed => "failed",
        }
    }
}

/// Final fused prediction for one request.
///
/// Transient: produced per request and only persisted through the
/// prediction monitor's log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResult {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub confidence: f32,
    pub method: PredictionMethod,
    pub details: serde_json::Value,
}

impl PredictionResult {
    /// All-strategies-exhausted result. "No location found" is an expected
    /// outcome, not a defect, so this carries a human-readable message
    /// rather than surfacing as an error.
    pub fn failed(message: impl Into<String>, attempted: &[&str]) -> Self {
        Self {
            latitude: None,
            longitude: None,
            confidence: 0.0,
            method: PredictionMethod::Failed,
            details: serde_json::json!({
                "message": message.into(),
                "strategies_attempted": attempted,
            }),
        }
    }

    pub fn has_coordinates(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

// ============================================================================
// Stage errors
// ============================================================================

/// Failure of one pipeline stage or collaborator call.
///
/// Stage errors are caught at each fallback-stage boundary and converted
/// into "no result from this stage"; they never propagate past the fusion
/// engine.
#[derive(Debug, Error)]
pub enum StageError {
    /// Network communication error
    #[error("Network error: {0}")]
    Network(String),

    /// External API returned an error response
    #[error("API error {0}: {1}")]
    Api(u16, String),

    /// Stage exceeded its time budget
    #[error("Stage timed out")]
    Timeout,

    /// Image could not be decoded
    #[error("Image decode error: {0}")]
    Decode(String),

    /// Failed to parse a collaborator response
    #[error("Parse error: {0}")]
    Parse(String),

    /// Collaborator not configured or failed to initialize
    #[error("Not available: {0}")]
    NotAvailable(String),

    /// Internal processing error
    #[error("Internal error: {0}")]
    Internal(String),
}

// ============================================================================
// Collaborator traits
// ============================================================================

/// Turns raw image bytes into a fixed-length normalized embedding
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name for provenance tracking and the stats surface
    fn name(&self) -> &'static str;

    /// Embedding dimension agreed with the vector index
    fn dimension(&self) -> usize;

    async fn encode(&self, image_bytes: &[u8]) -> Result<Embedding, StageError>;
}

/// Stores (embedding, location-metadata) pairs and answers nearest-neighbor
/// queries by cosine similarity
#[async_trait::async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or overwrite an entry. Overwriting an existing id is how
    /// exact-hash dedup works: re-training the same image replaces its
    /// record instead of duplicating it.
    async fn upsert(
        &self,
        id: String,
        embedding: Embedding,
        record: LocationRecord,
    ) -> Result<(), StageError>;

    /// Top-k nearest neighbors, highest score first
    async fn query(&self, embedding: &Embedding, k: usize) -> Result<Vec<IndexMatch>, StageError>;

    /// Fetch entries by id; absent ids are simply omitted from the map
    async fn fetch(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, IndexedLocation>, StageError>;

    /// Number of stored entries
    async fn size(&self) -> usize;
}

/// Extracts text fragments from an image (OCR black box)
#[async_trait::async_trait]
pub trait TextExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn extract(&self, image_bytes: &[u8]) -> Result<Vec<TextFragment>, StageError>;
}

/// Resolves a text fragment to coordinates
#[async_trait::async_trait]
pub trait Geocoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns None when the text does not geocode; Err only for transport
    /// failures (both are treated as "try the next fragment" upstream)
    async fn geocode(&self, text: &str) -> Result<Option<GeocodeResult>, StageError>;
}

/// Ranks landmark classes for an image
#[async_trait::async_trait]
pub trait LandmarkClassifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn classify(
        &self,
        image_bytes: &[u8],
        top_k: usize,
    ) -> Result<Vec<LandmarkPrediction>, StageError>;
}

/// Learned embedding → coordinate regression with online updates
#[async_trait::async_trait]
pub trait CoordinateRegressor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Predict coordinates. The output transform keeps lat in [-90, 90]
    /// and lon in [-180, 180]; callers do not clamp.
    async fn predict(&self, embedding: &Embedding) -> Result<RegressedCoordinate, StageError>;

    /// One online gradient step against a great-circle distance loss.
    /// Returns the sample's loss in kilometers.
    async fn train_step(
        &self,
        embedding: &Embedding,
        true_lat: f64,
        true_lon: f64,
    ) -> Result<f64, StageError>;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_is_normalized() {
        let e = Embedding::new(vec![3.0, 4.0]);
        let norm: f32 = e.as_slice().iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_embedding_zero_vector_unchanged() {
        let e = Embedding::new(vec![0.0, 0.0, 0.0]);
        assert_eq!(e.as_slice(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_cosine_identical_is_one() {
        let a = Embedding::new(vec![1.0, 2.0, 3.0]);
        let b = Embedding::new(vec![1.0, 2.0, 3.0]);
        assert!((a.cosine(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_is_zero() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!(a.cosine(&b).abs() < 1e-6);
    }

    #[test]
    fn test_method_names_are_stable() {
        assert_eq!(PredictionMethod::ExactMatch.as_str(), "exact_match");
        assert_eq!(PredictionMethod::Similarity.as_str(), "similarity");
        assert_eq!(PredictionMethod::Failed.as_str(), "failed");
    }

    #[test]
    fn test_method_serializes_snake_case() {
        let json = serde_json::to_string(&PredictionMethod::OcrGeocoding).unwrap();
        assert_eq!(json, "\"ocr_geocoding\"");
    }

    #[test]
    fn test_failed_result_has_message() {
        let r = PredictionResult::failed("nothing matched", &["similarity", "ocr"]);
        assert!(!r.has_coordinates());
        assert_eq!(r.confidence, 0.0);
        assert_eq!(r.method, PredictionMethod::Failed);
        assert_eq!(r.details["message"], "nothing matched");
        assert_eq!(r.details["strategies_attempted"][1], "ocr");
    }

    #[test]
    fn test_location_record_business_name_field() {
        let record = LocationRecord {
            latitude: 6.5244,
            longitude: 3.3792,
            address: None,
            business_name: Some("Mega Plaza".to_string()),
            source: RecordSource::UserFeedback,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["businessName"], "Mega Plaza");
        assert_eq!(json["source"], "user_feedback");
    }
}
