//! Fusion engine: the fallback chain over all recognition strategies
//!
//! Strategy order, first hit wins:
//! 1. Exact hash match against the index (confidence 1.0)
//! 2. Vector similarity with score-weighted averaging of the top matches
//! 3. OCR text extraction followed by geocoding of candidate fragments
//! 4. Landmark classification (enrichment only; boosts the fallback)
//! 5. Learned coordinate regression
//!
//! Stage failures never abort the chain. A timeout, network error, or parse
//! failure in one stage logs a warning and falls through to the next, so a
//! dead OCR service degrades accuracy rather than availability.

use crate::config::MlConfig;
use crate::extractors::select_candidates;
use crate::types::{
    CoordinateRegressor, Embedding, EmbeddingProvider, Geocoder, IndexMatch, LandmarkClassifier,
    LandmarkPrediction, LocationRecord, PredictionMethod, PredictionResult, StageError,
    TextExtractor, VectorIndex,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Number of top matches blended in the similarity stage
const BLEND_TOP_N: usize = 3;

/// Deterministic index id for an image's exact bytes
pub fn location_id(image_bytes: &[u8]) -> String {
    let digest = format!("{:x}", Sha256::digest(image_bytes));
    format!("loc_{}", &digest[..16])
}

pub struct FusionEngine {
    config: MlConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    text_extractor: Option<Arc<dyn TextExtractor>>,
    geocoder: Option<Arc<dyn Geocoder>>,
    landmark_classifier: Option<Arc<dyn LandmarkClassifier>>,
    regressor: Arc<dyn CoordinateRegressor>,
}

impl FusionEngine {
    pub fn new(
        config: MlConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        text_extractor: Option<Arc<dyn TextExtractor>>,
        geocoder: Option<Arc<dyn Geocoder>>,
        landmark_classifier: Option<Arc<dyn LandmarkClassifier>>,
        regressor: Arc<dyn CoordinateRegressor>,
    ) -> Self {
        Self {
            config,
            embedder,
            index,
            text_extractor,
            geocoder,
            landmark_classifier,
            regressor,
        }
    }

    pub fn embedder_name(&self) -> &'static str {
        self.embedder.name()
    }

    pub fn ocr_available(&self) -> bool {
        self.text_extractor.is_some() && self.geocoder.is_some()
    }

    pub fn landmark_available(&self) -> bool {
        self.landmark_classifier.is_some()
    }

    pub async fn index_size(&self) -> usize {
        self.index.size().await
    }

    /// Run the full fallback chain. Never errors: exhausting every strategy
    /// is an expected outcome reported through `PredictionMethod::Failed`.
    pub async fn predict_location(&self, image_bytes: &[u8]) -> PredictionResult {
        let mut attempted: Vec<&str> = Vec::new();
        let stage_budget = Duration::from_secs(self.config.stage_timeout_secs);

        // Stage 1: exact hash match
        attempted.push("exact_match");
        if let Some(result) = self.try_exact_match(image_bytes).await {
            return result;
        }

        // The embedding feeds both the similarity stage and the regressor
        let embedding = match tokio::time::timeout(
            stage_budget,
            self.embedder.encode(image_bytes),
        )
        .await
        {
            Ok(Ok(embedding)) => Some(embedding),
            Ok(Err(e)) => {
                warn!(provider = self.embedder.name(), error = %e, "Embedding stage failed");
                None
            }
            Err(_) => {
                warn!(provider = self.embedder.name(), "Embedding stage timed out");
                None
            }
        };

        // Stage 2: vector similarity
        if let Some(embedding) = &embedding {
            attempted.push("similarity");
            if let Some(result) = self.try_similarity(embedding).await {
                return result;
            }
        }

        // Stage 3: OCR + geocoding
        if self.ocr_available() {
            attempted.push("ocr_geocoding");
            if let Some(result) = self.try_ocr_geocoding(image_bytes, stage_budget).await {
                return result;
            }
        }

        // Stage 4: landmark classification. No coordinate on its own, but a
        // confident landmark raises trust in the regressor fallback.
        let landmark = if self.landmark_classifier.is_some() {
            attempted.push("landmark_recognition");
            self.try_landmark(image_bytes, stage_budget).await
        } else {
            None
        };

        // Stage 5: learned regression
        if let Some(embedding) = &embedding {
            attempted.push("geolocation_model");
            if let Some(result) = self.try_regressor(embedding, landmark.as_ref()).await {
                return result;
            }
        }

        info!(strategies = attempted.len(), "All strategies exhausted");
        PredictionResult::failed("Could not determine location for this image", &attempted)
    }

    async fn try_exact_match(&self, image_bytes: &[u8]) -> Option<PredictionResult> {
        let id = location_id(image_bytes);
        let found = match self.index.fetch(std::slice::from_ref(&id)).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "Exact-match lookup failed");
                return None;
            }
        };
        let entry = found.get(&id)?;

        debug!(id = %id, "Exact hash match");
        Some(PredictionResult {
            latitude: Some(entry.record.latitude),
            longitude: Some(entry.record.longitude),
            confidence: 1.0,
            method: PredictionMethod::ExactMatch,
            details: serde_json::json!({
                "matched_id": id,
                "address": entry.record.address,
                "businessName": entry.record.business_name,
            }),
        })
    }

    async fn try_similarity(&self, embedding: &Embedding) -> Option<PredictionResult> {
        let matches = match self.index.query(embedding, self.config.top_k).await {
            Ok(matches) => matches,
            Err(e) => {
                warn!(error = %e, "Similarity query failed");
                return None;
            }
        };

        let best = matches.first()?;
        // Threshold is inclusive: a score exactly at it counts as a match
        if best.score < self.config.similarity_threshold {
            debug!(
                best_score = best.score,
                threshold = self.config.similarity_threshold,
                "Best similarity below threshold"
            );
            return None;
        }

        let confidence = best.score;
        let (latitude, longitude) = blend_matches(&matches[..matches.len().min(BLEND_TOP_N)]);

        let similar: Vec<serde_json::Value> = matches
            .iter()
            .map(|m| {
                serde_json::json!({
                    "id": m.id,
                    "score": m.score,
                    "latitude": m.record.latitude,
                    "longitude": m.record.longitude,
                    "address": m.record.address,
                    "businessName": m.record.business_name,
                })
            })
            .collect();

        debug!(best_score = best.score, blended = matches.len().min(BLEND_TOP_N), "Similarity match");
        Some(PredictionResult {
            latitude: Some(latitude),
            longitude: Some(longitude),
            confidence,
            method: PredictionMethod::Similarity,
            details: serde_json::json!({ "similar_locations": similar }),
        })
    }

    async fn try_ocr_geocoding(
        &self,
        image_bytes: &[u8],
        stage_budget: Duration,
    ) -> Option<PredictionResult> {
        let extractor = self.text_extractor.as_ref()?;
        let geocoder = self.geocoder.as_ref()?;

        let fragments = match tokio::time::timeout(stage_budget, extractor.extract(image_bytes))
            .await
        {
            Ok(Ok(fragments)) => fragments,
            Ok(Err(e)) => {
                warn!(extractor = extractor.name(), error = %e, "OCR stage failed");
                return None;
            }
            Err(_) => {
                warn!(extractor = extractor.name(), "OCR stage timed out");
                return None;
            }
        };

        let candidates = select_candidates(
            &fragments,
            self.config.ocr_min_confidence,
            self.config.ocr_min_fragment_len,
        );
        if candidates.is_empty() {
            debug!(fragments = fragments.len(), "No geocodable text candidates");
            return None;
        }

        let geocode_budget = Duration::from_secs(self.config.geocode_timeout_secs);
        for candidate in &candidates {
            let geocoded = match tokio::time::timeout(geocode_budget, geocoder.geocode(candidate))
                .await
            {
                Ok(Ok(geocoded)) => geocoded,
                Ok(Err(e)) => {
                    warn!(text = %candidate, error = %e, "Geocoding failed; trying next fragment");
                    continue;
                }
                Err(_) => {
                    warn!(text = %candidate, "Geocoding timed out; trying next fragment");
                    continue;
                }
            };

            if let Some(geocoded) = geocoded {
                debug!(text = %candidate, address = %geocoded.formatted_address, "Geocoded OCR fragment");
                return Some(PredictionResult {
                    latitude: Some(geocoded.latitude),
                    longitude: Some(geocoded.longitude),
                    confidence: self.config.geocode_confidence,
                    method: PredictionMethod::OcrGeocoding,
                    details: serde_json::json!({
                        "extracted_text": candidate,
                        "address": geocoded.formatted_address,
                        "all_texts": candidates,
                    }),
                });
            }
        }

        None
    }

    async fn try_landmark(
        &self,
        image_bytes: &[u8],
        stage_budget: Duration,
    ) -> Option<LandmarkPrediction> {
        let classifier = self.landmark_classifier.as_ref()?;

        let predictions = match tokio::time::timeout(
            stage_budget,
            classifier.classify(image_bytes, self.config.top_k),
        )
        .await
        {
            Ok(Ok(predictions)) => predictions,
            Ok(Err(e)) => {
                warn!(classifier = classifier.name(), error = %e, "Landmark stage failed");
                return None;
            }
            Err(_) => {
                warn!(classifier = classifier.name(), "Landmark stage timed out");
                return None;
            }
        };

        let top = predictions.into_iter().next()?;
        if top.confidence > self.config.landmark_threshold {
            debug!(class = %top.class_name, confidence = top.confidence, "Landmark detected");
            Some(top)
        } else {
            None
        }
    }

    async fn try_regressor(
        &self,
        embedding: &Embedding,
        landmark: Option<&LandmarkPrediction>,
    ) -> Option<PredictionResult> {
        let predicted = match self.regressor.predict(embedding).await {
            Ok(predicted) => predicted,
            Err(e) => {
                warn!(regressor = self.regressor.name(), error = %e, "Regressor stage failed");
                return None;
            }
        };

        if !geolens_common::geo::is_valid_coordinate(predicted.latitude, predicted.longitude) {
            warn!(
                latitude = predicted.latitude,
                longitude = predicted.longitude,
                "Regressor produced out-of-range coordinate"
            );
            return None;
        }

        // The coordinates come from the regressor either way; a confident
        // landmark only raises trust in them and rides along in details
        let (confidence, details) = match landmark {
            Some(landmark) => {
                let boosted = (self.config.regressor_confidence_landmark
                    * self.config.landmark_boost)
                    .min(self.config.landmark_boost_cap);
                (
                    boosted,
                    serde_json::json!({
                        "landmark": {
                            "class_id": landmark.class_id,
                            "class_name": landmark.class_name,
                            "confidence": landmark.confidence,
                        },
                        "model": self.regressor.name(),
                    }),
                )
            }
            None => (
                self.config.regressor_confidence,
                serde_json::json!({ "model": self.regressor.name() }),
            ),
        };

        Some(PredictionResult {
            latitude: Some(predicted.latitude),
            longitude: Some(predicted.longitude),
            confidence,
            method: PredictionMethod::GeolocationModel,
            details,
        })
    }

    /// Encode and index an image with known coordinates. Re-submitting the
    /// same bytes overwrites the existing entry (same id), so this is
    /// idempotent.
    pub async fn add_building_to_index(
        &self,
        image_bytes: &[u8],
        record: LocationRecord,
    ) -> Result<String, StageError> {
        let id = location_id(image_bytes);
        let embedding = self.embedder.encode(image_bytes).await?;
        self.index.upsert(id.clone(), embedding, record).await?;
        info!(id = %id, "Indexed location");
        Ok(id)
    }
}

/// Score-weighted average of match coordinates. With degenerate scores
/// (sum at or below zero) the best match's coordinates are used as-is.
fn blend_matches(matches: &[IndexMatch]) -> (f64, f64) {
    let total: f64 = matches.iter().map(|m| m.score.max(0.0) as f64).sum();
    if total <= f64::EPSILON {
        return (matches[0].record.latitude, matches[0].record.longitude);
    }

    let mut latitude = 0.0;
    let mut longitude = 0.0;
    for m in matches {
        let weight = m.score.max(0.0) as f64 / total;
        latitude += m.record.latitude * weight;
        longitude += m.record.longitude * weight;
    }
    (latitude, longitude)
}
