//! Learned coordinate regressor
//!
//! A linear model over embeddings with a bounded output transform:
//! latitude = 90·tanh(z_lat), longitude = 180·tanh(z_lon), so predictions
//! can never leave valid coordinate ranges regardless of weight drift.
//! Training minimizes great-circle distance to the ground truth; the
//! gradient of the haversine loss with respect to the predicted coordinate
//! is taken by central difference and chained through the tanh analytically.
//!
//! Weights persist to a JSON file in the data directory so a restart does
//! not lose accumulated training.

use crate::types::{CoordinateRegressor, Embedding, RegressedCoordinate, StageError};
use geolens_common::geo::{haversine_km, GeoPoint};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{info, warn};

const LEARNING_RATE: f32 = 0.01;
/// Perturbation in degrees for the numerical loss gradient
const GRAD_EPSILON: f64 = 1e-3;
/// Smoothing for the running loss average
const LOSS_EMA_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegressorWeights {
    w_lat: Vec<f32>,
    w_lon: Vec<f32>,
    b_lat: f32,
    b_lon: f32,
    /// Exponential moving average of training loss in km
    loss_ema: Option<f64>,
    steps: u64,
}

impl RegressorWeights {
    fn zeros(dimension: usize) -> Self {
        Self {
            w_lat: vec![0.0; dimension],
            w_lon: vec![0.0; dimension],
            b_lat: 0.0,
            b_lon: 0.0,
            loss_ema: None,
            steps: 0,
        }
    }
}

pub struct LinearRegressor {
    path: PathBuf,
    dimension: usize,
    state: RwLock<RegressorWeights>,
}

impl LinearRegressor {
    /// Load persisted weights, or start from zeros when the file is missing
    /// or has a different dimension.
    pub fn load(path: PathBuf, dimension: usize) -> Result<Self, geolens_common::Error> {
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<RegressorWeights>(&content) {
                Ok(weights) if weights.w_lat.len() == dimension => {
                    info!(path = %path.display(), steps = weights.steps, "Loaded regressor weights");
                    weights
                }
                Ok(weights) => {
                    warn!(
                        expected = dimension,
                        found = weights.w_lat.len(),
                        "Regressor dimension changed; starting from zeros"
                    );
                    RegressorWeights::zeros(dimension)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Regressor weights malformed; starting from zeros");
                    RegressorWeights::zeros(dimension)
                }
            }
        } else {
            RegressorWeights::zeros(dimension)
        };

        Ok(Self {
            path,
            dimension,
            state: RwLock::new(state),
        })
    }

    fn forward(weights: &RegressorWeights, embedding: &[f32]) -> (f64, f64, f64, f64) {
        let z_lat: f32 = weights
            .w_lat
            .iter()
            .zip(embedding)
            .map(|(w, x)| w * x)
            .sum::<f32>()
            + weights.b_lat;
        let z_lon: f32 = weights
            .w_lon
            .iter()
            .zip(embedding)
            .map(|(w, x)| w * x)
            .sum::<f32>()
            + weights.b_lon;

        let t_lat = (z_lat as f64).tanh();
        let t_lon = (z_lon as f64).tanh();
        (90.0 * t_lat, 180.0 * t_lon, t_lat, t_lon)
    }

    /// d(loss)/d(coordinate) by central difference, holding the other fixed
    fn loss_gradient(
        lat: f64,
        lon: f64,
        target: GeoPoint,
    ) -> (f64, f64) {
        let loss_at = |lat: f64, lon: f64| -> f64 {
            let p = GeoPoint {
                latitude: lat.clamp(-90.0, 90.0),
                longitude: lon.clamp(-180.0, 180.0),
            };
            haversine_km(p, target)
        };

        let d_lat = (loss_at(lat + GRAD_EPSILON, lon) - loss_at(lat - GRAD_EPSILON, lon))
            / (2.0 * GRAD_EPSILON);
        let d_lon = (loss_at(lat, lon + GRAD_EPSILON) - loss_at(lat, lon - GRAD_EPSILON))
            / (2.0 * GRAD_EPSILON);
        (d_lat, d_lon)
    }

    fn persist(&self, weights: &RegressorWeights) -> Result<(), StageError> {
        let json = serde_json::to_string(weights)
            .map_err(|e| StageError::Internal(format!("weights serialize failed: {}", e)))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StageError::Internal(format!("weights dir create failed: {}", e)))?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)
            .map_err(|e| StageError::Internal(format!("weights write failed: {}", e)))?;
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| StageError::Internal(format!("weights rename failed: {}", e)))?;
        Ok(())
    }

    /// Running loss average in km, if any training has happened
    pub async fn loss_ema(&self) -> Option<f64> {
        self.state.read().await.loss_ema
    }

    pub async fn training_steps(&self) -> u64 {
        self.state.read().await.steps
    }
}

#[async_trait::async_trait]
impl CoordinateRegressor for LinearRegressor {
    fn name(&self) -> &'static str {
        "linear"
    }

    async fn predict(&self, embedding: &Embedding) -> Result<RegressedCoordinate, StageError> {
        if embedding.dimension() != self.dimension {
            return Err(StageError::Internal(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                embedding.dimension()
            )));
        }

        let state = self.state.read().await;
        let (latitude, longitude, _, _) = Self::forward(&state, embedding.as_slice());

        // Untrained or lightly trained models are near the origin; confidence
        // decays with the running error so callers can discount stale models.
        let confidence = match state.loss_ema {
            Some(ema) => (1.0 / (1.0 + ema / 100.0)).clamp(0.05, 0.95) as f32,
            None => 0.05,
        };

        Ok(RegressedCoordinate {
            latitude,
            longitude,
            confidence,
        })
    }

    async fn train_step(
        &self,
        embedding: &Embedding,
        latitude: f64,
        longitude: f64,
    ) -> Result<f64, StageError> {
        if embedding.dimension() != self.dimension {
            return Err(StageError::Internal(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                embedding.dimension()
            )));
        }
        let Some(target) = GeoPoint::new(latitude, longitude) else {
            return Err(StageError::Internal(format!(
                "invalid training target: {}, {}",
                latitude, longitude
            )));
        };

        let mut state = self.state.write().await;
        let (pred_lat, pred_lon, t_lat, t_lon) = Self::forward(&state, embedding.as_slice());

        let predicted = GeoPoint {
            latitude: pred_lat,
            longitude: pred_lon,
        };
        let loss_km = haversine_km(predicted, target);

        let (d_lat, d_lon) = Self::loss_gradient(pred_lat, pred_lon, target);

        // Chain through the output transform: d(lat)/d(z) = 90(1 - tanh²)
        let grad_z_lat = (d_lat * 90.0 * (1.0 - t_lat * t_lat)) as f32;
        let grad_z_lon = (d_lon * 180.0 * (1.0 - t_lon * t_lon)) as f32;

        for (w, x) in state.w_lat.iter_mut().zip(embedding.as_slice()) {
            *w -= LEARNING_RATE * grad_z_lat * x;
        }
        for (w, x) in state.w_lon.iter_mut().zip(embedding.as_slice()) {
            *w -= LEARNING_RATE * grad_z_lon * x;
        }
        state.b_lat -= LEARNING_RATE * grad_z_lat;
        state.b_lon -= LEARNING_RATE * grad_z_lon;

        state.loss_ema = Some(match state.loss_ema {
            Some(ema) => ema * (1.0 - LOSS_EMA_ALPHA) + loss_km * LOSS_EMA_ALPHA,
            None => loss_km,
        });
        state.steps += 1;

        self.persist(&state)?;

        tracing::debug!(loss_km = loss_km, steps = state.steps, "Regressor training step");
        Ok(loss_km)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_regressor(dimension: usize) -> (LinearRegressor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let regressor = LinearRegressor::load(dir.path().join("weights.json"), dimension).unwrap();
        (regressor, dir)
    }

    #[tokio::test]
    async fn test_untrained_predicts_origin() {
        let (regressor, _dir) = test_regressor(4);
        let prediction = regressor
            .predict(&Embedding::new(vec![0.5, 0.5, 0.5, 0.5]))
            .await
            .unwrap();
        assert_eq!(prediction.latitude, 0.0);
        assert_eq!(prediction.longitude, 0.0);
        assert!(prediction.confidence <= 0.1);
    }

    #[tokio::test]
    async fn test_output_always_in_range() {
        let (regressor, _dir) = test_regressor(2);
        let e = Embedding::new(vec![1.0, 0.0]);
        // Train hard toward one corner; output must stay bounded
        for _ in 0..200 {
            regressor.train_step(&e, 89.0, 179.0).await.unwrap();
        }
        let p = regressor.predict(&e).await.unwrap();
        assert!(p.latitude.abs() <= 90.0);
        assert!(p.longitude.abs() <= 180.0);
    }

    #[tokio::test]
    async fn test_training_reduces_loss() {
        let (regressor, _dir) = test_regressor(4);
        let e = Embedding::new(vec![0.1, 0.9, 0.3, 0.2]);

        let first = regressor.train_step(&e, 6.5244, 3.3792).await.unwrap();
        let mut last = first;
        for _ in 0..100 {
            last = regressor.train_step(&e, 6.5244, 3.3792).await.unwrap();
        }
        assert!(last < first);
    }

    #[tokio::test]
    async fn test_invalid_target_rejected() {
        let (regressor, _dir) = test_regressor(2);
        let e = Embedding::new(vec![1.0, 0.0]);
        assert!(regressor.train_step(&e, f64::NAN, 3.0).await.is_err());
        assert!(regressor.train_step(&e, 95.0, 3.0).await.is_err());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let (regressor, _dir) = test_regressor(4);
        let e = Embedding::new(vec![1.0, 0.0]);
        assert!(regressor.predict(&e).await.is_err());
    }

    #[tokio::test]
    async fn test_weights_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.json");
        let e = Embedding::new(vec![0.3, 0.7]);

        {
            let regressor = LinearRegressor::load(path.clone(), 2).unwrap();
            for _ in 0..50 {
                regressor.train_step(&e, 10.0, 20.0).await.unwrap();
            }
        }

        let reloaded = LinearRegressor::load(path, 2).unwrap();
        assert_eq!(reloaded.training_steps().await, 50);
        let p = reloaded.predict(&e).await.unwrap();
        assert!(p.latitude != 0.0 || p.longitude != 0.0);
    }
}
