//! Configuration for geolens-ml
//!
//! Every numeric threshold the fusion and learning pipelines depend on is
//! configuration, not a hard constant. Resolution priority for each value:
//! ENV (`GEOLENS_*`) → TOML (`geolens-ml.toml` in the root folder) →
//! compiled default.

use geolens_common::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Service configuration with every pipeline threshold
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MlConfig {
    /// Root data directory (queue, index, monitor logs, saved images)
    pub data_dir: PathBuf,
    /// Listen address for the HTTP API
    pub bind_addr: String,

    // --- Fusion thresholds ---
    /// Minimum cosine similarity for a vector-index match (inclusive)
    pub similarity_threshold: f32,
    /// Nearest neighbors requested per similarity query
    pub top_k: usize,
    /// Minimum OCR fragment confidence considered for geocoding
    pub ocr_min_confidence: f32,
    /// Minimum fragment length considered for geocoding
    pub ocr_min_fragment_len: usize,
    /// Fixed confidence assigned to a successful OCR geocode
    pub geocode_confidence: f32,
    /// Minimum top-class confidence for landmark enrichment
    pub landmark_threshold: f32,
    /// Multiplicative confidence boost when a landmark accompanies a
    /// downstream coordinate
    pub landmark_boost: f32,
    /// Upper cap applied after the landmark boost
    pub landmark_boost_cap: f32,
    /// Regressor-fallback confidence without a landmark
    pub regressor_confidence: f32,
    /// Regressor-fallback confidence when a landmark was also detected
    pub regressor_confidence_landmark: f32,

    // --- Timeouts ---
    /// Budget for a single geocoding call, seconds
    pub geocode_timeout_secs: u64,
    /// Budget for each other pipeline stage, seconds
    pub stage_timeout_secs: u64,

    // --- Active learning ---
    /// Confidence at or above which predictions are auto-captured
    pub capture_threshold: f32,
    /// Queue size that triggers retraining
    pub min_samples: usize,
    /// High-priority sample count that forces retraining
    pub high_priority_trigger: usize,
    /// Absolute queue-size floor that triggers retraining
    pub absolute_floor: usize,
    /// Minimum valid samples required for a training cycle to consume the queue
    pub min_viable_batch: usize,
    /// Seconds between background retrain checks
    pub train_check_interval_secs: u64,

    // --- Monitoring ---
    /// Metrics window, hours
    pub metrics_window_hours: i64,
    /// Active model is swapped when current mean error exceeds the best
    /// registered model's by this factor
    pub degradation_factor: f64,

    // --- Remote collaborators (absent = degraded for that capability) ---
    pub embedding_url: Option<String>,
    pub ocr_url: Option<String>,
    pub landmark_url: Option<String>,
    pub geocoder_url: Option<String>,
    /// Embedding dimension agreed between provider and index
    pub embedding_dim: usize,
}

impl Default for MlConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            bind_addr: "127.0.0.1:8000".to_string(),
            similarity_threshold: 0.75,
            top_k: 5,
            ocr_min_confidence: 0.5,
            ocr_min_fragment_len: 5,
            geocode_confidence: 0.7,
            landmark_threshold: 0.6,
            landmark_boost: 1.2,
            landmark_boost_cap: 0.98,
            regressor_confidence: 0.3,
            regressor_confidence_landmark: 0.5,
            geocode_timeout_secs: 5,
            stage_timeout_secs: 30,
            capture_threshold: 0.8,
            min_samples: 5,
            high_priority_trigger: 5,
            absolute_floor: 10,
            min_viable_batch: 5,
            train_check_interval_secs: 3600,
            metrics_window_hours: 24,
            degradation_factor: 1.2,
            embedding_url: None,
            ocr_url: None,
            landmark_url: None,
            geocoder_url: None,
            embedding_dim: 384,
        }
    }
}

impl MlConfig {
    /// Load configuration: TOML file (if present) overlaid with ENV overrides
    pub fn load(root_folder: &Path) -> Result<Self> {
        let toml_path = root_folder.join("geolens-ml.toml");

        let mut config = if toml_path.exists() {
            let content = std::fs::read_to_string(&toml_path)?;
            let config: MlConfig = toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Parse {} failed: {}", toml_path.display(), e)))?;
            info!(path = %toml_path.display(), "Loaded TOML config");
            config
        } else {
            MlConfig::default()
        };

        if config.data_dir.is_relative() {
            config.data_dir = root_folder.join(&config.data_dir);
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// ENV overrides take priority over TOML values
    fn apply_env_overrides(&mut self) {
        for (var, target) in [
            ("GEOLENS_SIMILARITY_THRESHOLD", &mut self.similarity_threshold),
            ("GEOLENS_OCR_MIN_CONFIDENCE", &mut self.ocr_min_confidence),
            ("GEOLENS_GEOCODE_CONFIDENCE", &mut self.geocode_confidence),
            ("GEOLENS_LANDMARK_THRESHOLD", &mut self.landmark_threshold),
            ("GEOLENS_LANDMARK_BOOST", &mut self.landmark_boost),
            ("GEOLENS_LANDMARK_BOOST_CAP", &mut self.landmark_boost_cap),
            ("GEOLENS_REGRESSOR_CONFIDENCE", &mut self.regressor_confidence),
            (
                "GEOLENS_REGRESSOR_CONFIDENCE_LANDMARK",
                &mut self.regressor_confidence_landmark,
            ),
            ("GEOLENS_CAPTURE_THRESHOLD", &mut self.capture_threshold),
        ] {
            if let Some(v) = env_parse::<f32>(var) {
                *target = v;
            }
        }
        for (var, target) in [
            ("GEOLENS_TOP_K", &mut self.top_k),
            ("GEOLENS_OCR_MIN_FRAGMENT_LEN", &mut self.ocr_min_fragment_len),
            ("GEOLENS_MIN_SAMPLES", &mut self.min_samples),
            ("GEOLENS_HIGH_PRIORITY_TRIGGER", &mut self.high_priority_trigger),
            ("GEOLENS_ABSOLUTE_FLOOR", &mut self.absolute_floor),
            ("GEOLENS_MIN_VIABLE_BATCH", &mut self.min_viable_batch),
            ("GEOLENS_EMBEDDING_DIM", &mut self.embedding_dim),
        ] {
            if let Some(v) = env_parse::<usize>(var) {
                *target = v;
            }
        }
        for (var, target) in [
            ("GEOLENS_GEOCODE_TIMEOUT_SECS", &mut self.geocode_timeout_secs),
            ("GEOLENS_STAGE_TIMEOUT_SECS", &mut self.stage_timeout_secs),
            (
                "GEOLENS_TRAIN_CHECK_INTERVAL_SECS",
                &mut self.train_check_interval_secs,
            ),
        ] {
            if let Some(v) = env_parse::<u64>(var) {
                *target = v;
            }
        }
        if let Some(v) = env_parse::<i64>("GEOLENS_METRICS_WINDOW_HOURS") {
            self.metrics_window_hours = v;
        }
        if let Some(v) = env_parse::<f64>("GEOLENS_DEGRADATION_FACTOR") {
            self.degradation_factor = v;
        }
        if let Ok(v) = std::env::var("GEOLENS_BIND_ADDR") {
            if !v.trim().is_empty() {
                self.bind_addr = v;
            }
        }
        if let Ok(v) = std::env::var("GEOLENS_DATA_DIR") {
            if !v.trim().is_empty() {
                self.data_dir = PathBuf::from(v);
            }
        }
        for (var, target) in [
            ("GEOLENS_EMBEDDING_URL", &mut self.embedding_url),
            ("GEOLENS_OCR_URL", &mut self.ocr_url),
            ("GEOLENS_LANDMARK_URL", &mut self.landmark_url),
            ("GEOLENS_GEOCODER_URL", &mut self.geocoder_url),
        ] {
            if let Ok(v) = std::env::var(var) {
                if !v.trim().is_empty() {
                    *target = Some(v);
                }
            }
        }
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("similarity_threshold", self.similarity_threshold),
            ("ocr_min_confidence", self.ocr_min_confidence),
            ("geocode_confidence", self.geocode_confidence),
            ("landmark_threshold", self.landmark_threshold),
            ("capture_threshold", self.capture_threshold),
            ("regressor_confidence", self.regressor_confidence),
            ("regressor_confidence_landmark", self.regressor_confidence_landmark),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.top_k == 0 {
            return Err(Error::Config("top_k must be at least 1".to_string()));
        }
        if self.embedding_dim == 0 {
            return Err(Error::Config("embedding_dim must be at least 1".to_string()));
        }
        if self.min_viable_batch == 0 {
            warn!("min_viable_batch of 0 allows empty training cycles");
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    match std::env::var(var) {
        Ok(v) => match v.trim().parse() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                warn!(var = var, value = %v, "Ignoring unparseable env override");
                None
            }
        },
        Err(_) => None,
    }
}
