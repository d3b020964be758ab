//! Prediction logging and accuracy metrics
//!
//! Every prediction with a caller-supplied image id is appended to a JSONL
//! log. Entries that later gain ground truth (user feedback) carry their
//! great-circle error, which feeds the windowed accuracy metrics used for
//! degradation detection.

use crate::types::PredictionResult;
use chrono::{DateTime, Duration, Utc};
use geolens_common::geo::{haversine_km, GeoPoint};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize)]
struct LogEntry {
    timestamp: DateTime<Utc>,
    image_id: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    confidence: f32,
    method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    true_latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    true_longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_km: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    feedback: Option<String>,
}

/// Windowed accuracy summary over the prediction log
#[derive(Debug, Clone, Serialize)]
pub struct MonitorMetrics {
    pub total_predictions: usize,
    /// Subset of predictions with ground truth and a computable error
    pub evaluated: usize,
    pub mean_error_km: Option<f64>,
    pub median_error_km: Option<f64>,
    /// Fractions of evaluated predictions within each radius
    pub accuracy_1km: Option<f64>,
    pub accuracy_5km: Option<f64>,
    pub accuracy_25km: Option<f64>,
    pub method_distribution: HashMap<String, usize>,
}

pub struct PredictionMonitor {
    log_path: PathBuf,
    // Serializes appends; reads tolerate concurrent appends because JSONL
    // lines are written whole
    write_lock: Mutex<()>,
}

impl PredictionMonitor {
    pub fn new(log_path: PathBuf) -> Self {
        Self {
            log_path,
            write_lock: Mutex::new(()),
        }
    }

    /// Append one prediction to the log, computing the error when ground
    /// truth is available.
    pub async fn log_prediction(
        &self,
        image_id: &str,
        prediction: &PredictionResult,
        ground_truth: Option<GeoPoint>,
        feedback: Option<String>,
    ) -> geolens_common::Result<()> {
        let error_km = match (prediction.latitude, prediction.longitude, ground_truth) {
            (Some(lat), Some(lon), Some(truth)) => GeoPoint::new(lat, lon)
                .map(|predicted| haversine_km(predicted, truth)),
            _ => None,
        };

        let entry = LogEntry {
            timestamp: Utc::now(),
            image_id: image_id.to_string(),
            latitude: prediction.latitude,
            longitude: prediction.longitude,
            confidence: prediction.confidence,
            method: prediction.method.as_str().to_string(),
            true_latitude: ground_truth.map(|p| p.latitude),
            true_longitude: ground_truth.map(|p| p.longitude),
            error_km,
            feedback,
        };
        let line = serde_json::to_string(&entry)?;

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Aggregate metrics over entries within the trailing window.
    ///
    /// Malformed log lines are skipped with a warning; a partially written
    /// final line after a crash must not poison every later metrics call.
    pub async fn calculate_metrics(&self, window_hours: i64) -> geolens_common::Result<MonitorMetrics> {
        let cutoff = Utc::now() - Duration::hours(window_hours);

        let mut total = 0usize;
        let mut errors: Vec<f64> = Vec::new();
        let mut methods: HashMap<String, usize> = HashMap::new();

        if self.log_path.exists() {
            let content = std::fs::read_to_string(&self.log_path)?;
            for line in content.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let entry: LogEntry = match serde_json::from_str(line) {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(error = %e, "Skipping malformed monitor log line");
                        continue;
                    }
                };
                if entry.timestamp < cutoff {
                    continue;
                }
                total += 1;
                *methods.entry(entry.method).or_insert(0) += 1;
                if let Some(error_km) = entry.error_km {
                    if error_km.is_finite() {
                        errors.push(error_km);
                    }
                }
            }
        }

        errors.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let evaluated = errors.len();

        let (mean, median, acc_1, acc_5, acc_25) = if evaluated > 0 {
            let mean = errors.iter().sum::<f64>() / evaluated as f64;
            let median = if evaluated % 2 == 1 {
                errors[evaluated / 2]
            } else {
                (errors[evaluated / 2 - 1] + errors[evaluated / 2]) / 2.0
            };
            let within = |radius: f64| {
                Some(errors.iter().filter(|e| **e <= radius).count() as f64 / evaluated as f64)
            };
            (Some(mean), Some(median), within(1.0), within(5.0), within(25.0))
        } else {
            (None, None, None, None, None)
        };

        Ok(MonitorMetrics {
            total_predictions: total,
            evaluated,
            mean_error_km: mean,
            median_error_km: median,
            accuracy_1km: acc_1,
            accuracy_5km: acc_5,
            accuracy_25km: acc_25,
            method_distribution: methods,
        })
    }
}
