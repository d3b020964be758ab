//! Continuous training cycle
//!
//! Consumes the feedback queue in batches: exports the batch to a dated
//! directory for auditability, runs one online gradient step per sample,
//! indexes each sample's embedding for future exact and similarity matches,
//! and registers the resulting model version.
//!
//! One bad sample never aborts a cycle; it is logged and skipped. The queue
//! is only consumed after the cycle has actually trained on something, so
//! an aborted cycle loses nothing.

use crate::fusion::engine::location_id;
use crate::learning::queue::{ActiveLearningQueue, FeedbackSample};
use crate::monitor::{ModelMetrics, ModelRegistry};
use crate::types::{
    CoordinateRegressor, EmbeddingProvider, LocationRecord, RecordSource, StageError, VectorIndex,
};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, serde::Serialize)]
pub struct TrainingOutcome {
    pub version: String,
    pub samples_processed: usize,
    pub mean_loss_km: Option<f64>,
}

pub struct ContinuousTrainer {
    data_dir: PathBuf,
    min_viable_batch: usize,
    queue: Arc<ActiveLearningQueue>,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    regressor: Arc<dyn CoordinateRegressor>,
    registry: Arc<ModelRegistry>,
    // One cycle at a time: the background loop and the HTTP trigger share
    // this lock
    cycle_lock: Mutex<()>,
}

impl ContinuousTrainer {
    pub fn new(
        data_dir: PathBuf,
        min_viable_batch: usize,
        queue: Arc<ActiveLearningQueue>,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        regressor: Arc<dyn CoordinateRegressor>,
        registry: Arc<ModelRegistry>,
    ) -> Self {
        Self {
            data_dir,
            min_viable_batch,
            queue,
            embedder,
            index,
            regressor,
            registry,
            cycle_lock: Mutex::new(()),
        }
    }

    /// Run one training cycle if the queue warrants it.
    ///
    /// Returns `None` when no retraining trigger fired or the usable batch
    /// was too small; in both cases the queue is left untouched.
    pub async fn run_training_cycle(&self) -> geolens_common::Result<Option<TrainingOutcome>> {
        let _guard = self.cycle_lock.lock().await;

        if !self.queue.should_retrain().await {
            return Ok(None);
        }

        let batch = self.queue.get_training_batch(None).await;
        let usable: Vec<&FeedbackSample> = batch
            .iter()
            .filter(|s| {
                let exists = Path::new(&s.image_path).exists();
                if !exists {
                    warn!(path = %s.image_path, "Queued image missing on disk; skipping");
                }
                exists
            })
            .collect();

        if usable.len() < self.min_viable_batch {
            warn!(
                usable = usable.len(),
                required = self.min_viable_batch,
                "Batch below viable size; keeping queue for next cycle"
            );
            return Ok(None);
        }

        let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let export_dir = self
            .data_dir
            .join("batches")
            .join(format!("batch_{}", stamp))
            .join("train");
        std::fs::create_dir_all(&export_dir)?;

        let mut processed: Vec<String> = Vec::new();
        let mut losses: Vec<f64> = Vec::new();

        for (i, sample) in usable.iter().enumerate() {
            match self.train_one(i, sample, &export_dir).await {
                Ok(loss_km) => {
                    losses.push(loss_km);
                    processed.push(sample.image_path.clone());
                }
                Err(e) => {
                    warn!(path = %sample.image_path, error = %e, "Sample failed; continuing cycle");
                }
            }
        }

        if processed.is_empty() {
            warn!("Every sample in the batch failed; queue left untouched");
            return Ok(None);
        }

        self.queue.mark_trained(&processed).await?;

        let mean_loss = if losses.is_empty() {
            None
        } else {
            Some(losses.iter().sum::<f64>() / losses.len() as f64)
        };
        let version = format!("active_{}", stamp);
        self.registry
            .register_model(
                version.clone(),
                ModelMetrics {
                    mean_error_km: mean_loss,
                    samples: processed.len(),
                },
            )
            .await?;

        info!(
            version = %version,
            samples = processed.len(),
            mean_loss_km = ?mean_loss,
            "Training cycle complete"
        );
        Ok(Some(TrainingOutcome {
            version,
            samples_processed: processed.len(),
            mean_loss_km: mean_loss,
        }))
    }

    /// Export, embed, train, and index one sample. Returns the sample's
    /// training loss in km.
    async fn train_one(
        &self,
        position: usize,
        sample: &FeedbackSample,
        export_dir: &Path,
    ) -> Result<f64, StageError> {
        // Validity was checked when the batch was drawn
        let (Some(latitude), Some(longitude)) = (sample.metadata.latitude, sample.metadata.longitude)
        else {
            return Err(StageError::Internal("sample lost its coordinates".to_string()));
        };

        let image_bytes = std::fs::read(&sample.image_path)
            .map_err(|e| StageError::Internal(format!("read {} failed: {}", sample.image_path, e)))?;

        let extension = Path::new(&sample.image_path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("jpg");
        let stem = format!("sample_{:05}", position);
        std::fs::write(export_dir.join(format!("{}.{}", stem, extension)), &image_bytes)
            .map_err(|e| StageError::Internal(format!("export image failed: {}", e)))?;
        let metadata_json = serde_json::to_string_pretty(&sample.metadata)
            .map_err(|e| StageError::Internal(format!("export metadata failed: {}", e)))?;
        std::fs::write(export_dir.join(format!("{}.json", stem)), metadata_json)
            .map_err(|e| StageError::Internal(format!("export metadata failed: {}", e)))?;

        let embedding = self.embedder.encode(&image_bytes).await?;
        let loss_km = self
            .regressor
            .train_step(&embedding, latitude, longitude)
            .await?;

        let source = if sample.metadata.correction {
            RecordSource::Correction
        } else {
            RecordSource::UserFeedback
        };
        self.index
            .upsert(
                location_id(&image_bytes),
                embedding,
                LocationRecord {
                    latitude,
                    longitude,
                    address: sample.metadata.address.clone(),
                    business_name: sample.metadata.business_name.clone(),
                    source,
                },
            )
            .await?;

        Ok(loss_km)
    }
}
