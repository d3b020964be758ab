//! Feedback sample queue for active learning
//!
//! Samples arrive from three paths: explicit user feedback, user
//! corrections of bad predictions, and auto-captured high-confidence
//! predictions. The queue lives in a single JSON file and every mutation
//! happens under one lock with a write-temp-then-rename persist, so
//! concurrent requests cannot interleave a read-modify-write and lose
//! samples.
//!
//! Samples with missing or non-finite coordinates are kept in the file
//! (they still tell us the user engaged) but never count toward retraining
//! and never reach the trainer.

use chrono::{DateTime, Utc};
use geolens_common::geo::is_valid_coordinate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Normal,
    High,
}

/// Ground-truth metadata attached to a queued sample.
///
/// Coordinates are optional because serde turns non-finite floats into
/// null; a sample only counts as trainable when both are present, finite,
/// and in range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleMetadata {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(rename = "businessName", skip_serializing_if = "Option::is_none")]
    pub business_name: Option<String>,
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// True when this sample corrects an earlier prediction
    #[serde(default)]
    pub correction: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackSample {
    /// Path of the saved image on disk
    pub image_path: String,
    pub metadata: SampleMetadata,
    pub priority: Priority,
    pub added_at: DateTime<Utc>,
}

impl FeedbackSample {
    /// Trainable: both coordinates present, finite, and in range
    pub fn is_valid(&self) -> bool {
        match (self.metadata.latitude, self.metadata.longitude) {
            (Some(lat), Some(lon)) => is_valid_coordinate(lat, lon),
            _ => false,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueFile {
    samples: Vec<FeedbackSample>,
    last_training: Option<DateTime<Utc>>,
}

/// Retraining trigger thresholds, taken from `MlConfig`
#[derive(Debug, Clone, Copy)]
pub struct RetrainPolicy {
    /// Valid-sample count that triggers retraining
    pub min_samples: usize,
    /// High-priority valid-sample count that forces retraining early
    pub high_priority_trigger: usize,
    /// Backstop valid-sample count that triggers retraining regardless of
    /// priority mix
    pub absolute_floor: usize,
}

pub struct ActiveLearningQueue {
    path: PathBuf,
    policy: RetrainPolicy,
    state: Mutex<QueueFile>,
}

impl ActiveLearningQueue {
    /// Load the queue file, starting empty when missing.
    ///
    /// A malformed file is renamed aside (`.corrupt`) and a fresh queue
    /// starts in its place; feedback collection must not stay down because
    /// one write was interrupted.
    pub fn load(path: PathBuf, policy: RetrainPolicy) -> Result<Self, geolens_common::Error> {
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<QueueFile>(&content) {
                Ok(queue) => {
                    info!(path = %path.display(), samples = queue.samples.len(), "Loaded training queue");
                    queue
                }
                Err(e) => {
                    let corrupt_path = path.with_extension("json.corrupt");
                    warn!(
                        path = %path.display(),
                        error = %e,
                        moved_to = %corrupt_path.display(),
                        "Training queue malformed; starting empty"
                    );
                    std::fs::rename(&path, &corrupt_path)?;
                    QueueFile::default()
                }
            }
        } else {
            QueueFile::default()
        };

        Ok(Self {
            path,
            policy,
            state: Mutex::new(state),
        })
    }

    fn persist(&self, state: &QueueFile) -> geolens_common::Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Append a sample. The file is written before this returns, so an
    /// acknowledged sample survives a crash.
    pub async fn add_sample(
        &self,
        image_path: String,
        metadata: SampleMetadata,
        priority: Priority,
    ) -> geolens_common::Result<usize> {
        let mut state = self.state.lock().await;
        state.samples.push(FeedbackSample {
            image_path,
            metadata,
            priority,
            added_at: Utc::now(),
        });
        self.persist(&state)?;
        info!(queue_size = state.samples.len(), priority = ?priority, "Queued training sample");
        Ok(state.samples.len())
    }

    /// Queue a correction of a wrong prediction. Corrections carry the most
    /// signal, so they always enter at high priority.
    pub async fn add_user_correction(
        &self,
        image_path: String,
        mut metadata: SampleMetadata,
    ) -> geolens_common::Result<usize> {
        metadata.correction = true;
        self.add_sample(image_path, metadata, Priority::High).await
    }

    /// Auto-capture a confident prediction as a pseudo-labeled sample.
    /// Returns false when the confidence is below `capture_threshold`.
    pub async fn add_high_confidence_prediction(
        &self,
        image_path: String,
        latitude: f64,
        longitude: f64,
        confidence: f32,
        capture_threshold: f32,
    ) -> geolens_common::Result<bool> {
        if confidence < capture_threshold {
            return Ok(false);
        }
        self.add_sample(
            image_path,
            SampleMetadata {
                latitude: Some(latitude),
                longitude: Some(longitude),
                address: None,
                business_name: None,
                user_id: None,
                correction: false,
            },
            Priority::Normal,
        )
        .await?;
        Ok(true)
    }

    /// Whether any retraining trigger currently fires: enough valid
    /// samples, enough high-priority valid samples, or the backstop floor.
    /// Only trainable samples count toward every trigger; a queue full of
    /// coordinate-less samples never fires.
    pub async fn should_retrain(&self) -> bool {
        let state = self.state.lock().await;
        Self::should_retrain_inner(&state, self.policy)
    }

    fn should_retrain_inner(state: &QueueFile, policy: RetrainPolicy) -> bool {
        let valid = state.samples.iter().filter(|s| s.is_valid()).count();
        let high_valid = state
            .samples
            .iter()
            .filter(|s| s.is_valid() && s.priority == Priority::High)
            .count();

        valid >= policy.min_samples
            || high_valid >= policy.high_priority_trigger
            || valid >= policy.absolute_floor
    }

    /// Valid samples for training, high priority first, insertion order
    /// preserved within each priority. Does not remove anything; call
    /// `mark_trained` after the cycle succeeds.
    pub async fn get_training_batch(&self, batch_size: Option<usize>) -> Vec<FeedbackSample> {
        let state = self.state.lock().await;
        let mut batch: Vec<FeedbackSample> = state
            .samples
            .iter()
            .filter(|s| s.is_valid())
            .cloned()
            .collect();
        // Stable: ties keep insertion order
        batch.sort_by_key(|s| match s.priority {
            Priority::High => 0,
            Priority::Normal => 1,
        });
        if let Some(limit) = batch_size {
            batch.truncate(limit);
        }
        batch
    }

    /// Remove consumed samples by image path and stamp the training time
    pub async fn mark_trained(&self, image_paths: &[String]) -> geolens_common::Result<usize> {
        let mut state = self.state.lock().await;
        let before = state.samples.len();
        state
            .samples
            .retain(|s| !image_paths.contains(&s.image_path));
        let removed = before - state.samples.len();
        state.last_training = Some(Utc::now());
        self.persist(&state)?;
        info!(removed = removed, remaining = state.samples.len(), "Marked samples trained");
        Ok(removed)
    }

    pub async fn queue_size(&self) -> usize {
        self.state.lock().await.samples.len()
    }

    pub async fn last_training(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.last_training
    }

    /// Snapshot of the trainable samples, for the status surface
    pub async fn valid_samples(&self) -> Vec<FeedbackSample> {
        self.state
            .lock()
            .await
            .samples
            .iter()
            .filter(|s| s.is_valid())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetrainPolicy {
        RetrainPolicy {
            min_samples: 5,
            high_priority_trigger: 5,
            absolute_floor: 10,
        }
    }

    fn metadata(lat: f64, lon: f64) -> SampleMetadata {
        SampleMetadata {
            latitude: Some(lat),
            longitude: Some(lon),
            address: None,
            business_name: None,
            user_id: None,
            correction: false,
        }
    }

    fn test_queue() -> (ActiveLearningQueue, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let queue = ActiveLearningQueue::load(dir.path().join("training_queue.json"), policy()).unwrap();
        (queue, dir)
    }

    #[tokio::test]
    async fn test_empty_queue_does_not_retrain() {
        let (queue, _dir) = test_queue();
        assert!(!queue.should_retrain().await);
        assert_eq!(queue.queue_size().await, 0);
        assert!(queue.last_training().await.is_none());
    }

    #[tokio::test]
    async fn test_min_samples_triggers_retrain() {
        let (queue, _dir) = test_queue();
        for i in 0..5 {
            queue
                .add_sample(format!("img_{}.jpg", i), metadata(6.5, 3.3), Priority::Normal)
                .await
                .unwrap();
        }
        assert!(queue.should_retrain().await);
    }

    #[tokio::test]
    async fn test_high_priority_triggers_early() {
        // High-priority bar below the general bar
        let dir = tempfile::tempdir().unwrap();
        let queue = ActiveLearningQueue::load(
            dir.path().join("q.json"),
            RetrainPolicy {
                min_samples: 50,
                high_priority_trigger: 2,
                absolute_floor: 100,
            },
        )
        .unwrap();

        queue
            .add_user_correction("a.jpg".into(), metadata(1.0, 1.0))
            .await
            .unwrap();
        assert!(!queue.should_retrain().await);
        queue
            .add_user_correction("b.jpg".into(), metadata(2.0, 2.0))
            .await
            .unwrap();
        assert!(queue.should_retrain().await);
    }

    #[tokio::test]
    async fn test_invalid_samples_do_not_count() {
        let (queue, _dir) = test_queue();
        for i in 0..6 {
            queue
                .add_sample(
                    format!("img_{}.jpg", i),
                    SampleMetadata {
                        latitude: None,
                        longitude: Some(3.3),
                        address: None,
                        business_name: None,
                        user_id: None,
                        correction: false,
                    },
                    Priority::Normal,
                )
                .await
                .unwrap();
        }
        assert!(!queue.should_retrain().await);
        assert!(queue.get_training_batch(None).await.is_empty());
        // They still occupy the queue
        assert_eq!(queue.queue_size().await, 6);
    }

    #[tokio::test]
    async fn test_invalid_samples_never_trip_the_floor() {
        // Ten coordinate-less samples meet the default floor of 10 by raw
        // count, but none are trainable, so no trigger may fire
        let (queue, _dir) = test_queue();
        for i in 0..10 {
            queue
                .add_sample(
                    format!("img_{}.jpg", i),
                    SampleMetadata {
                        latitude: None,
                        longitude: None,
                        address: None,
                        business_name: None,
                        user_id: None,
                        correction: false,
                    },
                    Priority::Normal,
                )
                .await
                .unwrap();
        }
        assert_eq!(queue.queue_size().await, 10);
        assert!(!queue.should_retrain().await);

        // Trainable samples still count as usual
        for i in 0..5 {
            queue
                .add_sample(format!("valid_{}.jpg", i), metadata(6.5, 3.3), Priority::Normal)
                .await
                .unwrap();
        }
        assert!(queue.should_retrain().await);
    }

    #[tokio::test]
    async fn test_out_of_range_coordinates_are_invalid() {
        let (queue, _dir) = test_queue();
        queue
            .add_sample("bad.jpg".into(), metadata(95.0, 3.3), Priority::High)
            .await
            .unwrap();
        assert!(queue.get_training_batch(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_batch_orders_high_priority_first() {
        let (queue, _dir) = test_queue();
        queue
            .add_sample("n1.jpg".into(), metadata(1.0, 1.0), Priority::Normal)
            .await
            .unwrap();
        queue
            .add_user_correction("h1.jpg".into(), metadata(2.0, 2.0))
            .await
            .unwrap();
        queue
            .add_sample("n2.jpg".into(), metadata(3.0, 3.0), Priority::Normal)
            .await
            .unwrap();
        queue
            .add_user_correction("h2.jpg".into(), metadata(4.0, 4.0))
            .await
            .unwrap();

        let batch = queue.get_training_batch(None).await;
        let paths: Vec<&str> = batch.iter().map(|s| s.image_path.as_str()).collect();
        assert_eq!(paths, vec!["h1.jpg", "h2.jpg", "n1.jpg", "n2.jpg"]);
        assert!(batch[0].metadata.correction);

        // A limited batch takes every high-priority sample before any
        // normal-priority one
        let limited = queue.get_training_batch(Some(3)).await;
        let paths: Vec<&str> = limited.iter().map(|s| s.image_path.as_str()).collect();
        assert_eq!(paths, vec!["h1.jpg", "h2.jpg", "n1.jpg"]);
    }

    #[tokio::test]
    async fn test_batch_size_limit() {
        let (queue, _dir) = test_queue();
        for i in 0..8 {
            queue
                .add_sample(format!("img_{}.jpg", i), metadata(1.0, 1.0), Priority::Normal)
                .await
                .unwrap();
        }
        assert_eq!(queue.get_training_batch(Some(3)).await.len(), 3);
    }

    #[tokio::test]
    async fn test_mark_trained_removes_and_stamps() {
        let (queue, _dir) = test_queue();
        queue
            .add_sample("a.jpg".into(), metadata(1.0, 1.0), Priority::Normal)
            .await
            .unwrap();
        queue
            .add_sample("b.jpg".into(), metadata(2.0, 2.0), Priority::Normal)
            .await
            .unwrap();

        let removed = queue.mark_trained(&["a.jpg".to_string()]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(queue.queue_size().await, 1);
        assert!(queue.last_training().await.is_some());
    }

    #[tokio::test]
    async fn test_capture_gate() {
        let (queue, _dir) = test_queue();
        let captured = queue
            .add_high_confidence_prediction("low.jpg".into(), 1.0, 1.0, 0.5, 0.8)
            .await
            .unwrap();
        assert!(!captured);
        let captured = queue
            .add_high_confidence_prediction("high.jpg".into(), 1.0, 1.0, 0.9, 0.8)
            .await
            .unwrap();
        assert!(captured);
        assert_eq!(queue.queue_size().await, 1);
    }

    #[tokio::test]
    async fn test_queue_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training_queue.json");

        {
            let queue = ActiveLearningQueue::load(path.clone(), policy()).unwrap();
            queue
                .add_user_correction("a.jpg".into(), metadata(6.5244, 3.3792))
                .await
                .unwrap();
        }

        let reloaded = ActiveLearningQueue::load(path, policy()).unwrap();
        assert_eq!(reloaded.queue_size().await, 1);
        let batch = reloaded.get_training_batch(None).await;
        assert_eq!(batch[0].priority, Priority::High);
        assert_eq!(batch[0].metadata.latitude, Some(6.5244));
    }

    #[tokio::test]
    async fn test_corrupt_queue_file_recovers_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training_queue.json");
        std::fs::write(&path, "{{{{").unwrap();

        let queue = ActiveLearningQueue::load(path.clone(), policy()).unwrap();
        assert_eq!(queue.queue_size().await, 0);
        assert!(path.with_extension("json.corrupt").exists());

        // The fresh queue accepts new samples
        queue
            .add_sample("a.jpg".into(), metadata(1.0, 1.0), Priority::Normal)
            .await
            .unwrap();
        assert_eq!(queue.queue_size().await, 1);
    }
}
