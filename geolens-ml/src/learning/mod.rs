//! Active learning: feedback queue and continuous trainer

pub mod queue;
pub mod trainer;

pub use queue::{ActiveLearningQueue, FeedbackSample, Priority, RetrainPolicy, SampleMetadata};
pub use trainer::{ContinuousTrainer, TrainingOutcome};
