//! Prediction monitoring and model registry

pub mod monitor;
pub mod registry;

pub use monitor::{MonitorMetrics, PredictionMonitor};
pub use registry::{ModelEntry, ModelMetrics, ModelRegistry};
